use crate::cli::{GraphArgs, IntervalBackend};
use crate::errors::{AppError, Result};
use crate::external_tools::{BedtoolsToolkit, ExternalTools, PileupSource};
use crate::matrix::{PileupMatrix, SampleDescriptor, rpm_factors};
use crate::pileup::COUNT_HEADER;
use crate::reference::{ReferenceGenome, sequence_rows};
use crate::region::{Region, read_regions_from};
use crate::render::{CommandRenderer, RenderRequest, Renderer, TablesOnly};
use crate::toolkit::{IntervalToolkit, NativeToolkit};
use crate::tracks::{
    IntervalIndex, NonBamRow, TrackKind, TrackSource, annotation_rows, bedgraph_rows,
    features_in_region, prefilter_track,
};
use crate::utils::dedup_preserving_order;
use crate::window::{AggregationSpec, WindowAggregator};
use crate::writer;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use std::fs;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Init,
    Prefilter,
    PerRegion,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegionStep {
    ParseBam,
    ParseNonBam,
    Aggregate,
    Emit,
}

/// Inputs resolved and validated before any region is touched.
#[derive(Debug, Clone, PartialEq)]
pub struct RunPlan {
    /// Inputs as given, duplicates included.
    pub inputs: Vec<String>,
    pub names: Vec<String>,
    pub samples: Vec<SampleDescriptor>,
    pub tracks: Vec<String>,
    pub aggregation: AggregationSpec,
}

impl RunPlan {
    /// Reads the input list from stdin when `--ibam -` was given.
    pub fn from_args(args: &GraphArgs) -> Result<Self> {
        let aggregation = Self::aggregation(args)?;
        let inputs = if args.inputs_from_stdin() {
            let mut inputs = Vec::new();
            for line in std::io::stdin().lock().lines() {
                let line = line?;
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    inputs.push(trimmed.to_string());
                }
            }
            inputs
        } else {
            args.inputs.clone()
        };
        Self::build(args, inputs, aggregation)
    }

    pub fn build(args: &GraphArgs, inputs: Vec<String>, aggregation: AggregationSpec) -> Result<Self> {
        if inputs.is_empty() && !args.replot {
            return Err(AppError::config("no input files given"));
        }
        let names = if args.names.is_empty() {
            inputs.clone()
        } else if args.names.len() == inputs.len() {
            args.names.clone()
        } else {
            return Err(AppError::InvalidValue {
                flag: "--names".to_string(),
                value: args.names.join(" "),
                reason: format!("got {} names for {} inputs", args.names.len(), inputs.len()),
            });
        };

        let mut samples = Vec::new();
        let mut tracks = Vec::new();
        for path in dedup_preserving_order(&inputs) {
            if path.ends_with(".bam") {
                // Count columns are keyed by input path; display names only reach the renderer.
                samples.push(SampleDescriptor {
                    name: path.clone(),
                    path,
                });
            } else {
                tracks.push(path);
            }
        }

        Ok(Self {
            inputs,
            names,
            samples,
            tracks,
            aggregation,
        })
    }

    /// Window count is raised to `maxseq` so base-resolution plots are never windowed.
    pub fn aggregation(args: &GraphArgs) -> Result<AggregationSpec> {
        let mut nwinds = args.nwinds;
        let maxseq = usize::try_from(args.maxseq).unwrap_or(usize::MAX);
        if nwinds < maxseq {
            warn!(nwinds, maxseq, "nwinds reset to maxseq");
            nwinds = maxseq;
        }
        AggregationSpec::new(&args.group_fun, nwinds)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionFailure {
    pub region: String,
    pub reason: String,
}

/// Renderer result for one region; `drawn` is false when only tables were written.
#[derive(Debug)]
struct RenderedRegion {
    drawn: bool,
    document: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub processed: usize,
    pub rendered: usize,
    pub failed: Vec<RegionFailure>,
    pub documents: Vec<PathBuf>,
}

impl RunSummary {
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// External capabilities the processor delegates to.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub toolkit: &'a dyn IntervalToolkit,
    pub pileup: &'a dyn PileupSource,
    pub renderer: &'a dyn Renderer,
}

/// Working-file names for one region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionTables {
    pub stem: String,
    pub sequence: PathBuf,
    pub mpileup: PathBuf,
    pub grouped: PathBuf,
    pub nonbam: PathBuf,
    pub params: PathBuf,
    pub document: PathBuf,
}

impl RegionTables {
    pub fn new(workdir: &Path, region: &Region) -> Self {
        let stem = region.file_stem();
        let at = |suffix: &str| workdir.join(format!("{stem}.{suffix}"));
        Self {
            sequence: at("seq.txt"),
            mpileup: at("mpileup.bed.txt"),
            grouped: at("grp.bed.txt"),
            nonbam: at("nonbam.bed.txt"),
            params: at("params.txt"),
            document: at("pdf"),
            stem,
        }
    }
}

pub struct RegionProcessor<'a> {
    args: &'a GraphArgs,
    collaborators: Collaborators<'a>,
    workdir: PathBuf,
    outdir: PathBuf,
    reference: Option<ReferenceGenome>,
    state: ProcessorState,
}

impl<'a> RegionProcessor<'a> {
    pub fn new(
        args: &'a GraphArgs,
        collaborators: Collaborators<'a>,
        workdir: impl Into<PathBuf>,
        outdir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let reference = match (&args.fasta, args.replot) {
            (Some(fasta), false) => Some(ReferenceGenome::open(fasta)?),
            _ => None,
        };
        Ok(Self {
            args,
            collaborators,
            workdir: workdir.into(),
            outdir: outdir.into(),
            reference,
            state: ProcessorState::Init,
        })
    }

    pub fn state(&self) -> ProcessorState {
        self.state
    }

    pub fn run(&mut self, plan: &RunPlan, regions: &[Region]) -> Result<RunSummary> {
        match self.run_states(plan, regions) {
            Ok(summary) => {
                self.transition(ProcessorState::Done);
                Ok(summary)
            }
            Err(err) => {
                self.transition(ProcessorState::Failed);
                Err(err)
            }
        }
    }

    fn run_states(&mut self, plan: &RunPlan, regions: &[Region]) -> Result<RunSummary> {
        self.transition(ProcessorState::Prefilter);
        let sorted = self.collaborators.toolkit.sort(regions)?;
        let tracks = if self.args.replot {
            Vec::new()
        } else {
            let merged = self
                .collaborators
                .toolkit
                .slop_and_merge(&sorted, &self.args.slop)?;
            info!(regions = sorted.len(), merged = merged.len(), "merged slopped regions");
            self.prefilter_tracks(&plan.tracks, &merged)?
        };
        let factors = self.normalization_factors(plan)?;

        self.transition(ProcessorState::PerRegion);
        let aggregator = WindowAggregator::new(plan.aggregation);
        let mut progress = PipelineProgress::new(self.args.progress, sorted.len());
        let mut summary = RunSummary::default();

        for region in &sorted {
            info!(region = %region.file_stem(), "processing region");
            progress.on_region(region);
            match self.process_region(plan, &tracks, factors.as_deref(), &aggregator, region) {
                Ok(rendered) => {
                    summary.processed += 1;
                    if rendered.drawn {
                        summary.rendered += 1;
                    }
                    summary.documents.extend(rendered.document);
                }
                Err(err) if err.is_recoverable() && !self.args.strict => {
                    warn!(region = %region.file_stem(), error = %err, "region failed");
                    summary.failed.push(RegionFailure {
                        region: region.file_stem(),
                        reason: err.to_string(),
                    });
                    progress.on_failed();
                }
                Err(err) => return Err(err),
            }
        }
        progress.finish();

        info!(
            processed = summary.processed,
            rendered = summary.rendered,
            failed = summary.failed.len(),
            "completed region pipeline"
        );
        Ok(summary)
    }

    fn transition(&mut self, next: ProcessorState) {
        info!(from = ?self.state, to = ?next, "processor state");
        self.state = next;
    }

    fn prefilter_tracks(&self, tracks: &[String], merged: &[Region]) -> Result<Vec<TrackSource>> {
        if tracks.is_empty() {
            return Ok(Vec::new());
        }
        let index = IntervalIndex::from_regions(merged);
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.args.threads)
            .build()
            .map_err(|err| AppError::config(format!("failed to initialize rayon thread pool: {err}")))?;

        let workdir = self.workdir.as_path();
        pool.install(|| {
            tracks
                .par_iter()
                .enumerate()
                .map(|(idx, label)| {
                    let filtered = workdir.join(prefilter_name(idx, label));
                    info!(source = %label, "pre-parsing track");
                    prefilter_track(Path::new(label), &index, &filtered)?;
                    Ok(TrackSource {
                        label: label.clone(),
                        kind: TrackKind::of(label),
                        filtered,
                    })
                })
                .collect::<Result<Vec<_>>>()
        })
    }

    fn normalization_factors(&self, plan: &RunPlan) -> Result<Option<Vec<f64>>> {
        if !self.args.rpm || self.args.replot || plan.samples.is_empty() {
            return Ok(None);
        }
        let bams = sample_paths(&plan.samples);
        let sizes = self.collaborators.pileup.library_sizes(&bams)?;
        info!(library_sizes = ?sizes, "got library sizes");
        rpm_factors(&sizes).map(Some)
    }

    fn process_region(
        &mut self,
        plan: &RunPlan,
        tracks: &[TrackSource],
        factors: Option<&[f64]>,
        aggregator: &WindowAggregator,
        region: &Region,
    ) -> Result<RenderedRegion> {
        let slopped = self.args.slop.apply(region);
        let tables = RegionTables::new(&self.workdir, region);

        let (matrix_table, nonbam_table) = if self.args.replot {
            (
                tables.grouped.exists().then(|| tables.grouped.clone()),
                tables.nonbam.exists().then(|| tables.nonbam.clone()),
            )
        } else {
            let rows = sequence_rows(&slopped, self.args.maxseq, self.reference.as_mut())?;
            writer::write_sequence_table(&tables.sequence, &rows)?;
            let matrix_table = if plan.samples.is_empty() {
                None
            } else {
                self.emit_alignment_tables(plan, factors, aggregator, &slopped, &tables)?;
                Some(tables.grouped.clone())
            };
            let nonbam_table = if tracks.is_empty() {
                None
            } else {
                self.emit_track_table(tracks, aggregator, &slopped, &tables)?;
                Some(tables.nonbam.clone())
            };
            (matrix_table, nonbam_table)
        };

        log_step(&tables.stem, RegionStep::Emit);
        let request = RenderRequest {
            region: region.clone(),
            slopped,
            stem: tables.stem.clone(),
            params_path: tables.params.clone(),
            sequence_table: tables.sequence.clone(),
            matrix_table,
            nonbam_table,
            document: tables.document.clone(),
            maxseq: self.args.maxseq,
            inputs: plan.inputs.clone(),
            names: plan.names.clone(),
            count_header: COUNT_HEADER.iter().map(|symbol| symbol.to_string()).collect(),
            group_fun: plan.aggregation.function.name().to_string(),
            layout: self.args.layout,
            rpm: self.args.rpm,
        };
        writer::write_params(&tables.params, &request.params())?;

        let outcome = self
            .collaborators
            .renderer
            .render(&request)?
            .into_result(region)?;
        if self.args.verbose {
            info!(region = %tables.stem, stdout = %outcome.stdout, stderr = %outcome.stderr, "renderer output");
        } else {
            debug!(region = %tables.stem, stdout = %outcome.stdout, stderr = %outcome.stderr, "renderer output");
        }

        let drawn = outcome.drew();
        let document = match outcome.document {
            Some(document) => Some(self.publish(&document)?),
            None => None,
        };
        Ok(RenderedRegion { drawn, document })
    }

    fn emit_alignment_tables(
        &self,
        plan: &RunPlan,
        factors: Option<&[f64]>,
        aggregator: &WindowAggregator,
        slopped: &Region,
        tables: &RegionTables,
    ) -> Result<()> {
        log_step(&tables.stem, RegionStep::ParseBam);
        let bams = sample_paths(&plan.samples);
        let lines = self.collaborators.pileup.pileup(&bams, slopped)?;
        let matrix = PileupMatrix::from_pileup_lines(plan.samples.clone(), &lines, self.args.malformed)?;

        log_step(&tables.stem, RegionStep::Aggregate);
        let header = matrix.header(self.args.layout);
        let raw = matrix.to_numeric_rows(self.args.layout, None)?;
        writer::write_matrix_table(&tables.mpileup, &header, &raw)?;

        let scaled = match factors {
            Some(factors) => matrix.to_numeric_rows(self.args.layout, Some(factors))?,
            None => raw,
        };
        let grouped = aggregator.aggregate_within(&scaled, slopped)?;
        debug!(region = %tables.stem, positions = matrix.len(), rows = grouped.len(), "grouped pileup matrix");
        writer::write_matrix_table(&tables.grouped, &header, &grouped)
    }

    fn emit_track_table(
        &self,
        tracks: &[TrackSource],
        aggregator: &WindowAggregator,
        slopped: &Region,
        tables: &RegionTables,
    ) -> Result<()> {
        log_step(&tables.stem, RegionStep::ParseNonBam);
        let mut rows: Vec<NonBamRow> = Vec::new();
        for track in tracks {
            let features = features_in_region(&track.filtered, slopped)?;
            match track.kind {
                TrackKind::BedGraph => {
                    let profile = bedgraph_rows(&features, &track.label)?;
                    let windowed = aggregator.aggregate_within(&profile, slopped)?;
                    rows.extend(
                        windowed
                            .iter()
                            .map(|row| NonBamRow::from_numeric(row, &track.label)),
                    );
                }
                TrackKind::Annotation => rows.extend(annotation_rows(features, &track.label)),
            }
        }
        writer::write_nonbam_table(&tables.nonbam, &rows)
    }

    /// Copies a rendered document to the output directory when it lives elsewhere.
    fn publish(&self, document: &Path) -> Result<PathBuf> {
        let Some(file_name) = document.file_name() else {
            return Ok(document.to_path_buf());
        };
        if same_directory(&self.workdir, &self.outdir) {
            return Ok(document.to_path_buf());
        }
        let target = self.outdir.join(file_name);
        fs::copy(document, &target).map_err(|err| AppError::at_path(&target, err))?;
        Ok(target)
    }
}

/// Working directory (removed on drop unless user-supplied) and output directory.
struct Workspace {
    _temp: Option<TempDir>,
    workdir: PathBuf,
    outdir: PathBuf,
}

impl Workspace {
    fn prepare(args: &GraphArgs) -> Result<Self> {
        let (temp, workdir) = match &args.tmpdir {
            Some(dir) => {
                let path = PathBuf::from(dir);
                fs::create_dir_all(&path).map_err(|err| AppError::at_path(&path, err))?;
                (None, path)
            }
            None => {
                let temp = tempfile::Builder::new()
                    .suffix("_genome_graphs")
                    .tempdir()?;
                let path = temp.path().to_path_buf();
                (Some(temp), path)
            }
        };
        let outdir = match &args.outdir {
            Some(dir) => PathBuf::from(dir),
            None => std::env::current_dir()?,
        };
        fs::create_dir_all(&outdir).map_err(|err| AppError::at_path(&outdir, err))?;
        Ok(Self {
            _temp: temp,
            workdir,
            outdir,
        })
    }
}

pub fn run(args: &GraphArgs) -> Result<RunSummary> {
    info!(
        inputs = args.inputs.len(),
        bed = %args.bed,
        replot = args.replot,
        backend = ?args.interval_backend,
        "starting pipeline run"
    );
    let plan = RunPlan::from_args(args)?;
    if !args.replot {
        info!(
            samples = plan.samples.len(),
            tracks = plan.tracks.len(),
            "files to analyze"
        );
    }
    let regions = read_regions_from(&args.bed)?;
    let workspace = Workspace::prepare(args)?;

    let tools = ExternalTools::new(
        args.samtools.clone(),
        args.bedtools.clone(),
        args.fasta.clone(),
        workspace.workdir.clone(),
    );
    if !args.replot && !plan.samples.is_empty() {
        tools.require(&args.samtools)?;
    }
    let toolkit: Box<dyn IntervalToolkit> = match args.interval_backend {
        IntervalBackend::Native => Box::new(NativeToolkit),
        IntervalBackend::Bedtools => {
            tools.require(&args.bedtools)?;
            Box::new(BedtoolsToolkit::new(tools.clone()))
        }
    };
    let renderer: Box<dyn Renderer> = match &args.renderer {
        Some(command) => Box::new(CommandRenderer::parse(command)?),
        None => Box::new(TablesOnly),
    };

    let collaborators = Collaborators {
        toolkit: toolkit.as_ref(),
        pileup: &tools,
        renderer: renderer.as_ref(),
    };
    let mut processor =
        RegionProcessor::new(args, collaborators, &workspace.workdir, &workspace.outdir)?;
    processor.run(&plan, &regions)
}

fn sample_paths(samples: &[SampleDescriptor]) -> Vec<String> {
    samples.iter().map(|sample| sample.path.clone()).collect()
}

fn log_step(stem: &str, step: RegionStep) {
    debug!(region = %stem, step = ?step, "region step");
}

fn prefilter_name(idx: usize, label: &str) -> String {
    let base = Path::new(label)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| label.to_string());
    let base = base.strip_suffix(".gz").unwrap_or(&base);
    let sanitized: String = base
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    format!("{idx:03}.{sanitized}.prefilter")
}

fn same_directory(lhs: &Path, rhs: &Path) -> bool {
    match (fs::canonicalize(lhs), fs::canonicalize(rhs)) {
        (Ok(lhs), Ok(rhs)) => lhs == rhs,
        _ => lhs == rhs,
    }
}

#[derive(Debug)]
struct PipelineProgress {
    progress_bar: Option<ProgressBar>,
    total: usize,
    started: usize,
    failed: usize,
    finished: bool,
}

impl PipelineProgress {
    fn new(enabled: bool, total: usize) -> Self {
        let progress_bar = if enabled {
            let bar = ProgressBar::new_spinner();
            bar.set_draw_target(ProgressDrawTarget::stderr_with_hz(4));
            let style = ProgressStyle::with_template("{spinner:.green} {elapsed_precise} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            bar.set_style(style);
            bar.enable_steady_tick(Duration::from_millis(200));
            bar.set_message(format!("starting regions={total}"));
            Some(bar)
        } else {
            None
        };

        Self {
            progress_bar,
            total,
            started: 0,
            failed: 0,
            finished: false,
        }
    }

    fn on_region(&mut self, region: &Region) {
        self.started += 1;
        if let Some(bar) = &self.progress_bar {
            bar.set_message(format!(
                "region {}/{} failed={} locus={}",
                self.started,
                self.total,
                self.failed,
                region.to_samtools_region()
            ));
        }
    }

    fn on_failed(&mut self) {
        self.failed += 1;
    }

    fn finish(&mut self) {
        if let Some(bar) = &self.progress_bar {
            bar.finish_with_message(format!(
                "done regions={} failed={}",
                self.started, self.failed
            ));
        }
        self.finished = true;
    }
}

impl Drop for PipelineProgress {
    fn drop(&mut self) {
        if !self.finished
            && let Some(bar) = &self.progress_bar
        {
            bar.finish_and_clear();
        }
    }
}
