use crate::errors::{AppError, Result};
use crate::region::{IntervalFormat, Region, open_text, read_regions};
use crate::toolkit::IntervalToolkit;
use std::io::{BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tempfile::{Builder, NamedTempFile};
use tracing::{debug, info};

/// Produces raw mpileup text and library sizes for alignment files.
pub trait PileupSource: Send + Sync {
    /// One multi-sample mpileup line per covered position of `region`, samples in `bams` order.
    fn pileup(&self, bams: &[String], region: &Region) -> Result<Vec<String>>;

    /// Mapped read count per alignment file, in `bams` order.
    fn library_sizes(&self, bams: &[String]) -> Result<Vec<u64>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalTools {
    pub samtools: String,
    pub bedtools: String,
    pub fasta: Option<String>,
    /// Where captured command output and temporary BED files are written.
    pub scratch_dir: PathBuf,
}

impl ExternalTools {
    pub fn new(
        samtools: impl Into<String>,
        bedtools: impl Into<String>,
        fasta: Option<String>,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            samtools: samtools.into(),
            bedtools: bedtools.into(),
            fasta,
            scratch_dir: scratch_dir.into(),
        }
    }

    pub fn mpileup_args(&self, bams: &[String], region: &Region) -> Vec<String> {
        let mut args = vec![
            "mpileup".to_string(),
            "-B".to_string(),
            "-d".to_string(),
            "10000000".to_string(),
            "-q".to_string(),
            "0".to_string(),
            "-Q".to_string(),
            "0".to_string(),
        ];
        if let Some(fasta) = &self.fasta {
            args.push("-f".to_string());
            args.push(fasta.clone());
        }
        args.push("-r".to_string());
        args.push(region.to_samtools_region());
        args.extend(bams.iter().cloned());
        args
    }

    pub fn require(&self, cmd: &str) -> Result<()> {
        if self.exists_command(cmd) {
            Ok(())
        } else {
            Err(AppError::CommandNotFound {
                command: cmd.to_string(),
            })
        }
    }

    pub fn exists_command(&self, cmd: &str) -> bool {
        if Path::new(cmd).exists() {
            return true;
        }
        std::env::var_os("PATH").is_some_and(|paths| {
            std::env::split_paths(&paths)
                .map(|dir| dir.join(cmd))
                .any(|full| full.exists())
        })
    }

    fn write_bed(&self, regions: &[Region]) -> Result<NamedTempFile> {
        let temp = Builder::new()
            .prefix("genome_graphs_bed_")
            .suffix(".bed")
            .tempfile_in(&self.scratch_dir)
            .map_err(|err| AppError::at_path(&self.scratch_dir, err))?;
        let mut out = BufWriter::new(temp.reopen()?);
        for region in regions {
            writeln!(out, "{region}")?;
        }
        out.flush()?;
        Ok(temp)
    }

    fn run_bedtools(&self, subcommand: &str, regions: &[Region]) -> Result<Vec<Region>> {
        let input = self.write_bed(regions)?;
        let mut command = Command::new(&self.bedtools);
        command.arg(subcommand).arg("-i").arg(input.path());
        debug!(command = %self.bedtools, subcommand, n = regions.len(), "running bedtools");
        let output = self.capture_stdout_to_tempfile(command, &self.bedtools)?;
        read_regions(open_text(output.path())?, IntervalFormat::Bed)
    }

    fn capture_stdout_lines(&self, command: Command, command_name: &str) -> Result<Vec<String>> {
        let stdout_temp = self.capture_stdout_to_tempfile(command, command_name)?;
        let reader = open_text(stdout_temp.path())?;
        collect_non_empty_lines(reader)
    }

    fn capture_stdout_to_tempfile(
        &self,
        mut command: Command,
        command_name: &str,
    ) -> Result<NamedTempFile> {
        let stdout_temp = Builder::new()
            .prefix("genome_graphs_cmd_")
            .suffix(".txt")
            .tempfile_in(&self.scratch_dir)
            .map_err(|err| AppError::at_path(&self.scratch_dir, err))?;
        let stdout_file = stdout_temp.reopen()?;
        command.stdout(Stdio::from(stdout_file));

        let output = command
            .output()
            .map_err(|err| spawn_error(err, command_name))?;

        if !output.status.success() {
            return Err(AppError::CommandFailed {
                command: command_name.to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        Ok(stdout_temp)
    }
}

impl PileupSource for ExternalTools {
    fn pileup(&self, bams: &[String], region: &Region) -> Result<Vec<String>> {
        if bams.is_empty() {
            return Ok(Vec::new());
        }
        let args = self.mpileup_args(bams, region);
        info!(region = %region.to_samtools_region(), samples = bams.len(), "running mpileup");
        let mut command = Command::new(&self.samtools);
        command.args(&args);
        self.capture_stdout_lines(command, &self.samtools)
    }

    fn library_sizes(&self, bams: &[String]) -> Result<Vec<u64>> {
        bams.iter()
            .map(|bam| {
                let mut command = Command::new(&self.samtools);
                command.arg("idxstats").arg(bam);
                let lines = self.capture_stdout_lines(command, &self.samtools)?;
                let mapped = sum_mapped_reads(&lines);
                info!(bam = %bam, mapped, "library size");
                Ok(mapped)
            })
            .collect()
    }
}

/// Sorts and merges through `bedtools sort` / `bedtools merge`.
#[derive(Debug, Clone)]
pub struct BedtoolsToolkit {
    tools: ExternalTools,
}

impl BedtoolsToolkit {
    pub fn new(tools: ExternalTools) -> Self {
        Self { tools }
    }
}

impl IntervalToolkit for BedtoolsToolkit {
    fn sort(&self, regions: &[Region]) -> Result<Vec<Region>> {
        if regions.is_empty() {
            return Ok(Vec::new());
        }
        self.tools.run_bedtools("sort", regions)
    }

    fn merge(&self, regions: &[Region]) -> Result<Vec<Region>> {
        if regions.is_empty() {
            return Ok(Vec::new());
        }
        let named: Vec<Region> = regions
            .iter()
            .map(|region| Region::new(region.chrom.clone(), region.start, region.end))
            .collect();
        self.tools.run_bedtools("merge", &named)
    }
}

/// Sum of the mapped-reads column of `samtools idxstats` output.
pub fn sum_mapped_reads(lines: &[String]) -> u64 {
    lines
        .iter()
        .filter_map(|line| {
            let parts = line.split('\t').collect::<Vec<_>>();
            if parts.len() < 4 || parts[0] == "*" {
                return None;
            }
            parts[2].parse::<u64>().ok()
        })
        .sum()
}

fn spawn_error(err: std::io::Error, command_name: &str) -> AppError {
    if err.kind() == std::io::ErrorKind::NotFound {
        AppError::CommandNotFound {
            command: command_name.to_string(),
        }
    } else {
        AppError::Io(err)
    }
}

fn collect_non_empty_lines<R: BufRead>(mut reader: R) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    let mut buf = String::new();
    loop {
        buf.clear();
        let read = reader.read_line(&mut buf)?;
        if read == 0 {
            break;
        }
        let trimmed = buf.trim_end_matches(['\n', '\r']);
        if !trimmed.trim().is_empty() {
            lines.push(trimmed.to_string());
        }
    }
    Ok(lines)
}
