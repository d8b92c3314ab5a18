use crate::errors::{AppError, Result};
use crate::region::{IntervalFormat, Region, open_text, visit_regions};
use crate::toolkit::lappers_by_chrom;
use crate::utils::format_value;
use crate::window::NumericRow;
use rust_lapper::Lapper;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// How a non-alignment source is drawn: a numeric profile or labelled features.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    BedGraph,
    Annotation,
}

impl TrackKind {
    pub fn of(path: &str) -> Self {
        let lower = path.to_ascii_lowercase();
        let stem = lower.strip_suffix(".gz").unwrap_or(&lower);
        if stem.ends_with(".bedgraph") {
            Self::BedGraph
        } else {
            Self::Annotation
        }
    }
}

/// A non-alignment input and its pre-filtered working copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackSource {
    /// Path as given on the command line; written to the `sourceFile` column.
    pub label: String,
    pub kind: TrackKind,
    pub filtered: PathBuf,
}

/// Row of the per-region non-alignment table. `value` fills the `Z` column.
#[derive(Debug, Clone, PartialEq)]
pub struct NonBamRow {
    pub chrom: String,
    pub start: u64,
    pub end: u64,
    pub source: String,
    pub value: String,
}

impl NonBamRow {
    fn from_feature(feature: Region, source: &str) -> Self {
        Self {
            chrom: feature.chrom,
            start: feature.start,
            end: feature.end,
            source: source.to_string(),
            value: feature.name.unwrap_or_else(|| "NA".to_string()),
        }
    }

    pub fn from_numeric(row: &NumericRow, source: &str) -> Self {
        Self {
            chrom: row.chrom.clone(),
            start: row.start,
            end: row.end,
            source: source.to_string(),
            value: row.values.first().copied().map_or_else(|| "NA".to_string(), format_value),
        }
    }
}

/// Per-chromosome interval trees for overlap lookups.
#[derive(Debug, Default)]
pub struct IntervalIndex {
    by_chrom: HashMap<String, Lapper<u64, ()>>,
}

impl IntervalIndex {
    pub fn from_regions(regions: &[Region]) -> Self {
        Self {
            by_chrom: lappers_by_chrom(regions).into_iter().collect(),
        }
    }

    /// Half-open overlap test against any indexed interval.
    pub fn overlaps(&self, chrom: &str, start: u64, end: u64) -> bool {
        self.by_chrom
            .get(chrom)
            .is_some_and(|lapper| lapper.find(start, end).next().is_some())
    }
}

/// Writes the features of `source` that overlap `index` to `output` as 4-column BED.
///
/// GTF sources are converted to half-open coordinates with their feature name in column 4.
pub fn prefilter_track(source: &Path, index: &IntervalIndex, output: &Path) -> Result<usize> {
    let reader = open_text(source)?;
    let format = IntervalFormat::of(&source.to_string_lossy());
    let file = File::create(output).map_err(|err| AppError::at_path(output, err))?;
    let mut out = BufWriter::new(file);
    let mut kept = 0usize;

    visit_regions(reader, format, |feature| {
        if index.overlaps(&feature.chrom, feature.start, feature.end) {
            writeln!(out, "{feature}")?;
            kept += 1;
        }
        Ok(())
    })
    .map_err(|err| with_source(err, source))?;
    out.flush().map_err(|err| AppError::at_path(output, err))?;
    info!(source = %source.display(), kept, "pre-filtered track against merged regions");
    Ok(kept)
}

/// Features of a pre-filtered track that overlap `region`, unclipped.
pub fn features_in_region(filtered: &Path, region: &Region) -> Result<Vec<Region>> {
    let index = IntervalIndex::from_regions(std::slice::from_ref(region));
    let mut features = Vec::new();
    visit_regions(open_text(filtered)?, IntervalFormat::Bed, |feature| {
        if index.overlaps(&feature.chrom, feature.start, feature.end) {
            features.push(feature);
        }
        Ok(())
    })
    .map_err(|err| with_source(err, filtered))?;
    Ok(features)
}

pub fn annotation_rows(features: Vec<Region>, source: &str) -> Vec<NonBamRow> {
    features
        .into_iter()
        .map(|feature| NonBamRow::from_feature(feature, source))
        .collect()
}

/// bedGraph features as single-column numeric rows; the 4th column must be a number.
pub fn bedgraph_rows(features: &[Region], source: &str) -> Result<Vec<NumericRow>> {
    features
        .iter()
        .map(|feature| {
            let raw = feature.name.as_deref().unwrap_or_default();
            let score = raw.parse::<f64>().map_err(|_| {
                AppError::parse(format!(
                    "invalid bedGraph score {raw:?} at {}:{}-{} in {source}",
                    feature.chrom, feature.start, feature.end
                ))
            })?;
            Ok(NumericRow::new(
                feature.chrom.clone(),
                feature.start,
                feature.end,
                vec![score],
            ))
        })
        .collect()
}

fn with_source(err: AppError, source: &Path) -> AppError {
    match err {
        AppError::Parse { message } => AppError::parse(format!("{}: {message}", source.display())),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::{
        IntervalIndex, NonBamRow, TrackKind, annotation_rows, bedgraph_rows, features_in_region,
        prefilter_track,
    };
    use crate::region::Region;
    use crate::window::NumericRow;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::fs;
    use std::io::Write;

    #[test]
    fn classifies_sources_by_extension() {
        assert_eq!(TrackKind::of("profile.bedGraph"), TrackKind::BedGraph);
        assert_eq!(TrackKind::of("profile.bedGraph.gz"), TrackKind::BedGraph);
        assert_eq!(TrackKind::of("genes.gtf.gz"), TrackKind::Annotation);
        assert_eq!(TrackKind::of("actb_ann.bed"), TrackKind::Annotation);
    }

    #[test]
    fn index_overlap_is_half_open() {
        let index = IntervalIndex::from_regions(&[
            Region::new("chr7", 300, 400),
            Region::new("chr7", 100, 200),
            Region::new("chr7", 120, 130),
        ]);
        assert!(index.overlaps("chr7", 150, 160));
        assert!(index.overlaps("chr7", 50, 101));
        assert!(!index.overlaps("chr7", 200, 300));
        assert!(index.overlaps("chr7", 399, 1000));
        assert!(!index.overlaps("chr8", 150, 160));
    }

    #[test]
    fn prefilter_keeps_overlapping_lines_from_gzip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("profile.bedGraph.gz");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(b"track type=bedGraph\nchr7\t0\t50\t1.5\nchr7\t90\t110\t2\nchr1\t90\t110\t3\nchr7\t500\t510\t4\n")
            .expect("write");
        fs::write(&source, encoder.finish().expect("finish")).expect("write gz");

        let index = IntervalIndex::from_regions(&[Region::new("chr7", 100, 200)]);
        let filtered = dir.path().join("filtered.bed");
        let kept = prefilter_track(&source, &index, &filtered).expect("prefilter");
        assert_eq!(kept, 1);
        assert_eq!(fs::read_to_string(&filtered).expect("read"), "chr7\t90\t110\t2\n");

        let features =
            features_in_region(&filtered, &Region::new("chr7", 105, 120)).expect("features");
        let rows = bedgraph_rows(&features, "profile.bedGraph.gz").expect("rows");
        assert_eq!(rows, vec![NumericRow::new("chr7", 90, 110, vec![2.0])]);
    }

    #[test]
    fn prefilter_converts_gtf_features_to_named_bed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("genes.gtf");
        fs::write(
            &source,
            "chr7\thavana\texon\t101\t150\t.\t-\t.\tgene_id \"G1\"; gene_name \"ACTB\";\n\
             chr7\thavana\texon\t900\t950\t.\t-\t.\tgene_id \"G2\";\n",
        )
        .expect("write gtf");

        let index = IntervalIndex::from_regions(&[Region::new("chr7", 0, 200)]);
        let filtered = dir.path().join("filtered.bed");
        assert_eq!(prefilter_track(&source, &index, &filtered).expect("prefilter"), 1);
        assert_eq!(fs::read_to_string(&filtered).expect("read"), "chr7\t100\t150\tACTB\n");

        let features =
            features_in_region(&filtered, &Region::new("chr7", 149, 160)).expect("features");
        assert_eq!(features, vec![Region::new("chr7", 100, 150).with_name("ACTB")]);
        assert!(
            features_in_region(&filtered, &Region::new("chr7", 150, 160))
                .expect("features")
                .is_empty()
        );
    }

    #[test]
    fn annotation_rows_carry_name_or_na() {
        let rows = annotation_rows(
            vec![
                Region::new("chr7", 10, 20).with_name("ACTB"),
                Region::new("chr7", 30, 40),
            ],
            "ann.bed",
        );
        assert_eq!(rows[0].value, "ACTB");
        assert_eq!(rows[1].value, "NA");
        assert_eq!(rows[1].source, "ann.bed");

        let windowed = NonBamRow::from_numeric(&NumericRow::new("chr7", 0, 5, vec![2.5]), "p.bedGraph");
        assert_eq!(windowed.value, "2.5");
    }

    #[test]
    fn rejects_non_numeric_bedgraph_scores() {
        let features = vec![Region::new("chr7", 10, 20).with_name("high")];
        assert!(bedgraph_rows(&features, "p.bedGraph").is_err());
    }
}
