use crate::errors::{AppError, Result};
use crate::pileup::{COUNT_HEADER, MalformedRecordPolicy, NucleotideCount, PileupRecord, parse_pileup_line};
use crate::window::NumericRow;
use std::cmp::Ordering;
use tracing::warn;

/// One aligned-read source, in command-line order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleDescriptor {
    pub name: String,
    pub path: String,
}

impl SampleDescriptor {
    pub fn from_path(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            name: path.clone(),
            path,
        }
    }
}

/// Order of the per-sample count columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColumnLayout {
    /// `s1.A s1.a … s1.z s2.A …`
    #[default]
    SampleMajor,
    /// `s1.A s2.A … s1.a s2.a …`
    CountMajor,
}

impl ColumnLayout {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "sample-major" => Ok(Self::SampleMajor),
            "count-major" => Ok(Self::CountMajor),
            other => Err(AppError::InvalidValue {
                flag: "--layout".to_string(),
                value: other.to_string(),
                reason: "expected \"sample-major\" or \"count-major\"".to_string(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::SampleMajor => "sample-major",
            Self::CountMajor => "count-major",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleMatrixRow {
    pub chrom: String,
    pub start: u64,
    pub end: u64,
    pub counts: Vec<NucleotideCount>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PileupMatrix {
    samples: Vec<SampleDescriptor>,
    rows: Vec<SampleMatrixRow>,
}

impl PileupMatrix {
    pub fn empty(samples: Vec<SampleDescriptor>) -> Self {
        Self {
            samples,
            rows: Vec::new(),
        }
    }

    pub fn samples(&self) -> &[SampleDescriptor] {
        &self.samples
    }

    pub fn rows(&self) -> &[SampleMatrixRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Builds from multi-sample mpileup lines, one column group per sample.
    pub fn from_pileup_lines<I, S>(
        samples: Vec<SampleDescriptor>,
        lines: I,
        policy: MalformedRecordPolicy,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut matrix = Self::empty(samples);
        for line in lines {
            let line = line.as_ref();
            if line.trim().is_empty() {
                continue;
            }
            let records = parse_pileup_line(line)?;
            if records.len() != matrix.samples.len() {
                return Err(AppError::parse(format!(
                    "pileup line has {} sample columns, expected {}: {}",
                    records.len(),
                    matrix.samples.len(),
                    line
                )));
            }
            let counts = records
                .iter()
                .zip(&matrix.samples)
                .map(|(record, sample)| count_with_policy(record, sample, policy))
                .collect::<Result<Vec<_>>>()?;
            let first = &records[0];
            matrix.push_row(SampleMatrixRow {
                chrom: first.chrom.clone(),
                start: first.start(),
                end: first.end(),
                counts,
            })?;
        }
        Ok(matrix)
    }

    /// Merges one sorted record stream per sample; positions missing from a stream are zero-filled.
    pub fn from_streams(
        samples: Vec<SampleDescriptor>,
        streams: Vec<Vec<PileupRecord>>,
        policy: MalformedRecordPolicy,
    ) -> Result<Self> {
        if streams.len() != samples.len() {
            return Err(AppError::parse(format!(
                "got {} pileup streams for {} samples",
                streams.len(),
                samples.len()
            )));
        }
        for (stream, sample) in streams.iter().zip(&samples) {
            if let Some(pair) = stream
                .windows(2)
                .find(|pair| compare_records(&pair[0], &pair[1]) == Ordering::Greater)
            {
                return Err(AppError::parse(format!(
                    "pileup for {} is not sorted: {}:{} after {}:{}",
                    sample.name, pair[1].chrom, pair[1].position, pair[0].chrom, pair[0].position
                )));
            }
        }

        let mut matrix = Self::empty(samples);
        let mut cursors = vec![0_usize; streams.len()];
        loop {
            let next = streams
                .iter()
                .zip(&cursors)
                .filter_map(|(stream, cursor)| stream.get(*cursor))
                .min_by(|lhs, rhs| compare_records(lhs, rhs));
            let Some(target) = next.cloned() else {
                break;
            };

            let mut counts = Vec::with_capacity(streams.len());
            for (idx, stream) in streams.iter().enumerate() {
                match stream.get(cursors[idx]) {
                    Some(record) if compare_records(record, &target) == Ordering::Equal => {
                        counts.push(count_with_policy(record, &matrix.samples[idx], policy)?);
                        cursors[idx] += 1;
                    }
                    _ => counts.push(NucleotideCount::default()),
                }
            }
            matrix.rows.push(SampleMatrixRow {
                chrom: target.chrom.clone(),
                start: target.start(),
                end: target.end(),
                counts,
            });
        }
        Ok(matrix)
    }

    fn push_row(&mut self, row: SampleMatrixRow) -> Result<()> {
        if let Some(last) = self.rows.last()
            && compare_positions(&last.chrom, last.start, &row.chrom, row.start) == Ordering::Greater
        {
            return Err(AppError::parse(format!(
                "pileup positions out of order: {}:{} after {}:{}",
                row.chrom, row.end, last.chrom, last.end
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn header(&self, layout: ColumnLayout) -> Vec<String> {
        let mut header = vec!["chrom".to_string(), "start".to_string(), "end".to_string()];
        match layout {
            ColumnLayout::SampleMajor => {
                for sample in &self.samples {
                    for symbol in COUNT_HEADER {
                        header.push(format!("{}.{symbol}", sample.name));
                    }
                }
            }
            ColumnLayout::CountMajor => {
                for symbol in COUNT_HEADER {
                    for sample in &self.samples {
                        header.push(format!("{}.{symbol}", sample.name));
                    }
                }
            }
        }
        header
    }

    /// Numeric rows in `layout` order, scaled by `scale[sample]` when given.
    pub fn to_numeric_rows(
        &self,
        layout: ColumnLayout,
        scale: Option<&[f64]>,
    ) -> Result<Vec<NumericRow>> {
        if let Some(factors) = scale
            && factors.len() != self.samples.len()
        {
            return Err(AppError::Aggregation {
                message: format!(
                    "got {} normalization factors for {} samples",
                    factors.len(),
                    self.samples.len()
                ),
            });
        }
        let factor = |sample: usize| scale.map_or(1.0, |factors| factors[sample]);

        let rows = self
            .rows
            .iter()
            .map(|row| {
                let columns: Vec<[u32; 12]> = row.counts.iter().map(NucleotideCount::columns).collect();
                let mut values = Vec::with_capacity(columns.len() * COUNT_HEADER.len());
                match layout {
                    ColumnLayout::SampleMajor => {
                        for (sample, counts) in columns.iter().enumerate() {
                            values.extend(counts.iter().map(|count| f64::from(*count) * factor(sample)));
                        }
                    }
                    ColumnLayout::CountMajor => {
                        for symbol in 0..COUNT_HEADER.len() {
                            for (sample, counts) in columns.iter().enumerate() {
                                values.push(f64::from(counts[symbol]) * factor(sample));
                            }
                        }
                    }
                }
                NumericRow::new(row.chrom.clone(), row.start, row.end, values)
            })
            .collect();
        Ok(rows)
    }
}

/// Reads-per-million factors, `1e6 / library_size` per sample.
pub fn rpm_factors(library_sizes: &[u64]) -> Result<Vec<f64>> {
    library_sizes
        .iter()
        .map(|size| {
            if *size == 0 {
                Err(AppError::config(
                    "library size of 0 mapped reads cannot be RPM-normalized",
                ))
            } else {
                Ok(1_000_000.0 / *size as f64)
            }
        })
        .collect()
}

fn count_with_policy(
    record: &PileupRecord,
    sample: &SampleDescriptor,
    policy: MalformedRecordPolicy,
) -> Result<NucleotideCount> {
    match record.count() {
        Ok(count) => Ok(count),
        Err(error) if policy == MalformedRecordPolicy::SkipRecord => {
            warn!(
                sample = %sample.name,
                chrom = %record.chrom,
                position = record.position,
                error = %error,
                "skipping malformed pileup record"
            );
            Ok(NucleotideCount::default())
        }
        Err(error) => Err(error),
    }
}

fn compare_records(left: &PileupRecord, right: &PileupRecord) -> Ordering {
    compare_positions(&left.chrom, left.position, &right.chrom, right.position)
}

fn compare_positions(left_chrom: &str, left_pos: u64, right_chrom: &str, right_pos: u64) -> Ordering {
    compare_chromosomes(left_chrom, right_chrom).then(left_pos.cmp(&right_pos))
}

pub(crate) fn compare_chromosomes(left: &str, right: &str) -> Ordering {
    let (left_group, left_rank) = chromosome_sort_class(left);
    let (right_group, right_rank) = chromosome_sort_class(right);
    left_group
        .cmp(&right_group)
        .then(left_rank.cmp(&right_rank))
        .then_with(|| left.cmp(right))
}

fn chromosome_sort_class(chrom: &str) -> (u8, u32) {
    let raw = chrom.trim();
    let normalized = strip_chr_prefix(raw);

    if let Ok(num) = normalized.parse::<u32>() {
        return (0, num);
    }

    if normalized.eq_ignore_ascii_case("X") {
        (1, 23)
    } else if normalized.eq_ignore_ascii_case("Y") {
        (1, 24)
    } else if normalized.eq_ignore_ascii_case("M") || normalized.eq_ignore_ascii_case("MT") {
        (1, 25)
    } else {
        (2, 0)
    }
}

fn strip_chr_prefix(raw: &str) -> &str {
    match raw.get(..3) {
        Some(prefix) if prefix.eq_ignore_ascii_case("chr") => &raw[3..],
        _ => raw,
    }
}

#[cfg(test)]
mod tests {
    use super::{ColumnLayout, PileupMatrix, SampleDescriptor, compare_chromosomes, rpm_factors};
    use crate::pileup::{MalformedRecordPolicy, parse_pileup_line};
    use std::cmp::Ordering;

    fn samples(names: &[&str]) -> Vec<SampleDescriptor> {
        names.iter().map(|name| SampleDescriptor::from_path(*name)).collect()
    }

    #[test]
    fn header_keeps_z_columns_after_bases() {
        let matrix = PileupMatrix::empty(samples(&["ds051.bam", "ds052.bam"]));
        let header = matrix.header(ColumnLayout::SampleMajor);
        assert_eq!(header.len(), 3 + 2 * 12);
        assert_eq!(&header[..4], &["chrom", "start", "end", "ds051.bam.A"]);
        assert_eq!(header[13], "ds051.bam.Z");
        assert_eq!(header[14], "ds051.bam.z");
        assert_eq!(header[15], "ds052.bam.A");

        let legacy = matrix.header(ColumnLayout::CountMajor);
        assert_eq!(&legacy[3..7], &["ds051.bam.A", "ds052.bam.A", "ds051.bam.a", "ds052.bam.a"]);
        assert_eq!(legacy[26], "ds052.bam.z");
    }

    #[test]
    fn builds_rows_from_multi_sample_lines() {
        let lines = [
            "chr7\t100\tA\t2\t.,\tII\t1\tG\tI",
            "chr7\t101\tC\t0\t*\t*\t3\t..a\tIII",
        ];
        let matrix = PileupMatrix::from_pileup_lines(
            samples(&["s1", "s2"]),
            lines,
            MalformedRecordPolicy::AbortLine,
        )
        .expect("matrix");
        assert_eq!(matrix.len(), 2);
        assert_eq!((matrix.rows()[0].start, matrix.rows()[0].end), (99, 100));

        let rows = matrix
            .to_numeric_rows(ColumnLayout::SampleMajor, None)
            .expect("rows");
        // s1: A=1 a=1 Z=1 z=1, s2: G=1 Z=1
        assert_eq!(rows[0].values[0], 1.0);
        assert_eq!(rows[0].values[1], 1.0);
        assert_eq!(rows[0].values[10], 1.0);
        assert_eq!(rows[0].values[11], 1.0);
        assert_eq!(rows[0].values[12 + 4], 1.0);
        assert_eq!(rows[0].values[12 + 10], 1.0);
        // Second row: s1 empty, s2 C=2 a=1
        assert!(rows[1].values[..12].iter().all(|value| *value == 0.0));
        assert_eq!(rows[1].values[12 + 2], 2.0);
        assert_eq!(rows[1].values[12 + 1], 1.0);
    }

    #[test]
    fn malformed_record_policy() {
        let lines = ["chr1\t5\tA\t2\t.+5AC\tII\t1\t.\tI"];
        let strict = PileupMatrix::from_pileup_lines(
            samples(&["s1", "s2"]),
            lines,
            MalformedRecordPolicy::AbortLine,
        );
        assert!(strict.is_err());

        let lenient = PileupMatrix::from_pileup_lines(
            samples(&["s1", "s2"]),
            lines,
            MalformedRecordPolicy::SkipRecord,
        )
        .expect("skipped record");
        assert_eq!(lenient.rows()[0].counts[0].total(), 0);
        assert_eq!(lenient.rows()[0].counts[1].total(), 1);
    }

    #[test]
    fn merges_streams_with_zero_fill() {
        let s1 = ["chr2\t10\tA\t1\t.\tI", "chr2\t12\tA\t1\t,\tI", "chr10\t1\tA\t1\tT\tI"];
        let s2 = ["chr2\t11\tC\t1\t.\tI", "chr2\t12\tA\t2\t..\tII"];
        let to_stream = |lines: &[&str]| {
            lines
                .iter()
                .flat_map(|line| parse_pileup_line(line).expect("line"))
                .collect::<Vec<_>>()
        };
        let matrix = PileupMatrix::from_streams(
            samples(&["s1", "s2"]),
            vec![to_stream(&s1), to_stream(&s2)],
            MalformedRecordPolicy::AbortLine,
        )
        .expect("matrix");

        let positions: Vec<(String, u64)> = matrix
            .rows()
            .iter()
            .map(|row| (row.chrom.clone(), row.end))
            .collect();
        assert_eq!(
            positions,
            vec![
                ("chr2".to_string(), 10),
                ("chr2".to_string(), 11),
                ("chr2".to_string(), 12),
                ("chr10".to_string(), 1),
            ]
        );
        assert_eq!(matrix.rows()[0].counts[1].total(), 0);
        assert_eq!(matrix.rows()[1].counts[0].total(), 0);
        assert_eq!(matrix.rows()[2].counts[0].get('a'), Some(1));
        assert_eq!(matrix.rows()[2].counts[1].get('A'), Some(2));
    }

    #[test]
    fn rejects_unsorted_stream() {
        let stream = ["chr1\t20\tA\t1\t.\tI", "chr1\t10\tA\t1\t.\tI"]
            .iter()
            .flat_map(|line| parse_pileup_line(line).expect("line"))
            .collect::<Vec<_>>();
        let result = PileupMatrix::from_streams(
            samples(&["s1"]),
            vec![stream],
            MalformedRecordPolicy::AbortLine,
        );
        assert!(result.is_err());
    }

    #[test]
    fn rpm_scales_each_sample() {
        let lines = ["chr1\t5\tA\t2\t..\tII\t2\t..\tII"];
        let matrix = PileupMatrix::from_pileup_lines(
            samples(&["s1", "s2"]),
            lines,
            MalformedRecordPolicy::AbortLine,
        )
        .expect("matrix");
        let factors = rpm_factors(&[2_000_000, 500_000]).expect("factors");
        let rows = matrix
            .to_numeric_rows(ColumnLayout::SampleMajor, Some(factors.as_slice()))
            .expect("rows");
        assert!((rows[0].values[0] - 1.0).abs() < 1e-12);
        assert!((rows[0].values[12] - 4.0).abs() < 1e-12);

        let legacy = matrix
            .to_numeric_rows(ColumnLayout::CountMajor, Some(factors.as_slice()))
            .expect("rows");
        assert!((legacy[0].values[0] - 1.0).abs() < 1e-12);
        assert!((legacy[0].values[1] - 4.0).abs() < 1e-12);

        assert!(rpm_factors(&[0]).is_err());
        assert!(matrix.to_numeric_rows(ColumnLayout::SampleMajor, Some(&[1.0])).is_err());
    }

    #[test]
    fn orders_chromosomes_naturally() {
        assert_eq!(compare_chromosomes("chr2", "chr10"), Ordering::Less);
        assert_eq!(compare_chromosomes("chrX", "chr22"), Ordering::Greater);
        assert_eq!(compare_chromosomes("chrM", "chrY"), Ordering::Greater);
        assert_eq!(compare_chromosomes("chrUn_1", "chrM"), Ordering::Greater);
    }
}
