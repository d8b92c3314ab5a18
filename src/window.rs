use crate::errors::{AppError, Result};
use crate::region::Region;
use std::collections::HashMap;
use std::str::FromStr;

/// A `chrom start end` span with one or more numeric columns.
#[derive(Debug, Clone, PartialEq)]
pub struct NumericRow {
    pub chrom: String,
    pub start: u64,
    pub end: u64,
    pub values: Vec<f64>,
}

impl NumericRow {
    pub fn new(chrom: impl Into<String>, start: u64, end: u64, values: Vec<f64>) -> Self {
        Self {
            chrom: chrom.into(),
            start,
            end,
            values,
        }
    }
}

/// Reductions accepted by `--group_fun`, named as in `bedtools groupby`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    Sum,
    Count,
    Min,
    Max,
    AbsMin,
    AbsMax,
    Mean,
    Median,
    Mode,
    AntiMode,
    Stdev,
    SampleStdev,
    First,
    Last,
}

impl AggregateFunction {
    pub const NAMES: [&'static str; 14] = [
        "sum", "count", "min", "max", "absmin", "absmax", "mean", "median", "mode", "antimode",
        "stdev", "sstdev", "first", "last",
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Count => "count",
            Self::Min => "min",
            Self::Max => "max",
            Self::AbsMin => "absmin",
            Self::AbsMax => "absmax",
            Self::Mean => "mean",
            Self::Median => "median",
            Self::Mode => "mode",
            Self::AntiMode => "antimode",
            Self::Stdev => "stdev",
            Self::SampleStdev => "sstdev",
            Self::First => "first",
            Self::Last => "last",
        }
    }

    /// Reduces a non-empty slice. Empty input gives NaN.
    pub fn apply(&self, values: &[f64]) -> f64 {
        if values.is_empty() {
            return f64::NAN;
        }
        let n = values.len() as f64;
        match self {
            Self::Sum => values.iter().sum(),
            Self::Count => n,
            Self::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Self::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Self::AbsMin => values.iter().map(|v| v.abs()).fold(f64::INFINITY, f64::min),
            Self::AbsMax => values
                .iter()
                .map(|v| v.abs())
                .fold(f64::NEG_INFINITY, f64::max),
            Self::Mean => values.iter().sum::<f64>() / n,
            Self::Median => {
                let mut sorted = values.to_vec();
                sorted.sort_by(f64::total_cmp);
                let mid = sorted.len() / 2;
                if sorted.len() % 2 == 0 {
                    (sorted[mid - 1] + sorted[mid]) / 2.0
                } else {
                    sorted[mid]
                }
            }
            Self::Mode => frequency_extreme(values, true),
            Self::AntiMode => frequency_extreme(values, false),
            Self::Stdev => variance(values, 0.0).sqrt(),
            Self::SampleStdev => {
                if values.len() < 2 {
                    f64::NAN
                } else {
                    variance(values, 1.0).sqrt()
                }
            }
            Self::First => values[0],
            Self::Last => values[values.len() - 1],
        }
    }
}

impl FromStr for AggregateFunction {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self> {
        let function = match value {
            "sum" => Self::Sum,
            "count" => Self::Count,
            "min" => Self::Min,
            "max" => Self::Max,
            "absmin" => Self::AbsMin,
            "absmax" => Self::AbsMax,
            "mean" => Self::Mean,
            "median" => Self::Median,
            "mode" => Self::Mode,
            "antimode" => Self::AntiMode,
            "stdev" => Self::Stdev,
            "sstdev" => Self::SampleStdev,
            "first" => Self::First,
            "last" => Self::Last,
            other => {
                return Err(AppError::config(format!(
                    "unsupported group function {other:?}; expected one of {}",
                    Self::NAMES.join(", ")
                )));
            }
        };
        Ok(function)
    }
}

fn variance(values: &[f64], ddof: f64) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - ddof)
}

/// Most (or least) frequent value; ties go to the smallest value.
fn frequency_extreme(values: &[f64], most: bool) -> f64 {
    let mut counts: HashMap<u64, (f64, usize)> = HashMap::new();
    for value in values {
        counts.entry(value.to_bits()).or_insert((*value, 0)).1 += 1;
    }
    let mut entries: Vec<(f64, usize)> = counts.into_values().collect();
    entries.sort_by(|lhs, rhs| lhs.0.total_cmp(&rhs.0));
    let pick = if most {
        entries.iter().max_by(|lhs, rhs| lhs.1.cmp(&rhs.1).then(rhs.0.total_cmp(&lhs.0)))
    } else {
        entries.iter().min_by(|lhs, rhs| lhs.1.cmp(&rhs.1).then(lhs.0.total_cmp(&rhs.0)))
    };
    pick.map_or(f64::NAN, |(value, _)| *value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregationSpec {
    pub function: AggregateFunction,
    pub max_windows: usize,
}

impl AggregationSpec {
    /// Validates at setup so a bad name never surfaces mid-aggregation.
    pub fn new(function_name: &str, max_windows: usize) -> Result<Self> {
        if max_windows < 1 {
            return Err(AppError::config("number of windows must be >= 1"));
        }
        Ok(Self {
            function: function_name.parse()?,
            max_windows,
        })
    }
}

/// Splits `frame` into `n` windows of equal width, the remainder going to the last one.
pub fn make_windows(frame: &Region, n: usize) -> Vec<Region> {
    let span = frame.width();
    if span == 0 || n == 0 {
        return Vec::new();
    }
    let n = (n as u64).min(span);
    let width = span / n;
    (0..n)
        .map(|idx| {
            let start = frame.start + idx * width;
            let end = if idx + 1 == n {
                frame.end
            } else {
                start + width
            };
            Region::new(frame.chrom.clone(), start, end)
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub struct WindowAggregator {
    spec: AggregationSpec,
}

impl WindowAggregator {
    pub fn new(spec: AggregationSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> AggregationSpec {
        self.spec
    }

    /// Windows over the union span of `rows`.
    pub fn aggregate(&self, rows: &[NumericRow]) -> Result<Vec<NumericRow>> {
        if rows.len() <= self.spec.max_windows {
            return Ok(rows.to_vec());
        }
        let first = &rows[0];
        if let Some(other) = rows.iter().find(|row| row.chrom != first.chrom) {
            return Err(AppError::Aggregation {
                message: format!(
                    "cannot window rows spanning {} and {}",
                    first.chrom, other.chrom
                ),
            });
        }
        let start = rows.iter().map(|row| row.start).min().unwrap_or(first.start);
        let end = rows.iter().map(|row| row.end).max().unwrap_or(first.end);
        self.aggregate_within(rows, &Region::new(first.chrom.clone(), start, end))
    }

    /// Windows over `frame`; rows on other chromosomes or outside it are ignored.
    pub fn aggregate_within(&self, rows: &[NumericRow], frame: &Region) -> Result<Vec<NumericRow>> {
        if rows.len() <= self.spec.max_windows {
            return Ok(rows.to_vec());
        }
        let columns = rows[0].values.len();
        if let Some(bad) = rows.iter().find(|row| row.values.len() != columns) {
            return Err(AppError::Aggregation {
                message: format!(
                    "inconsistent column count at {}:{}-{}: expected {columns}, found {}",
                    bad.chrom,
                    bad.start,
                    bad.end,
                    bad.values.len()
                ),
            });
        }

        let windows = make_windows(frame, self.spec.max_windows);
        let mut buckets: Vec<Vec<&NumericRow>> = vec![Vec::new(); windows.len()];
        if let Some(width) = windows.first().map(Region::width) {
            for row in rows
                .iter()
                .filter(|row| frame.overlaps(&row.chrom, row.start, row.end))
            {
                let first = window_index(row.start.max(frame.start), frame.start, width, windows.len());
                let last = window_index(
                    row.end.min(frame.end).saturating_sub(1),
                    frame.start,
                    width,
                    windows.len(),
                );
                for bucket in &mut buckets[first..=last] {
                    bucket.push(row);
                }
            }
        }

        let mut column_values = Vec::new();
        let aggregated = windows
            .into_iter()
            .zip(buckets)
            .filter(|(_, members)| !members.is_empty())
            .map(|(window, members)| {
                let values = (0..columns)
                    .map(|column| {
                        column_values.clear();
                        column_values.extend(members.iter().map(|row| row.values[column]));
                        self.spec.function.apply(&column_values)
                    })
                    .collect();
                NumericRow::new(window.chrom, window.start, window.end, values)
            })
            .collect();
        Ok(aggregated)
    }
}

fn window_index(position: u64, frame_start: u64, width: u64, count: usize) -> usize {
    let idx = ((position - frame_start) / width) as usize;
    idx.min(count - 1)
}
