use crate::errors::{AppError, Result};
use bio::io::bed;
use bio::io::gff::{self, GffType};
use flate2::read::GzDecoder;
use std::cmp::Ordering;
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;

/// Half-open genomic interval `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Region {
    pub chrom: String,
    pub start: u64,
    pub end: u64,
    pub name: Option<String>,
}

impl Region {
    pub fn new(chrom: impl Into<String>, start: u64, end: u64) -> Self {
        Self {
            chrom: chrom.into(),
            start,
            end,
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn width(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn overlaps(&self, chrom: &str, start: u64, end: u64) -> bool {
        self.chrom == chrom && start < self.end && self.start < end
    }

    /// `chrom_start_end[_name]` with filename-hostile characters replaced.
    pub fn file_stem(&self) -> String {
        let mut stem = format!("{}_{}_{}", self.chrom, self.start, self.end);
        if let Some(name) = self.name.as_deref()
            && !name.is_empty()
            && name != "."
        {
            stem.push('_');
            stem.push_str(name);
        }
        stem.chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '-' | '+') {
                    ch
                } else {
                    '_'
                }
            })
            .collect()
    }

    /// samtools-style 1-based inclusive region string.
    pub fn to_samtools_region(&self) -> String {
        format!("{}:{}-{}", self.chrom, self.start + 1, self.end)
    }

    pub fn compare_position(&self, other: &Region) -> Ordering {
        self.chrom
            .cmp(&other.chrom)
            .then(self.start.cmp(&other.start))
            .then(self.end.cmp(&other.end))
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.name.as_deref().unwrap_or(".");
        write!(f, "{}\t{}\t{}\t{name}", self.chrom, self.start, self.end)
    }
}

/// One side of a slop: absolute bases or a fraction of the region width.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Extension {
    Bases(u64),
    Fraction(f64),
}

impl Extension {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if let Ok(value) = raw.parse::<i64>() {
            return u64::try_from(value)
                .map(Self::Bases)
                .map_err(|_| AppError::Slop {
                    message: format!("extension must be >= 0, got {raw}"),
                });
        }
        let value = raw.parse::<f64>().map_err(|_| AppError::Slop {
            message: format!("extension must be an integer or a float, got {raw:?}"),
        })?;
        Self::from_float(value)
    }

    pub fn from_float(value: f64) -> Result<Self> {
        if !value.is_finite() || value < 0.0 {
            return Err(AppError::Slop {
                message: format!("extension must be a finite number >= 0, got {value}"),
            });
        }
        Ok(Self::Fraction(value))
    }

    fn bases_for(&self, width: u64) -> u64 {
        match self {
            Self::Bases(bases) => *bases,
            // Python 2 style rounding: halves away from zero.
            Self::Fraction(fraction) => (width as f64 * fraction).round() as u64,
        }
    }
}

/// Left and right extension applied to every target region.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlopSpec {
    pub left: Extension,
    pub right: Extension,
}

impl Default for SlopSpec {
    fn default() -> Self {
        Self {
            left: Extension::Fraction(0.05),
            right: Extension::Fraction(0.05),
        }
    }
}

impl SlopSpec {
    pub const NONE: SlopSpec = SlopSpec {
        left: Extension::Bases(0),
        right: Extension::Bases(0),
    };

    /// One value is applied to both sides, two values are left then right.
    pub fn parse<S: AsRef<str>>(values: &[S]) -> Result<Self> {
        match values {
            [both] => {
                let extension = Extension::parse(both.as_ref())?;
                Ok(Self {
                    left: extension,
                    right: extension,
                })
            }
            [left, right] => Ok(Self {
                left: Extension::parse(left.as_ref())?,
                right: Extension::parse(right.as_ref())?,
            }),
            _ => Err(AppError::Slop {
                message: format!("expected one or two values, got {}", values.len()),
            }),
        }
    }

    pub fn apply(&self, region: &Region) -> Region {
        let width = region.width();
        let left = self.left.bases_for(width);
        let right = self.right.bases_for(width);
        Region {
            chrom: region.chrom.clone(),
            start: region.start.saturating_sub(left),
            end: region.end.saturating_add(right),
            name: region.name.clone(),
        }
    }
}

/// On-disk layout of an interval file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalFormat {
    /// 0-based half-open, name (or bedGraph score) in column 4.
    Bed,
    /// 1-based inclusive with `key "value";` attributes.
    Gtf,
}

impl IntervalFormat {
    pub fn of(path: &str) -> Self {
        let lower = path.to_ascii_lowercase();
        let stem = lower.strip_suffix(".gz").unwrap_or(&lower);
        if stem.ends_with(".gtf") || stem.ends_with(".gff") {
            Self::Gtf
        } else {
            Self::Bed
        }
    }

    /// Guesses the layout of unnamed input from its first data line.
    pub fn sniff(text: &str) -> Self {
        let first = text.lines().find(|line| !is_header_line(line.as_bytes()));
        match first {
            Some(line) if is_gtf_fields(&line.split('\t').collect::<Vec<_>>()) => Self::Gtf,
            _ => Self::Bed,
        }
    }
}

fn is_gtf_fields(fields: &[&str]) -> bool {
    fields.len() >= 9
        && fields[1].parse::<u64>().is_err()
        && fields[3].parse::<u64>().is_ok()
        && fields[4].parse::<u64>().is_ok()
}

fn is_header_line(line: &[u8]) -> bool {
    let line = line.trim_ascii();
    line.is_empty()
        || line.starts_with(b"#")
        || line.starts_with(b"track")
        || line.starts_with(b"browser")
}

/// Drops blank, `#`, `track` and `browser` lines so the record readers only see data.
struct DataLines<R> {
    inner: R,
    line: Vec<u8>,
    pos: usize,
}

impl<R: BufRead> DataLines<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            line: Vec::new(),
            pos: 0,
        }
    }
}

impl<R: BufRead> Read for DataLines<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.line.len() {
            self.line.clear();
            self.pos = 0;
            if self.inner.read_until(b'\n', &mut self.line)? == 0 {
                return Ok(0);
            }
            if is_header_line(&self.line) {
                self.line.clear();
            }
        }
        let n = (self.line.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.line[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Streams every interval of `reader` into `visit`, converting GTF to half-open.
pub fn visit_regions<R, F>(reader: R, format: IntervalFormat, mut visit: F) -> Result<()>
where
    R: BufRead,
    F: FnMut(Region) -> Result<()>,
{
    let data = DataLines::new(reader);
    match format {
        IntervalFormat::Bed => {
            let mut bed_reader = bed::Reader::new(data);
            for record in bed_reader.records() {
                let record = record.map_err(invalid_record)?;
                let region = Region::new(record.chrom(), record.start(), record.end());
                let region = match record.name().filter(|name| !name.is_empty() && *name != ".") {
                    Some(name) => region.with_name(name),
                    None => region,
                };
                visit(checked(region)?)?;
            }
        }
        IntervalFormat::Gtf => {
            let mut gtf_reader = gff::Reader::new(data, GffType::GTF2);
            for record in gtf_reader.records() {
                let record = record.map_err(invalid_record)?;
                let region = Region::new(
                    record.seqname(),
                    (*record.start()).saturating_sub(1),
                    *record.end(),
                );
                let name = ["gene_name", "gene_id", "transcript_id"]
                    .iter()
                    .find_map(|key| record.attributes().get(*key))
                    .filter(|name| !name.is_empty());
                let region = match name {
                    Some(name) => region.with_name(name.as_str()),
                    None => region,
                };
                visit(checked(region)?)?;
            }
        }
    }
    Ok(())
}

fn invalid_record(err: impl fmt::Display) -> AppError {
    AppError::parse(format!("invalid interval record: {err}"))
}

fn checked(region: Region) -> Result<Region> {
    if region.end <= region.start {
        return Err(AppError::parse(format!(
            "interval end must be greater than start: {}:{}-{}",
            region.chrom, region.start, region.end
        )));
    }
    Ok(region)
}

pub fn read_regions<R: BufRead>(reader: R, format: IntervalFormat) -> Result<Vec<Region>> {
    let mut regions = Vec::new();
    visit_regions(reader, format, |region| {
        regions.push(region);
        Ok(())
    })?;
    Ok(regions)
}

/// Reads target regions from a path, `-` for stdin, gzip by extension.
pub fn read_regions_from(path: &str) -> Result<Vec<Region>> {
    if path == "-" {
        let mut text = String::new();
        io::stdin().lock().read_to_string(&mut text)?;
        let format = IntervalFormat::sniff(&text);
        return read_regions(text.as_bytes(), format);
    }
    let reader = open_text(Path::new(path))?;
    read_regions(reader, IntervalFormat::of(path))
}

pub(crate) fn open_text(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(path).map_err(|err| AppError::at_path(path, err))?;
    let inner: Box<dyn Read> = if path.extension().is_some_and(|ext| ext == "gz") {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(Box::new(BufReader::new(inner)))
}
