use crate::errors::{AppError, Result};
use crate::region::Region;
use bio::io::fasta;
use std::fs::File;

/// Placeholder written to the `base` column when no FASTA was supplied.
pub const MISSING_BASE: &str = "NA";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceRow {
    pub chrom: String,
    pub start: u64,
    pub end: u64,
    pub base: String,
}

/// Indexed FASTA (`<path>.fai` must exist).
pub struct ReferenceGenome {
    path: String,
    reader: fasta::IndexedReader<File>,
}

impl ReferenceGenome {
    pub fn open(path: &str) -> Result<Self> {
        let reader = fasta::IndexedReader::from_file(&path).map_err(|err| {
            AppError::config(format!("failed to open indexed FASTA reader for {path}: {err}"))
        })?;
        Ok(Self {
            path: path.to_string(),
            reader,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn fetch(&mut self, region: &Region) -> Result<Vec<u8>> {
        self.reader
            .fetch(&region.chrom, region.start, region.end)
            .map_err(|err| {
                AppError::parse(format!(
                    "failed FASTA fetch for {} in {}: {err}",
                    region.to_samtools_region(),
                    self.path
                ))
            })?;

        let mut bases = Vec::with_capacity(region.width() as usize);
        self.reader.read(&mut bases).map_err(|err| {
            AppError::parse(format!(
                "failed FASTA read for {} in {}: {err}",
                region.to_samtools_region(),
                self.path
            ))
        })?;
        Ok(bases)
    }
}

/// One row per base of `region`, or none when the region is wider than `maxseq`.
pub fn sequence_rows(
    region: &Region,
    maxseq: u64,
    reference: Option<&mut ReferenceGenome>,
) -> Result<Vec<SequenceRow>> {
    if region.width() > maxseq {
        return Ok(Vec::new());
    }
    let row = |offset: u64, base: String| SequenceRow {
        chrom: region.chrom.clone(),
        start: region.start + offset,
        end: region.start + offset + 1,
        base,
    };
    match reference {
        Some(reference) => {
            let bases = reference.fetch(region)?;
            Ok(bases
                .iter()
                .zip(0u64..)
                .map(|(base, offset)| row(offset, char::from(*base).to_string()))
                .collect())
        }
        None => Ok((0..region.width())
            .map(|offset| row(offset, MISSING_BASE.to_string()))
            .collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::{ReferenceGenome, sequence_rows};
    use crate::region::Region;
    use std::fs;

    fn write_reference(dir: &std::path::Path) -> String {
        let fasta = dir.join("ref.fa");
        fs::write(&fasta, ">chr1\nACGTACGTAC\nGTAC\n>chr2\nNNNN\n").expect("write fasta");
        fs::write(
            dir.join("ref.fa.fai"),
            "chr1\t14\t6\t10\t11\nchr2\t4\t28\t4\t5\n",
        )
        .expect("write fai");
        fasta.to_string_lossy().to_string()
    }

    #[test]
    fn fetches_bases_across_line_breaks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut reference = ReferenceGenome::open(&write_reference(dir.path())).expect("open");
        let bases = reference.fetch(&Region::new("chr1", 8, 12)).expect("fetch");
        assert_eq!(bases, b"ACGT");

        let rows = sequence_rows(&Region::new("chr1", 2, 5), 100, Some(&mut reference))
            .expect("rows");
        let seq: Vec<(u64, u64, &str)> = rows
            .iter()
            .map(|row| (row.start, row.end, row.base.as_str()))
            .collect();
        assert_eq!(seq, vec![(2, 3, "G"), (3, 4, "T"), (4, 5, "A")]);
    }

    #[test]
    fn unknown_sequence_is_a_parse_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut reference = ReferenceGenome::open(&write_reference(dir.path())).expect("open");
        let err = reference
            .fetch(&Region::new("chrUn", 0, 4))
            .expect_err("unknown chrom");
        assert!(err.is_recoverable());
    }

    #[test]
    fn placeholder_bases_without_reference() {
        let rows = sequence_rows(&Region::new("chr7", 10, 13), 100, None).expect("rows");
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|row| row.base == "NA"));
    }

    #[test]
    fn wide_region_has_no_sequence_rows() {
        let rows = sequence_rows(&Region::new("chr7", 0, 101), 100, None).expect("rows");
        assert!(rows.is_empty());
        let rows = sequence_rows(&Region::new("chr7", 0, 100), 100, None).expect("rows");
        assert_eq!(rows.len(), 100);
    }

    #[test]
    fn missing_index_is_a_config_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fasta = dir.path().join("plain.fa");
        fs::write(&fasta, ">chr1\nACGT\n").expect("write");
        assert!(ReferenceGenome::open(&fasta.to_string_lossy()).is_err());
    }
}
