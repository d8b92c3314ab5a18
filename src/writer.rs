use std::io::{BufWriter, Write};
use std::path::Path;

use crate::errors::{AppError, Result};
use crate::reference::SequenceRow;
use crate::tracks::NonBamRow;
use crate::utils::format_value;
use crate::window::NumericRow;
use tempfile::Builder;

pub const SEQUENCE_HEADER: [&str; 4] = ["chrom", "start", "end", "base"];

/// Writes `path` through a sibling temp file that is renamed into place once `write_fn` succeeds.
pub fn with_table_writer<F>(path: &Path, write_fn: F) -> Result<()>
where
    F: FnOnce(&mut dyn Write) -> Result<()>,
{
    let parent_dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut staged = Builder::new()
        .prefix(".genome_graphs_")
        .suffix(".part")
        .tempfile_in(parent_dir)
        .map_err(|err| AppError::at_path(parent_dir, err))?;

    {
        let mut buf = BufWriter::new(staged.as_file_mut());
        write_fn(&mut buf)?;
        buf.flush().map_err(|err| AppError::at_path(path, err))?;
    }

    staged
        .persist(path)
        .map_err(|err| AppError::at_path(path, err.error))?;
    Ok(())
}

pub fn write_header<W: Write + ?Sized, S: AsRef<str>>(writer: &mut W, fields: &[S]) -> Result<()> {
    let line = fields
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join("\t");
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")?;
    Ok(())
}

pub fn write_sequence_table(path: &Path, rows: &[SequenceRow]) -> Result<()> {
    with_table_writer(path, |out| {
        write_header(out, &SEQUENCE_HEADER)?;
        for row in rows {
            writeln!(out, "{}\t{}\t{}\t{}", row.chrom, row.start, row.end, row.base)?;
        }
        Ok(())
    })
}

/// `header` must start with the `chrom start end` columns.
pub fn write_matrix_table(path: &Path, header: &[String], rows: &[NumericRow]) -> Result<()> {
    with_table_writer(path, |out| {
        write_header(out, header)?;
        for row in rows {
            write_numeric_row(out, row)?;
        }
        Ok(())
    })
}

pub fn write_numeric_row<W: Write + ?Sized>(writer: &mut W, row: &NumericRow) -> Result<()> {
    write!(writer, "{}\t{}\t{}", row.chrom, row.start, row.end)?;
    for value in &row.values {
        write!(writer, "\t{}", format_value(*value))?;
    }
    writer.write_all(b"\n")?;
    Ok(())
}

/// Header-less `chrom start end sourceFile A C G T Z`; A, C, G and T are always `NA`.
pub fn write_nonbam_table(path: &Path, rows: &[NonBamRow]) -> Result<()> {
    with_table_writer(path, |out| {
        for row in rows {
            writeln!(
                out,
                "{}\t{}\t{}\t{}\tNA\tNA\tNA\tNA\t{}",
                row.chrom, row.start, row.end, row.source, row.value
            )?;
        }
        Ok(())
    })
}

/// `key<TAB>value`; list-valued keys carry one tab-separated field per element.
pub fn write_params(path: &Path, params: &[(String, Vec<String>)]) -> Result<()> {
    with_table_writer(path, |out| {
        for (key, values) in params {
            out.write_all(key.as_bytes())?;
            for value in values {
                write!(out, "\t{value}")?;
            }
            out.write_all(b"\n")?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::{
        write_header, write_matrix_table, write_nonbam_table, write_params, write_sequence_table,
    };
    use crate::reference::SequenceRow;
    use crate::tracks::NonBamRow;
    use crate::window::NumericRow;
    use std::fs;

    #[test]
    fn writes_tab_delimited_header() {
        let mut output = Vec::new();
        write_header(&mut output, &["chrom", "start", "end"]).expect("header");
        assert_eq!(String::from_utf8(output).expect("utf8"), "chrom\tstart\tend\n");
    }

    #[test]
    fn sequence_table_is_header_only_without_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("r.seq.txt");
        write_sequence_table(&path, &[]).expect("write");
        assert_eq!(fs::read_to_string(&path).expect("read"), "chrom\tstart\tend\tbase\n");

        write_sequence_table(
            &path,
            &[SequenceRow {
                chrom: "chr7".to_string(),
                start: 4,
                end: 5,
                base: "A".to_string(),
            }],
        )
        .expect("overwrite");
        assert_eq!(
            fs::read_to_string(&path).expect("read"),
            "chrom\tstart\tend\tbase\nchr7\t4\t5\tA\n"
        );
    }

    #[test]
    fn matrix_table_formats_counts_and_missing_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("r.grp.bed.txt");
        let header = ["chrom", "start", "end", "s.A", "s.a"].map(str::to_string);
        let rows = vec![NumericRow::new("chr7", 0, 10, vec![3.0, f64::NAN])];
        write_matrix_table(&path, &header, &rows).expect("write");
        assert_eq!(
            fs::read_to_string(&path).expect("read"),
            "chrom\tstart\tend\ts.A\ts.a\nchr7\t0\t10\t3\tNA\n"
        );
    }

    #[test]
    fn nonbam_rows_pad_base_columns() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("r.nonbam.bed.txt");
        let rows = vec![NonBamRow {
            chrom: "chr7".to_string(),
            start: 1,
            end: 9,
            source: "ann.bed".to_string(),
            value: "ACTB".to_string(),
        }];
        write_nonbam_table(&path, &rows).expect("write");
        assert_eq!(
            fs::read_to_string(&path).expect("read"),
            "chr7\t1\t9\tann.bed\tNA\tNA\tNA\tNA\tACTB\n"
        );
    }

    #[test]
    fn params_list_values_are_tab_separated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("r.params.txt");
        write_params(
            &path,
            &[
                ("chrom".to_string(), vec!["chr7".to_string()]),
                ("names".to_string(), vec!["a".to_string(), "b".to_string()]),
                ("nonbam".to_string(), Vec::new()),
            ],
        )
        .expect("write");
        assert_eq!(
            fs::read_to_string(&path).expect("read"),
            "chrom\tchr7\nnames\ta\tb\nnonbam\n"
        );
    }
}
