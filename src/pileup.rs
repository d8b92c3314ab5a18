use crate::errors::{AppError, Result};

/// Count columns in output order. Z and z follow the ten per-strand bases.
pub const COUNT_HEADER: [&str; 12] = ["A", "a", "C", "c", "G", "g", "T", "t", "N", "n", "Z", "z"];

const BASES: [u8; 5] = [b'A', b'C', b'G', b'T', b'N'];

/// What to do when one sample's base field on a line cannot be parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MalformedRecordPolicy {
    /// Fail the whole line.
    #[default]
    AbortLine,
    /// Zero-fill the offending sample and keep the line.
    SkipRecord,
}

/// Strand-aware nucleotide counts. Uppercase is forward, lowercase reverse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NucleotideCount {
    forward: [u32; 5],
    reverse: [u32; 5],
}

impl NucleotideCount {
    pub fn from_bases(bases: &[u8]) -> Self {
        let mut count = Self::default();
        for &base in bases {
            count.add(base);
        }
        count
    }

    /// Returns false for anything outside `ACGTNacgtn`.
    pub fn add(&mut self, base: u8) -> bool {
        let Some(idx) = base_index(base) else {
            return false;
        };
        if base.is_ascii_uppercase() {
            self.forward[idx] += 1;
        } else {
            self.reverse[idx] += 1;
        }
        true
    }

    pub fn get(&self, symbol: char) -> Option<u32> {
        match symbol {
            'Z' => Some(self.forward_total()),
            'z' => Some(self.reverse_total()),
            other => {
                let idx = base_index(u8::try_from(other).ok()?)?;
                if other.is_ascii_uppercase() {
                    Some(self.forward[idx])
                } else {
                    Some(self.reverse[idx])
                }
            }
        }
    }

    pub fn forward_total(&self) -> u32 {
        self.forward.iter().sum()
    }

    pub fn reverse_total(&self) -> u32 {
        self.reverse.iter().sum()
    }

    pub fn total(&self) -> u32 {
        self.forward_total() + self.reverse_total()
    }

    /// Values in `COUNT_HEADER` order.
    pub fn columns(&self) -> [u32; 12] {
        let mut out = [0_u32; 12];
        for idx in 0..BASES.len() {
            out[idx * 2] = self.forward[idx];
            out[idx * 2 + 1] = self.reverse[idx];
        }
        out[10] = self.forward_total();
        out[11] = self.reverse_total();
        out
    }
}

fn base_index(base: u8) -> Option<usize> {
    BASES
        .iter()
        .position(|candidate| *candidate == base.to_ascii_uppercase())
}

/// One sample column of an mpileup line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PileupRecord {
    pub chrom: String,
    /// 1-based, as in the pileup text.
    pub position: u64,
    pub reference_base: u8,
    pub depth: u32,
    pub raw_bases: String,
}

impl PileupRecord {
    pub fn start(&self) -> u64 {
        self.position.saturating_sub(1)
    }

    pub fn end(&self) -> u64 {
        self.position
    }

    pub fn resolve_bases(&self) -> Result<Vec<u8>> {
        resolve_bases(&self.raw_bases, self.reference_base)
    }

    pub fn count(&self) -> Result<NucleotideCount> {
        Ok(NucleotideCount::from_bases(&self.resolve_bases()?))
    }
}

/// Splits `chrom pos ref (depth bases quals)...` into one record per sample column.
pub fn parse_pileup_line(line: &str) -> Result<Vec<PileupRecord>> {
    let line = line.trim_end_matches(['\n', '\r']);
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() < 6 || (fields.len() - 3) % 3 != 0 {
        return Err(AppError::parse(format!("invalid pileup line: {line}")));
    }

    let chrom = fields[0];
    let position = fields[1]
        .parse::<u64>()
        .ok()
        .filter(|position| *position > 0)
        .ok_or_else(|| AppError::parse(format!("invalid pileup position: {}", fields[1])))?;
    let reference_base = fields[2]
        .bytes()
        .next()
        .map(|base| base.to_ascii_uppercase())
        .ok_or_else(|| AppError::parse(format!("missing reference base: {line}")))?;

    fields[3..]
        .chunks_exact(3)
        .map(|column| {
            let depth = column[0].parse::<u32>().map_err(|_| {
                AppError::parse(format!("invalid pileup depth: {}", column[0]))
            })?;
            // samtools writes `0 * *` for samples without coverage.
            let raw_bases = if depth == 0 && column[1] == "*" {
                String::new()
            } else {
                column[1].to_string()
            };
            Ok(PileupRecord {
                chrom: chrom.to_string(),
                position,
                reference_base,
                depth,
                raw_bases,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BaseFieldState {
    Normal,
    SkipCaretQuality,
    SkipIndelDigits { length: usize, digits: usize },
    SkipIndelChars { remaining: usize },
}

impl BaseFieldState {
    fn skipping(remaining: usize) -> Self {
        if remaining == 0 {
            Self::Normal
        } else {
            Self::SkipIndelChars { remaining }
        }
    }
}

/// Resolves a read-base field into aligned bases, `.`/`,` replaced by the reference.
pub fn resolve_bases(field: &str, reference: u8) -> Result<Vec<u8>> {
    let forward_ref = match reference.to_ascii_uppercase() {
        base @ (b'A' | b'C' | b'G' | b'T') => base,
        _ => b'N',
    };
    let bytes = field.as_bytes();
    let mut bases = Vec::with_capacity(bytes.len());
    let mut state = BaseFieldState::Normal;
    let mut idx = 0;

    while idx < bytes.len() {
        let byte = bytes[idx];
        state = match state {
            BaseFieldState::Normal => match byte {
                b'.' => {
                    bases.push(forward_ref);
                    BaseFieldState::Normal
                }
                b',' => {
                    bases.push(forward_ref.to_ascii_lowercase());
                    BaseFieldState::Normal
                }
                b'A' | b'C' | b'G' | b'T' | b'N' | b'a' | b'c' | b'g' | b't' | b'n' => {
                    bases.push(byte);
                    BaseFieldState::Normal
                }
                b'^' => BaseFieldState::SkipCaretQuality,
                b'$' | b'*' | b'#' | b'>' | b'<' => BaseFieldState::Normal,
                b'+' | b'-' => BaseFieldState::SkipIndelDigits {
                    length: 0,
                    digits: 0,
                },
                other => {
                    return Err(AppError::parse(format!(
                        "unexpected character {:?} at offset {idx} in base field {field:?}",
                        other as char
                    )));
                }
            },
            BaseFieldState::SkipCaretQuality => BaseFieldState::Normal,
            BaseFieldState::SkipIndelDigits { length, digits } => {
                if byte.is_ascii_digit() {
                    let length = length
                        .checked_mul(10)
                        .and_then(|value| value.checked_add(usize::from(byte - b'0')))
                        .ok_or_else(|| {
                            AppError::parse(format!("indel length overflow in {field:?}"))
                        })?;
                    BaseFieldState::SkipIndelDigits {
                        length,
                        digits: digits + 1,
                    }
                } else if digits == 0 {
                    return Err(AppError::parse(format!(
                        "indel marker without length at offset {idx} in {field:?}"
                    )));
                } else if length == 0 {
                    // `+0`: nothing to skip, reprocess this byte as a base.
                    state = BaseFieldState::Normal;
                    continue;
                } else {
                    BaseFieldState::skipping(length - 1)
                }
            }
            BaseFieldState::SkipIndelChars { remaining } => BaseFieldState::skipping(remaining - 1),
        };
        idx += 1;
    }

    match state {
        BaseFieldState::Normal => Ok(bases),
        BaseFieldState::SkipIndelDigits { length: 0, digits } if digits > 0 => Ok(bases),
        BaseFieldState::SkipCaretQuality => Err(AppError::parse(format!(
            "read start marker without mapping quality in {field:?}"
        ))),
        BaseFieldState::SkipIndelDigits { length, digits: 0 } => Err(AppError::parse(format!(
            "indel marker without length in {field:?} (pending {length})"
        ))),
        BaseFieldState::SkipIndelDigits { length, .. } => Err(AppError::parse(format!(
            "indel of length {length} has no sequence in {field:?}"
        ))),
        BaseFieldState::SkipIndelChars { remaining } => Err(AppError::parse(format!(
            "indel sequence truncated, {remaining} characters missing in {field:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::{COUNT_HEADER, NucleotideCount, parse_pileup_line, resolve_bases};

    fn counts(field: &str, reference: u8) -> NucleotideCount {
        NucleotideCount::from_bases(&resolve_bases(field, reference).expect("valid field"))
    }

    fn ex1_field() -> String {
        format!(
            "^].{}${}{}",
            ".".repeat(335),
            ",".repeat(80),
            "a".repeat(42)
        )
    }

    fn assert_totals(count: &NucleotideCount) {
        let columns = count.columns();
        assert_eq!(columns[10], columns[0] + columns[2] + columns[4] + columns[6] + columns[8]);
        assert_eq!(columns[11], columns[1] + columns[3] + columns[5] + columns[7] + columns[9]);
    }

    #[test]
    fn counts_match_reference_example() {
        let count = counts(&ex1_field(), b'C');
        assert_eq!(count.get('a'), Some(42));
        assert_eq!(count.get('C'), Some(336));
        assert_eq!(count.get('c'), Some(80));
        assert_eq!(count.get('A'), Some(0));
        assert_eq!(count.get('Z'), Some(336));
        assert_eq!(count.get('z'), Some(122));
        assert_eq!(count.get('Z').zip(count.get('z')).map(|(z, r)| z + r), Some(458));
        assert_totals(&count);
    }

    #[test]
    fn multi_digit_insertion_skips_exactly_length_characters() {
        let field = ex1_field();
        let (head, tail) = field.split_at(20);
        let inserted = format!("{head}+100{}{}{tail}", "g".repeat(10), "T".repeat(100));

        let count = counts(&inserted, b'C');
        assert_eq!(count.get('a'), Some(42));
        assert_eq!(count.get('C'), Some(336));
        assert_eq!(count.get('c'), Some(80));
        assert_eq!(count.get('T'), Some(10));
        assert_eq!(count.get('g'), Some(0));
        assert_eq!(count.total(), 468);
        assert_totals(&count);
    }

    #[test]
    fn deletion_skip_uses_full_digit_run() {
        let count = counts(&format!("..-12{}A,", "ACGTACGTACGT"), b'g');
        assert_eq!(count.get('G'), Some(2));
        assert_eq!(count.get('A'), Some(1));
        assert_eq!(count.get('g'), Some(1));
        assert_eq!(count.total(), 4);
    }

    #[test]
    fn caret_quality_marker_is_never_counted() {
        let count = counts("^A.", b'C');
        assert_eq!(count.get('A'), Some(0));
        assert_eq!(count.get('C'), Some(1));

        // Marker characters that look like grammar are still just quality.
        let count = counts("^+.^$,^^a", b'T');
        assert_eq!(count.get('T'), Some(1));
        assert_eq!(count.get('t'), Some(1));
        assert_eq!(count.get('a'), Some(1));
        assert_eq!(count.total(), 3);
    }

    #[test]
    fn ignores_placeholders_and_read_ends() {
        let count = counts(".$*#><,", b'A');
        assert_eq!(count.get('A'), Some(1));
        assert_eq!(count.get('a'), Some(1));
        assert_eq!(count.total(), 2);
    }

    #[test]
    fn missing_reference_resolves_matches_to_n() {
        let count = counts("..,", b'N');
        assert_eq!(count.get('N'), Some(2));
        assert_eq!(count.get('n'), Some(1));
    }

    #[test]
    fn rejects_malformed_fields() {
        assert!(resolve_bases("..+3AC", b'A').is_err());
        assert!(resolve_bases("..+A", b'A').is_err());
        assert!(resolve_bases("..-", b'A').is_err());
        assert!(resolve_bases("..^", b'A').is_err());
        assert!(resolve_bases("..+12", b'A').is_err());
        assert!(resolve_bases(".X.", b'A').is_err());
    }

    #[test]
    fn zero_length_indel_skips_nothing() {
        let count = counts(".+0.", b'A');
        assert_eq!(count.get('A'), Some(2));
    }

    #[test]
    fn columns_follow_header_order() {
        let count = counts("AacGgtNn..", b'T');
        let columns = count.columns();
        assert_eq!(COUNT_HEADER.len(), columns.len());
        for (symbol, value) in COUNT_HEADER.iter().zip(columns) {
            let symbol = symbol.chars().next().expect("symbol");
            assert_eq!(count.get(symbol), Some(value));
        }
        assert_eq!(columns, [1, 1, 0, 1, 1, 1, 2, 1, 1, 1, 5, 5]);
    }

    #[test]
    fn parses_multi_sample_line() {
        let records =
            parse_pileup_line("chr7\t5567254\tc\t3\t.,a\tIII\t0\t*\t*\t2\t^!.$,\tII\n")
                .expect("valid line");
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].reference_base, b'C');
        assert_eq!((records[0].start(), records[0].end()), (5567253, 5567254));
        assert_eq!(records[1].raw_bases, "");
        assert_eq!(records[1].count().expect("empty").total(), 0);
        let third = records[2].count().expect("valid field");
        assert_eq!(third.get('C'), Some(1));
        assert_eq!(third.get('c'), Some(1));
    }

    #[test]
    fn rejects_truncated_lines() {
        assert!(parse_pileup_line("chr1\t10\tA\t3\t...").is_err());
        assert!(parse_pileup_line("chr1\tx\tA\t3\t...\tIII").is_err());
        assert!(parse_pileup_line("chr1\t0\tA\t3\t...\tIII").is_err());
        assert!(parse_pileup_line("chr1\t10\tA\tdeep\t...\tIII").is_err());
    }
}
