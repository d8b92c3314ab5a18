/// Formats a table value: shortest round-trip decimal, integral values without a
/// fractional part, and `NA` for NaN.
///
/// ```ignore
/// assert_eq!(format_value(336.0), "336");
/// assert_eq!(format_value(2.5), "2.5");
/// assert_eq!(format_value(f64::NAN), "NA");
/// ```
pub(crate) fn format_value(value: f64) -> String {
    if value.is_nan() {
        return "NA".to_string();
    }
    if value == 0.0 {
        return "0".to_string();
    }
    format!("{value}")
}

/// Drops repeated entries, keeping the first occurrence.
pub(crate) fn dedup_preserving_order(items: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::with_capacity(items.len());
    items
        .iter()
        .filter(|item| seen.insert(item.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{dedup_preserving_order, format_value};

    #[test]
    fn formats_counts_and_means() {
        assert_eq!(format_value(336.0), "336");
        assert_eq!(format_value(-0.0), "0");
        assert_eq!(format_value(2.5), "2.5");
        assert_eq!(format_value(1.0 / 3.0), "0.3333333333333333");
        assert_eq!(format_value(f64::NAN), "NA");
    }

    #[test]
    fn dedup_keeps_first_seen_order() {
        let items = ["b.bam", "a.bam", "b.bam", "c.bedGraph", "a.bam"]
            .map(str::to_string)
            .to_vec();
        assert_eq!(
            dedup_preserving_order(&items),
            vec!["b.bam".to_string(), "a.bam".to_string(), "c.bedGraph".to_string()]
        );
    }
}
