use crate::errors::Result;
use crate::region::{Region, SlopSpec};
use rust_lapper::{Interval, Lapper};
use std::collections::HashMap;

/// Sorted-interval operations the pipeline delegates.
pub trait IntervalToolkit: Send + Sync {
    /// Sorts by chromosome name, then start, then end.
    fn sort(&self, regions: &[Region]) -> Result<Vec<Region>>;

    /// Merges overlapping and book-ended intervals of sorted input. Names are dropped.
    fn merge(&self, regions: &[Region]) -> Result<Vec<Region>>;

    fn slop_and_merge(&self, regions: &[Region], slop: &SlopSpec) -> Result<Vec<Region>> {
        let slopped: Vec<Region> = regions.iter().map(|region| slop.apply(region)).collect();
        let sorted = self.sort(&slopped)?;
        self.merge(&sorted)
    }
}

/// In-process implementation with `bedtools sort`/`merge` semantics.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeToolkit;

impl IntervalToolkit for NativeToolkit {
    fn sort(&self, regions: &[Region]) -> Result<Vec<Region>> {
        let mut sorted = regions.to_vec();
        sorted.sort_by(Region::compare_position);
        Ok(sorted)
    }

    fn merge(&self, regions: &[Region]) -> Result<Vec<Region>> {
        let mut merged = Vec::with_capacity(regions.len());
        for (chrom, mut lapper) in lappers_by_chrom(regions) {
            lapper.merge_overlaps();
            merged.extend(
                lapper
                    .iter()
                    .map(|interval| Region::new(chrom.clone(), interval.start, interval.stop)),
            );
        }
        Ok(merged)
    }
}

/// One `Lapper` per chromosome, in first-seen chromosome order.
pub(crate) fn lappers_by_chrom(regions: &[Region]) -> Vec<(String, Lapper<u64, ()>)> {
    let mut order: Vec<String> = Vec::new();
    let mut grouped: HashMap<String, Vec<Interval<u64, ()>>> = HashMap::new();
    for region in regions {
        grouped
            .entry(region.chrom.clone())
            .or_insert_with(|| {
                order.push(region.chrom.clone());
                Vec::new()
            })
            .push(Interval {
                start: region.start,
                stop: region.end,
                val: (),
            });
    }
    order
        .into_iter()
        .filter_map(|chrom| {
            let intervals = grouped.remove(&chrom)?;
            Some((chrom, Lapper::new(intervals)))
        })
        .collect()
}
