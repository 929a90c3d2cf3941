//! Splitting a sequence of weighted buckets into contiguous parts of roughly
//! equal total weight.
//!
//! Works over anything that can answer "total weight of buckets `0..e`"
//! ([`Cumulative`]). The bucket borders of [`crate::PartialSums`] are such a
//! function, and so are the bin widths of a radix shuffle.

use crate::index::IndexError;
use log::{debug, info};
use std::ops::Range;

/// Upper bound on the number of parts tried when fitting a memory budget.
pub const MAX_BUDGET_PARTS: usize = 500;

/// Monotone prefix weight over `num_buckets()` buckets.
pub trait Cumulative {
    fn num_buckets(&self) -> usize;

    /// Total weight of buckets `0..e`, for `e` in `0..=num_buckets()`.
    fn cumulative(&self, e: usize) -> u64;

    /// First `e` in `lo..=num_buckets()` with `cumulative(e) >= target`.
    /// Callers guarantee `target <= cumulative(num_buckets())`.
    fn first_reaching(&self, target: u64, lo: usize) -> usize {
        let mut lo = lo;
        let mut hi = self.num_buckets();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.cumulative(mid) < target {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Weight of the heaviest single bucket.
    fn max_bucket_weight(&self) -> u64 {
        (0..self.num_buckets())
            .map(|i| self.cumulative(i + 1) - self.cumulative(i))
            .max()
            .unwrap_or(0)
    }
}

/// Inclusive prefix sums over an explicit weight list.
#[derive(Clone, Debug, Default)]
pub struct PrefixWeights {
    sums: Vec<u64>,
}

impl PrefixWeights {
    pub fn from_weights<I: IntoIterator<Item = u64>>(weights: I) -> Self {
        let mut acc = 0u64;
        let sums = weights
            .into_iter()
            .map(|w| {
                acc += w;
                acc
            })
            .collect();
        Self { sums }
    }
}

impl Cumulative for PrefixWeights {
    fn num_buckets(&self) -> usize {
        self.sums.len()
    }

    #[inline]
    fn cumulative(&self, e: usize) -> u64 {
        if e == 0 { 0 } else { self.sums[e - 1] }
    }
}

/// Split all buckets into `numparts` contiguous ranges.
///
/// Part `p` ends at the first bucket border whose prefix weight reaches the
/// cumulative target `sum(0..=p)` of the per-part share, where the first
/// `total % numparts` parts get one extra unit. Every part's weight then
/// differs from `total / numparts` by at most the heaviest bucket. Parts may
/// be empty when single buckets are heavier than a share.
pub fn partition_by_weight<C: Cumulative + ?Sized>(c: &C, numparts: usize) -> Vec<Range<usize>> {
    divide_parts(c, 0..c.num_buckets(), numparts)
}

/// Same as [`partition_by_weight`], restricted to the buckets in `range`.
pub fn divide_parts<C: Cumulative + ?Sized>(
    c: &C,
    range: Range<usize>,
    numparts: usize,
) -> Vec<Range<usize>> {
    assert!(numparts > 0, "numparts must be positive");
    let offset = c.cumulative(range.start);
    let total = c.cumulative(range.end) - offset;
    let share = total / numparts as u64;
    let remainder = total % numparts as u64;

    let mut parts = Vec::with_capacity(numparts);
    let mut start = range.start;
    let mut target = offset;
    for p in 0..numparts {
        target += share + u64::from((p as u64) < remainder);
        let end = if p + 1 == numparts {
            range.end
        } else {
            c.first_reaching(target, start).min(range.end)
        };
        parts.push(start..end);
        start = end;
    }
    parts
}

/// Drop parts that contain no buckets.
pub fn remove_empty_parts(parts: Vec<Range<usize>>) -> Vec<Range<usize>> {
    let before = parts.len();
    let kept: Vec<_> = parts.into_iter().filter(|p| !p.is_empty()).collect();
    if kept.len() < before {
        debug!("removed {} empty parts", before - kept.len());
    }
    kept
}

/// Weight of every part.
pub fn part_weights<C: Cumulative + ?Sized>(c: &C, parts: &[Range<usize>]) -> Vec<u64> {
    parts
        .iter()
        .map(|p| c.cumulative(p.end) - c.cumulative(p.start))
        .collect()
}

/// Population variance of the part weights.
pub fn variance(weights: &[u64]) -> f64 {
    if weights.is_empty() {
        return 0.0;
    }
    let n = weights.len() as f64;
    let mean = weights.iter().map(|&w| w as f64).sum::<f64>() / n;
    weights.iter().map(|&w| (w as f64 - mean).powi(2)).sum::<f64>() / n
}

/// Memory figures for [`parts_for_budget`].
#[derive(Clone, Copy, Debug)]
pub struct Budget {
    /// Bytes already committed elsewhere.
    pub used: usize,
    /// Bytes per entry of the target table for one part.
    pub bytes_per_entry: usize,
    /// Hard limit.
    pub limit: usize,
}

/// Smallest partition (1 to [`MAX_BUDGET_PARTS`] parts) whose largest part
/// fits into the budget. Empty parts are removed from the result.
pub fn parts_for_budget<C: Cumulative + ?Sized>(
    c: &C,
    budget: Budget,
) -> Result<Vec<Range<usize>>, IndexError> {
    let mut required = usize::MAX;
    for numparts in 1..=MAX_BUDGET_PARTS {
        let parts = partition_by_weight(c, numparts);
        let largest = part_weights(c, &parts).into_iter().max().unwrap_or(0);
        required = budget.used + largest as usize * budget.bytes_per_entry;
        if required <= budget.limit {
            let parts = remove_empty_parts(parts);
            info!(
                "memory budget {:.2} MB met with {} parts (largest needs {:.2} MB)",
                mb(budget.limit),
                parts.len(),
                mb(required)
            );
            return Ok(parts);
        }
    }
    Err(IndexError::MemoryBudget {
        used: budget.used,
        required,
        limit: budget.limit,
        shortfall: required - budget.limit,
    })
}

pub(crate) fn mb(bytes: usize) -> f64 {
    bytes as f64 / (1u64 << 20) as f64
}
