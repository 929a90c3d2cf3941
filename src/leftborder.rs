//! Partial sums over the code counts (the leftborder table) with a sparse
//! sample array.
//!
//! `leftborder[i]` is the inclusive prefix sum of the counts of entries
//! `0..=i`; one extra entry at `differentcodes` holds the total. Claims
//! decrement an entry and return the new value, so bucket `i` hands out
//! slots `leftborder[i]-1` down to `leftborder[i-1]`.

use log::info;
use std::ops::Range;
use std::path::PathBuf;

use crate::dedup::CountTable;
use crate::index::IndexError;
use crate::io::{LeftborderWriter, MappedLeftborder};
use crate::partition::Cumulative;
use crate::radix::CounterWidth;

/// Where the table lives. Entries below the overflow index are 32-bit, in
/// memory or spilled; once the prefix sums outgrow 32 bits the remaining
/// entries go to a 64-bit overflow table in memory.
pub struct Leftborder {
    low: LowBorders,
    overflow: Vec<u64>,
}

enum LowBorders {
    Memory(Vec<u32>),
    Mapped(MappedLeftborder),
}

impl Leftborder {
    #[inline]
    fn low(&self) -> &[u32] {
        match &self.low {
            LowBorders::Memory(v) => v,
            LowBorders::Mapped(m) => m.as_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.low().len() + self.overflow.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn get(&self, idx: usize) -> u64 {
        let low = self.low();
        if idx < low.len() {
            low[idx] as u64
        } else {
            self.overflow[idx - low.len()]
        }
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.low, LowBorders::Mapped(_))
    }

    /// First entry kept in the 64-bit overflow table.
    pub fn overflow_index(&self) -> Option<usize> {
        (!self.overflow.is_empty()).then(|| self.low().len())
    }

    /// Path of the spill file holding the 32-bit entries.
    pub fn spill_path(&self) -> Option<PathBuf> {
        match &self.low {
            LowBorders::Mapped(m) => Some(m.path()),
            LowBorders::Memory(_) => None,
        }
    }

    pub fn size_in_bytes(&self) -> usize {
        let low = match &self.low {
            LowBorders::Memory(v) => v.capacity() * 4,
            // pages of the private mapping, not heap
            LowBorders::Mapped(_) => 0,
        };
        low + self.overflow.capacity() * 8
    }

    fn entries_mut(&mut self) -> Entries<'_> {
        let low = match &mut self.low {
            LowBorders::Memory(v) => v.as_mut_slice(),
            LowBorders::Mapped(m) => m.as_mut_slice(),
        };
        Entries {
            low,
            high: &mut self.overflow,
        }
    }
}

/// Mutable view on a run of leftborder entries: a 32-bit head followed by a
/// 64-bit tail, either of which may be empty.
struct Entries<'a> {
    low: &'a mut [u32],
    high: &'a mut [u64],
}

impl<'a> Entries<'a> {
    #[inline]
    fn get(&self, i: usize) -> u64 {
        if i < self.low.len() {
            self.low[i] as u64
        } else {
            self.high[i - self.low.len()]
        }
    }

    /// `--entry[i]`; the entry must be positive.
    #[inline]
    fn decrement(&mut self, i: usize) -> u64 {
        if i < self.low.len() {
            let e = &mut self.low[i];
            assert!(*e > 0, "leftborder entry {i} claimed below zero");
            *e -= 1;
            *e as u64
        } else {
            let e = &mut self.high[i - self.low.len()];
            assert!(*e > 0, "leftborder entry {i} claimed below zero");
            *e -= 1;
            *e
        }
    }

    fn split_at_mut(self, mid: usize) -> (Entries<'a>, Entries<'a>) {
        if mid <= self.low.len() {
            let (a, b) = self.low.split_at_mut(mid);
            (Entries { low: a, high: Default::default() }, Entries { low: b, high: self.high })
        } else {
            let (a, b) = self.high.split_at_mut(mid - self.low.len());
            (Entries { low: self.low, high: a }, Entries { low: Default::default(), high: b })
        }
    }
}

/// Claim slots of one contiguous bucket range. Slots below `floor` (the end
/// of the previous range) are never handed out.
pub struct PartClaims<'a> {
    buckets: Range<usize>,
    entries: Entries<'a>,
    floor: u64,
    ceiling: u64,
    #[cfg(debug_assertions)]
    starts: &'a [u64],
}

impl PartClaims<'_> {
    pub fn buckets(&self) -> Range<usize> {
        self.buckets.clone()
    }

    /// Slot range owned by this part.
    pub fn slots(&self) -> Range<u64> {
        self.floor..self.ceiling
    }

    /// Claim the next slot of bucket `idx`, counting down.
    ///
    /// Panics when `idx` is outside the part or the claim would reach below
    /// the part's first slot. Debug builds also catch a claim below the
    /// bucket's own first slot.
    #[inline]
    pub fn claim(&mut self, idx: usize) -> u64 {
        assert!(
            self.buckets.contains(&idx),
            "bucket {idx} outside part {:?}",
            self.buckets
        );
        let local = idx - self.buckets.start;
        let entry = self.entries.get(local);
        assert!(entry > self.floor, "bucket {idx} exhausted");
        #[cfg(debug_assertions)]
        {
            assert!(entry > self.starts[local], "bucket {idx} exhausted");
        }
        self.entries.decrement(local)
    }

    /// Current border value of bucket `idx`.
    pub fn border(&self, idx: usize) -> u64 {
        self.entries.get(idx - self.buckets.start)
    }
}

/// How the table is materialised.
#[derive(Clone, Debug, Default)]
pub enum Store {
    #[default]
    Memory,
    /// Spill to a temporary file (in `dir`, or the system temp dir).
    Spill { dir: Option<PathBuf> },
}

/// Leftborder table plus samples and summary figures.
pub struct PartialSums {
    borders: Leftborder,
    samples: Vec<u64>,
    sample_shift: u32,
    differentcodes: usize,
    max_bucket_size: u64,
    total: u64,
    claimed: bool,
    // exclusive start of every bucket, for over-claim checks
    #[cfg(debug_assertions)]
    starts: Vec<u64>,
}

/// Largest shift `<= max_shift` with `2^shift < differentcodes` (floor 0).
pub fn sample_shift(differentcodes: usize, max_shift: u32) -> u32 {
    let mut shift = max_shift;
    while shift > 0 && (1usize << shift) >= differentcodes {
        shift -= 1;
    }
    shift
}

enum LowSink {
    Memory(Vec<u32>),
    Spill(LeftborderWriter),
}

impl LowSink {
    fn push(&mut self, v: u32) -> Result<(), IndexError> {
        match self {
            LowSink::Memory(vec) => vec.push(v),
            LowSink::Spill(w) => w.push(v)?,
        }
        Ok(())
    }

    fn finish(self) -> Result<LowBorders, IndexError> {
        Ok(match self {
            LowSink::Memory(v) => LowBorders::Memory(v),
            LowSink::Spill(w) => LowBorders::Mapped(w.finish()?),
        })
    }
}

impl PartialSums {
    /// Prefix-sum the counts of `table`.
    pub fn build(
        table: &CountTable,
        width: CounterWidth,
        max_sample_shift: u32,
        store: Store,
    ) -> Result<Self, IndexError> {
        Self::build_with_low_max(table, width, max_sample_shift, store, u32::MAX as u64)
    }

    /// Like [`build`](Self::build), but entries are only kept in the 32-bit
    /// table while they are at most `low_max`; from the first larger prefix
    /// sum on, the rest goes to the 64-bit overflow table.
    pub fn build_with_low_max(
        table: &CountTable,
        width: CounterWidth,
        max_sample_shift: u32,
        store: Store,
        low_max: u64,
    ) -> Result<Self, IndexError> {
        assert!(low_max <= u32::MAX as u64, "low_max {low_max} exceeds 32 bits");
        let dc = table.len();
        let total = table.total();
        width.check(total)?;

        let mut low = match store {
            Store::Spill { dir } => LowSink::Spill(LeftborderWriter::create(dir.as_deref())?),
            Store::Memory => LowSink::Memory(Vec::with_capacity(dc + 1)),
        };
        let mut overflow: Vec<u64> = Vec::new();

        let shift = sample_shift(dc, max_sample_shift);
        let mask = (1usize << shift) - 1;
        let mut samples = Vec::with_capacity(dc / (mask + 1) + 2);
        #[cfg(debug_assertions)]
        let mut starts = Vec::with_capacity(dc);
        let mut partsum = 0u64;
        let mut max_bucket_size = 0u64;
        for (idx, _, count) in table.iter() {
            #[cfg(debug_assertions)]
            starts.push(partsum);
            partsum += count;
            max_bucket_size = max_bucket_size.max(count);
            if overflow.is_empty() && partsum <= low_max {
                low.push(partsum as u32)?;
            } else {
                overflow.push(partsum);
            }
            if idx & mask == 0 {
                samples.push(partsum);
            }
        }
        debug_assert_eq!(partsum, total);
        if overflow.is_empty() && total <= low_max {
            low.push(total as u32)?;
        } else {
            overflow.push(total);
        }
        if samples.last().is_none_or(|&s| s < total) {
            samples.push(total);
        }

        let borders = Leftborder {
            low: low.finish()?,
            overflow,
        };
        if let Some(at) = borders.overflow_index() {
            info!(
                "leftborder exceeds {low_max} at bucket {at}: {} entries kept in the 64-bit overflow table",
                borders.len() - at
            );
        }
        info!(
            "partial sums: {dc} buckets, {total} entries, max bucket {max_bucket_size}, {} samples (shift {shift})",
            samples.len()
        );
        Ok(Self {
            borders,
            samples,
            sample_shift: shift,
            differentcodes: dc,
            max_bucket_size,
            total,
            claimed: false,
            #[cfg(debug_assertions)]
            starts,
        })
    }

    pub fn differentcodes(&self) -> usize {
        self.differentcodes
    }

    /// Sum of all counts, `leftborder[differentcodes]`.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn max_bucket_size(&self) -> u64 {
        self.max_bucket_size
    }

    pub fn borders(&self) -> &Leftborder {
        &self.borders
    }

    #[inline]
    pub fn leftborder(&self, idx: usize) -> u64 {
        self.borders.get(idx)
    }

    /// Slot range of bucket `idx` before any claim.
    pub fn bucket_range(&self, idx: usize) -> Range<u64> {
        assert!(!self.claimed, "bucket ranges are gone once claims started");
        let start = if idx == 0 { 0 } else { self.leftborder(idx - 1) };
        start..self.leftborder(idx)
    }

    pub fn sample_shift(&self) -> u32 {
        self.sample_shift
    }

    /// Index of the last sample.
    pub fn num_samples(&self) -> usize {
        self.samples.len() - 1
    }

    pub fn sample(&self, idx: usize) -> u64 {
        assert!(idx <= self.num_samples(), "sample index {idx} out of range");
        self.samples[idx]
    }

    /// Bucket index that sample `idx` was taken at.
    pub fn sample_to_full(&self, idx: usize) -> usize {
        assert!(idx <= self.num_samples(), "sample index {idx} out of range");
        if idx < self.num_samples() {
            idx << self.sample_shift
        } else {
            self.differentcodes.saturating_sub(1)
        }
    }

    /// First sample whose value is `>= offset`.
    pub fn find_first_sample_larger(&self, offset: u64) -> usize {
        assert!(offset <= self.total, "offset {offset} beyond total {}", self.total);
        self.samples.partition_point(|&s| s < offset).min(self.num_samples())
    }

    /// First bucket `b` in `range` with `leftborder[b] >= offset`, or
    /// `range.end` if none.
    pub fn find_first_larger(&self, range: Range<usize>, offset: u64) -> usize {
        let (mut lo, mut hi) = (range.start, range.end);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.leftborder(mid) < offset {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Claim one slot of bucket `idx` without partitioning. Claiming more
    /// than the bucket's count panics once the entry reaches 0, and in debug
    /// builds as soon as it reaches the bucket's start.
    pub fn claim(&mut self, idx: usize) -> u64 {
        assert!(idx < self.differentcodes, "bucket {idx} out of range");
        self.claimed = true;
        let entry = self.borders.get(idx);
        assert!(entry > 0, "bucket {idx} exhausted");
        #[cfg(debug_assertions)]
        {
            assert!(entry > self.starts[idx], "bucket {idx} exhausted");
        }
        self.borders.entries_mut().decrement(idx)
    }

    /// Split the table into one [`PartClaims`] per bucket range. `parts`
    /// must be contiguous and cover `0..differentcodes` in order.
    pub fn split_claims(&mut self, parts: &[Range<usize>]) -> Vec<PartClaims<'_>> {
        assert!(!self.claimed, "leftborder split after claims started");
        assert_eq!(parts.first().map_or(0, |p| p.start), 0);
        assert_eq!(parts.last().map_or(0, |p| p.end), self.differentcodes);
        self.claimed = true;

        let bounds: Vec<(u64, u64)> = parts
            .iter()
            .map(|p| {
                let floor = if p.start == 0 { 0 } else { self.borders.get(p.start - 1) };
                let ceiling = if p.is_empty() { floor } else { self.borders.get(p.end - 1) };
                (floor, ceiling)
            })
            .collect();

        let mut rest = self.borders.entries_mut();
        #[cfg(debug_assertions)]
        let mut starts: &[u64] = &self.starts;
        let mut out = Vec::with_capacity(parts.len());
        for (part, (floor, ceiling)) in parts.iter().zip(bounds) {
            let (mine, tail) = rest.split_at_mut(part.len());
            rest = tail;
            #[cfg(debug_assertions)]
            let (part_starts, starts_tail) = starts.split_at(part.len());
            #[cfg(debug_assertions)]
            {
                starts = starts_tail;
            }
            out.push(PartClaims {
                buckets: part.clone(),
                entries: mine,
                floor,
                ceiling,
                #[cfg(debug_assertions)]
                starts: part_starts,
            });
        }
        out
    }
}

impl Cumulative for PartialSums {
    fn num_buckets(&self) -> usize {
        self.differentcodes
    }

    #[inline]
    fn cumulative(&self, e: usize) -> u64 {
        if e == 0 { 0 } else { self.leftborder(e - 1) }
    }

    /// Coarse step over the samples, then binary search between the two
    /// bracketing sample positions.
    fn first_reaching(&self, target: u64, lo: usize) -> usize {
        if lo >= self.differentcodes || target <= self.cumulative(lo) {
            return lo;
        }
        let s = self.find_first_sample_larger(target);
        let hi = self.sample_to_full(s) + 1;
        let start = if s == 0 { 0 } else { self.sample_to_full(s - 1) };
        self.find_first_larger(start.max(lo)..hi, target) + 1
    }

    fn max_bucket_weight(&self) -> u64 {
        self.max_bucket_size
    }
}
