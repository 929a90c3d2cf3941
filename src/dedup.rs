//! Deduplicated code table with packed occurrence counts.
//!
//! Built in place from a sorted code array. Word 0 keeps the first code in
//! full; every later word holds the distance to its predecessor in the low
//! `delta_bits` bits and an occurrence counter in the remaining high bits.
//! A counter equal to `count_max` marks an overflowed entry whose excess is
//! kept in a side map.

use crate::bscache::BinarySearchCache;
use log::debug;
use rustc_hash::FxHashMap;

/// Sorted distinct codes with an occurrence count each.
#[derive(Clone, Debug, Default)]
pub struct CountTable {
    words: Vec<u64>,
    first_count: u64,
    delta_bits: u32,
    count_max: u64,
    exceptions: FxHashMap<usize, u32>,
}

/// Number of bits needed to represent `v` (at least 1).
fn bits_for(v: u64) -> u32 {
    (64 - v.leading_zeros()).max(1)
}

impl CountTable {
    /// Collapse equal runs of a sorted code array. The allocation of `codes`
    /// is reused for the packed words.
    pub fn from_sorted(mut codes: Vec<u64>) -> Self {
        if codes.is_empty() {
            return Self::default();
        }
        debug_assert!(codes.windows(2).all(|w| w[0] <= w[1]), "codes not sorted");

        let mut maxdiff = 0u64;
        let mut distinct = 1usize;
        for w in codes.windows(2) {
            if w[1] != w[0] {
                maxdiff = maxdiff.max(w[1] - w[0]);
                distinct += 1;
            }
        }

        let delta_bits = bits_for(maxdiff);
        let count_bits = 64 - delta_bits;
        let count_max = if count_bits == 0 { 0 } else { (1u64 << count_bits) - 1 };
        let mut table = CountTable {
            words: Vec::new(),
            first_count: 0,
            delta_bits,
            count_max,
            exceptions: FxHashMap::default(),
        };

        let n = codes.len();
        let mut read = 0usize;
        let mut write = 0usize;
        let mut prev = 0u64;
        while read < n {
            let code = codes[read];
            let mut end = read + 1;
            while end < n && codes[end] == code {
                end += 1;
            }
            let run = (end - read) as u64;
            if write == 0 {
                codes[0] = code;
                table.first_count = run;
            } else {
                let field = table.store_count(write, run);
                codes[write] = (code - prev) | table.shift_field(field);
            }
            prev = code;
            write += 1;
            read = end;
        }
        debug_assert_eq!(write, distinct);
        codes.truncate(write);
        codes.shrink_to_fit();
        table.words = codes;

        debug!(
            "dedup: {n} codes, {distinct} distinct ({:.2}%), delta bits {delta_bits}, {} overflowed counts",
            100.0 * distinct as f64 / n as f64,
            table.exceptions.len()
        );
        table
    }

    #[inline]
    fn shift_field(&self, field: u64) -> u64 {
        if self.delta_bits >= 64 { 0 } else { field << self.delta_bits }
    }

    #[inline]
    fn field(&self, idx: usize) -> u64 {
        if self.delta_bits >= 64 { 0 } else { self.words[idx] >> self.delta_bits }
    }

    /// Counter field for `count`, moving the excess into the side map.
    fn store_count(&mut self, idx: usize, count: u64) -> u64 {
        if count < self.count_max {
            return count;
        }
        let extra = count - self.count_max;
        assert!(extra <= u32::MAX as u64, "count overflow at entry {idx}");
        self.exceptions.insert(idx, extra as u32);
        self.count_max
    }

    /// Number of distinct codes.
    #[inline]
    pub fn len(&self) -> usize {
        self.words.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn delta_bits(&self) -> u32 {
        self.delta_bits
    }

    /// Largest value storable in a counter field without the side map.
    pub fn count_max(&self) -> u64 {
        self.count_max
    }

    /// Entries whose count lives partly in the side map.
    pub fn overflowed(&self) -> usize {
        self.exceptions.len()
    }

    pub fn first_code(&self) -> Option<u64> {
        self.words.first().copied()
    }

    /// Distance from entry `idx - 1` to entry `idx` (`idx > 0`).
    #[inline]
    pub fn delta(&self, idx: usize) -> u64 {
        debug_assert!(idx > 0);
        if self.delta_bits >= 64 {
            self.words[idx]
        } else {
            self.words[idx] & ((1u64 << self.delta_bits) - 1)
        }
    }

    /// Absolute code of entry `idx`, decoded from the start of the table.
    /// Use [`BinarySearchCache::code_at`] for repeated random access.
    pub fn code(&self, idx: usize) -> u64 {
        assert!(idx < self.len(), "index {idx} out of range");
        (1..=idx).fold(self.words[0], |code, i| code + self.delta(i))
    }

    /// Occurrence count of entry `idx`.
    pub fn count(&self, idx: usize) -> u64 {
        if idx == 0 {
            return self.first_count;
        }
        let field = self.field(idx);
        if field < self.count_max {
            field
        } else {
            self.count_max + self.exceptions.get(&idx).copied().unwrap_or(0) as u64
        }
    }

    /// Add one occurrence to entry `idx`.
    pub fn increment(&mut self, idx: usize) {
        if idx == 0 {
            self.first_count += 1;
            return;
        }
        let field = self.field(idx);
        if field + 1 < self.count_max {
            self.words[idx] += 1u64 << self.delta_bits;
        } else if field < self.count_max {
            // counter saturates, excess starts at zero
            self.words[idx] += 1u64 << self.delta_bits;
            self.exceptions.insert(idx, 0);
        } else {
            let extra = self.exceptions.entry(idx).or_insert(0);
            *extra = extra.checked_add(1).unwrap_or_else(|| panic!("count overflow at entry {idx}"));
        }
    }

    /// Sum of all counts.
    pub fn total(&self) -> u64 {
        (0..self.len()).map(|i| self.count(i)).sum()
    }

    /// Walk `(index, code, count)` in ascending code order.
    pub fn iter(&self) -> CountIter<'_> {
        CountIter {
            table: self,
            idx: 0,
            code: self.first_code().unwrap_or(0),
        }
    }

    /// Decode forward from entry `idx` (holding `code`) to the first entry
    /// whose code is at least `target`.
    pub fn scan_from(&self, mut idx: usize, mut code: u64, target: u64) -> Option<(usize, u64)> {
        while code < target {
            idx += 1;
            if idx >= self.len() {
                return None;
            }
            code += self.delta(idx);
        }
        Some((idx, code))
    }

    /// Count the codes of a sorted buffer that occur in the table. Codes
    /// absent from the table are skipped. Returns the number of hits.
    pub fn accumulate(&mut self, sorted: &[u64], cache: &BinarySearchCache) -> u64 {
        let Some(&first) = sorted.first() else {
            return 0;
        };
        let Some((mut idx, mut code)) = cache.find(self, first) else {
            return 0;
        };
        let mut hits = 0u64;
        let mut q = 0usize;
        let n = self.len();
        while q < sorted.len() {
            let query = sorted[q];
            if query < code {
                q += 1;
            } else if query == code {
                self.increment(idx);
                hits += 1;
                q += 1;
            } else {
                idx += 1;
                if idx >= n {
                    break;
                }
                code += self.delta(idx);
            }
        }
        hits
    }

    /// Bytes held by the packed words and the side map.
    pub fn size_in_bytes(&self) -> usize {
        self.words.capacity() * 8
            + self.exceptions.capacity()
                * (std::mem::size_of::<usize>() + std::mem::size_of::<u32>())
    }
}

pub struct CountIter<'a> {
    table: &'a CountTable,
    idx: usize,
    code: u64,
}

impl Iterator for CountIter<'_> {
    type Item = (usize, u64, u64);

    fn next(&mut self) -> Option<Self::Item> {
        if self.idx >= self.table.len() {
            return None;
        }
        if self.idx > 0 {
            self.code += self.table.delta(self.idx);
        }
        let item = (self.idx, self.code, self.table.count(self.idx));
        self.idx += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let rest = self.table.len() - self.idx;
        (rest, Some(rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoded(t: &CountTable) -> Vec<(u64, u64)> {
        t.iter().map(|(_, c, n)| (c, n)).collect()
    }

    #[test]
    fn collapses_runs() {
        let t = CountTable::from_sorted(vec![1, 1, 1, 3, 5, 5]);
        assert_eq!(t.len(), 3);
        assert_eq!(decoded(&t), vec![(1, 3), (3, 1), (5, 2)]);
        assert_eq!(t.total(), 6);
        assert_eq!(t.delta_bits(), 2);
        assert_eq!(t.code(2), 5);
    }

    #[test]
    fn empty_input() {
        let t = CountTable::from_sorted(Vec::new());
        assert!(t.is_empty());
        assert_eq!(t.total(), 0);
        assert_eq!(t.iter().count(), 0);
    }

    #[test]
    fn single_code() {
        let t = CountTable::from_sorted(vec![42; 7]);
        assert_eq!(decoded(&t), vec![(42, 7)]);
    }

    #[test]
    fn full_width_deltas_keep_counts_in_side_map() {
        let t = CountTable::from_sorted(vec![0, 0, u64::MAX, u64::MAX, u64::MAX]);
        assert_eq!(t.delta_bits(), 64);
        assert_eq!(t.count_max(), 0);
        assert_eq!(decoded(&t), vec![(0, 2), (u64::MAX, 3)]);
        assert_eq!(t.overflowed(), 1);
    }

    #[test]
    fn increment_crosses_count_max() {
        // delta of 2^62 leaves 1 count bit, so count_max == 1
        let big = 1u64 << 62;
        let mut t = CountTable::from_sorted(vec![0, big, big * 2]);
        assert_eq!(t.count_max(), 1);
        assert_eq!(t.count(1), 1);
        t.increment(1);
        t.increment(1);
        t.increment(0);
        assert_eq!(t.count(1), 3);
        assert_eq!(t.count(0), 2);
        assert_eq!(decoded(&t), vec![(0, 2), (big, 3), (big * 2, 1)]);
    }

    #[test]
    fn increment_into_saturation() {
        // delta 2^61 leaves 2 count bits, count_max == 3
        let d = 1u64 << 61;
        let mut t = CountTable::from_sorted(vec![0, d, d]);
        assert_eq!(t.count_max(), 3);
        assert_eq!(t.count(1), 2);
        assert_eq!(t.overflowed(), 0);
        t.increment(1);
        assert_eq!(t.count(1), 3);
        assert_eq!(t.overflowed(), 1);
        t.increment(1);
        assert_eq!(t.count(1), 4);
        assert_eq!(t.delta(1), d);
    }

    #[test]
    fn scan_from_finds_first_not_smaller() {
        let t = CountTable::from_sorted(vec![2, 4, 8, 16]);
        assert_eq!(t.scan_from(0, 2, 5), Some((2, 8)));
        assert_eq!(t.scan_from(0, 2, 2), Some((0, 2)));
        assert_eq!(t.scan_from(1, 4, 16), Some((3, 16)));
        assert_eq!(t.scan_from(0, 2, 17), None);
    }

    #[test]
    fn accumulate_counts_hits_only() {
        let mut t = CountTable::from_sorted(vec![1, 3, 5]);
        let cache = BinarySearchCache::build(&t, 10);
        let hits = t.accumulate(&[0, 1, 1, 2, 5, 5, 6, 9], &cache);
        assert_eq!(hits, 4);
        assert_eq!(decoded(&t), vec![(1, 3), (3, 1), (5, 3)]);
    }
}
