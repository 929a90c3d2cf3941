//! Sampled lookup table over the delta-packed code table.
//!
//! Every `width`-th entry's index and absolute code is stored. Query: upper
//! bound in the samples, then decode forward at most `width` entries.
//! Disabled (empty) when the table has no more entries than samples.

use crate::dedup::CountTable;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub index: usize,
    pub code: u64,
}

#[derive(Clone, Debug, Default)]
pub struct BinarySearchCache {
    entries: Vec<CacheEntry>,
    width: usize,
}

impl BinarySearchCache {
    /// Sample `2^(depth+1)` evenly spaced entries of `table`.
    pub fn build(table: &CountTable, depth: u32) -> Self {
        let allocated = 1usize << (depth.min(40) + 1);
        let n = table.len();
        if allocated >= n {
            return Self::default();
        }
        let width = n.div_ceil(allocated);
        let mut entries = Vec::with_capacity(allocated);
        for (idx, code, _) in table.iter() {
            if idx % width == 0 && entries.len() < allocated {
                entries.push(CacheEntry { index: idx, code });
            }
        }
        Self { entries, width }
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        !self.entries.is_empty()
    }

    /// Distance between sampled entries (0 when disabled).
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn entries(&self) -> &[CacheEntry] {
        &self.entries
    }

    pub fn size_in_bytes(&self) -> usize {
        self.entries.capacity() * std::mem::size_of::<CacheEntry>()
    }

    /// Nearest sampled start point at or below `code`.
    fn start_for_code(&self, table: &CountTable, code: u64) -> Option<(usize, u64)> {
        let first = table.first_code()?;
        let k = self.entries.partition_point(|e| e.code <= code);
        if k == 0 {
            Some((0, first))
        } else {
            let e = self.entries[k - 1];
            Some((e.index, e.code))
        }
    }

    /// Index and code of the first entry with code `>= code`, or `None` when
    /// `code` is larger than every code in the table.
    pub fn find(&self, table: &CountTable, code: u64) -> Option<(usize, u64)> {
        let (idx, start) = self.start_for_code(table, code)?;
        table.scan_from(idx, start, code)
    }

    /// Exact lookup: index of `code` if present.
    pub fn find_exact(&self, table: &CountTable, code: u64) -> Option<usize> {
        match self.find(table, code) {
            Some((idx, c)) if c == code => Some(idx),
            _ => None,
        }
    }

    /// Absolute code of entry `idx`.
    pub fn code_at(&self, table: &CountTable, idx: usize) -> u64 {
        assert!(idx < table.len(), "index {idx} out of range");
        let (mut i, mut code) = match self.entries.partition_point(|e| e.index <= idx) {
            0 => (0, table.first_code().unwrap_or(0)),
            k => (self.entries[k - 1].index, self.entries[k - 1].code),
        };
        while i < idx {
            i += 1;
            code += table.delta(i);
        }
        code
    }
}
