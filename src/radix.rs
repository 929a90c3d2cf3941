//! In-place MSD radix sort over [`RadixKey`] elements.
//!
//! Ranges are processed from an explicit stack of `(start, len, shift)` work
//! items; each item is shuffled by one key byte and its bins are either
//! finished directly (width 2 or small enough for insertion sort) or pushed
//! back with the next lower byte. With more than one thread the root range is
//! shuffled once and its 256 bins are split into weight-balanced groups that
//! are sorted on disjoint sub-slices inside a local rayon pool.

use crate::index::IndexError;
use crate::partition::{PrefixWeights, partition_by_weight};
use crate::radixbuf::{BINS, RadixBuffer, RadixKey, ShuffleStats};

use log::debug;
use rayon::prelude::*;
use std::ops::Range;

/// Width of the counters used for bin borders and bucket borders.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CounterWidth {
    /// 32-bit counters; inputs up to `u32::MAX` elements.
    #[default]
    U32,
    /// 64-bit counters.
    U64,
}

impl CounterWidth {
    /// Largest number of elements addressable with this width.
    pub fn max_elements(self) -> u64 {
        match self {
            CounterWidth::U32 => u32::MAX as u64,
            CounterWidth::U64 => u64::MAX,
        }
    }

    /// Bytes per stored counter.
    pub fn bytes(self) -> usize {
        match self {
            CounterWidth::U32 => 4,
            CounterWidth::U64 => 8,
        }
    }

    /// Fail with [`IndexError::CounterWidth`] when `len` does not fit.
    pub fn check(self, len: u64) -> Result<(), IndexError> {
        if len > self.max_elements() {
            return Err(IndexError::CounterWidth {
                len,
                max: self.max_elements(),
            });
        }
        Ok(())
    }
}

/// Sorter configuration. See [`crate::IndexConfig`] for the pipeline-wide knobs.
#[derive(Clone, Debug)]
pub struct RadixConfig {
    counter_width: CounterWidth,
    log_bufsize: u32,
    insertion_threshold: usize,
    threads: usize,
    parallel_min_bins: usize,
}

impl Default for RadixConfig {
    fn default() -> Self {
        Self {
            counter_width: CounterWidth::U32,
            log_bufsize: 5,
            insertion_threshold: 32,
            threads: 1,
            parallel_min_bins: 0,
        }
    }
}

impl RadixConfig {
    pub fn counter_width(mut self, w: CounterWidth) -> Self {
        self.counter_width = w;
        self
    }
    /// log2 of the staging buffer size per bin (clamped to 0..=12).
    pub fn log_bufsize(mut self, log: u32) -> Self {
        self.log_bufsize = log.min(12);
        self
    }
    /// Bins up to this width are finished with insertion sort (minimum 2).
    pub fn insertion_threshold(mut self, n: usize) -> Self {
        self.insertion_threshold = n.max(2);
        self
    }
    pub fn threads(mut self, n: usize) -> Self {
        self.threads = n.max(1);
        self
    }
    /// Minimum number of non-trivial root bins needed to go parallel.
    /// `0` means "at least as many as threads".
    pub fn parallel_min_bins(mut self, n: usize) -> Self {
        self.parallel_min_bins = n;
        self
    }
}

/// Counters collected over one or more sorts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RadixStats {
    pub cached_shuffles: u64,
    pub uncached_shuffles: u64,
    pub insertion_sorts: u64,
    pub max_stack_depth: usize,
    /// Number of parallel parts the root was split into (0 for sequential).
    pub parts: usize,
}

impl RadixStats {
    pub fn merge(&mut self, other: &RadixStats) {
        self.cached_shuffles += other.cached_shuffles;
        self.uncached_shuffles += other.uncached_shuffles;
        self.insertion_sorts += other.insertion_sorts;
        self.max_stack_depth = self.max_stack_depth.max(other.max_stack_depth);
        self.parts = self.parts.max(other.parts);
    }
}

#[derive(Clone, Copy, Debug)]
struct WorkItem {
    start: usize,
    len: usize,
    shift: u32,
}

/// Reusable sorter: owns the staging buffers and the work stack.
pub struct RadixSorter<T> {
    cfg: RadixConfig,
    buffer: RadixBuffer<T>,
    stack: Vec<WorkItem>,
    insertion_sorts: u64,
    max_stack_depth: usize,
    parts: usize,
    // shuffle counts of finished parallel workers
    worker_shuffles: ShuffleStats,
    // built on the first parallel sort, reused afterwards
    pool: Option<rayon::ThreadPool>,
    pools_built: usize,
}

impl<T: RadixKey> RadixSorter<T> {
    pub fn new(cfg: RadixConfig) -> Self {
        let buffer = RadixBuffer::new(cfg.log_bufsize);
        Self {
            cfg,
            buffer,
            stack: Vec::new(),
            insertion_sorts: 0,
            max_stack_depth: 0,
            parts: 0,
            worker_shuffles: ShuffleStats::default(),
            pool: None,
            pools_built: 0,
        }
    }

    /// Bytes of auxiliary memory held by this sorter.
    pub fn size_in_bytes(&self) -> usize {
        self.buffer.size_in_bytes() + self.stack.capacity() * std::mem::size_of::<WorkItem>()
    }

    pub fn stats(&self) -> RadixStats {
        let s = self.buffer.stats();
        RadixStats {
            cached_shuffles: s.cached + self.worker_shuffles.cached,
            uncached_shuffles: s.uncached + self.worker_shuffles.uncached,
            insertion_sorts: self.insertion_sorts,
            max_stack_depth: self.max_stack_depth,
            parts: self.parts,
        }
    }

    /// Sort `data` ascending by key. Payloads travel with their keys; the
    /// relative order of equal keys is unspecified.
    pub fn sort(&mut self, data: &mut [T]) -> Result<RadixStats, IndexError> {
        self.cfg.counter_width.check(data.len() as u64)?;
        if data.len() < 2 {
            return Ok(self.stats());
        }
        let top = T::KEY_BITS - 8;
        if self.cfg.threads > 1 {
            self.sort_parallel(data, top)?;
        } else {
            self.push(WorkItem {
                start: 0,
                len: data.len(),
                shift: top,
            });
            self.run(data);
        }
        debug_assert!(is_sorted(data), "radix sort produced unsorted output");
        Ok(self.stats())
    }

    fn push(&mut self, item: WorkItem) {
        self.stack.push(item);
        self.max_stack_depth = self.max_stack_depth.max(self.stack.len());
    }

    fn run(&mut self, data: &mut [T]) {
        while let Some(item) = self.stack.pop() {
            let range = &mut data[item.start..item.start + item.len];
            self.buffer.shuffle(range, item.shift);
            if item.shift > 0 {
                for bin in 0..BINS {
                    let r = self.buffer.bin_range(bin);
                    self.schedule_bin(item.start, range, r, item.shift - 8);
                }
            }
        }
    }

    /// Finish a small bin right away, otherwise push it for the next byte.
    /// `r` is relative to `range`, which starts at `offset` in the sorted slice.
    fn schedule_bin(&mut self, offset: usize, range: &mut [T], r: Range<usize>, shift: u32) {
        let width = r.len();
        if width < 2 {
            return;
        }
        if width == 2 {
            if range[r.start + 1].key_lt(&range[r.start]) {
                range.swap(r.start, r.start + 1);
            }
        } else if width <= self.cfg.insertion_threshold {
            insertion_sort(&mut range[r]);
            self.insertion_sorts += 1;
        } else {
            self.push(WorkItem {
                start: offset + r.start,
                len: width,
                shift,
            });
        }
    }

    fn sort_parallel(&mut self, data: &mut [T], top: u32) -> Result<(), IndexError> {
        let threads = self.cfg.threads;
        self.buffer.shuffle(data, top);
        let bins: Vec<Range<usize>> = (0..BINS).map(|b| self.buffer.bin_range(b)).collect();
        let busy = bins.iter().filter(|r| r.len() > 1).count();
        let min_bins = if self.cfg.parallel_min_bins == 0 {
            threads
        } else {
            self.cfg.parallel_min_bins
        };

        if top == 0 || busy < min_bins {
            debug!(
                "radixsort: {busy} non-trivial root bins < {min_bins}, sorting {} elements sequentially",
                data.len()
            );
            if top > 0 {
                for r in bins {
                    self.schedule_bin(0, data, r, top - 8);
                }
                self.run(data);
            }
            return Ok(());
        }

        let weights = PrefixWeights::from_weights(bins.iter().map(|r| r.len() as u64));
        let parts = partition_by_weight(&weights, threads);

        // Bins are contiguous, so every group of bins owns one sub-slice.
        let mut jobs: Vec<(Range<usize>, usize, &mut [T])> = Vec::with_capacity(parts.len());
        let mut rest: &mut [T] = data;
        let mut consumed = 0usize;
        for part in parts {
            if part.is_empty() {
                continue;
            }
            let lo = bins[part.start].start;
            let hi = bins[part.end - 1].end;
            debug_assert_eq!(lo, consumed);
            let (mine, tail) = std::mem::take(&mut rest).split_at_mut(hi - lo);
            rest = tail;
            consumed = hi;
            jobs.push((part, lo, mine));
        }
        self.parts = jobs.len();
        debug!(
            "radixsort: {} elements, {busy} root bins split into {} parts on {threads} threads",
            consumed,
            jobs.len()
        );

        let pool = match self.pool.take() {
            Some(pool) => pool,
            None => {
                self.pools_built += 1;
                debug!("radixsort: building thread pool with {threads} threads");
                rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .build()
                    .map_err(|e| IndexError::ThreadPool(e.to_string()))?
            }
        };
        let worker_cfg = self.cfg.clone().threads(1);
        let bins = &bins;
        let results: Vec<RadixStats> = pool.install(|| {
            jobs.into_par_iter()
                .map(|(part, lo, slice)| {
                    let mut worker = RadixSorter::<T>::new(worker_cfg.clone());
                    for bin in part {
                        let r = &bins[bin];
                        worker.schedule_bin(0, slice, r.start - lo..r.end - lo, top - 8);
                    }
                    worker.run(slice);
                    worker.stats()
                })
                .collect()
        });
        self.pool = Some(pool);

        for r in &results {
            self.insertion_sorts += r.insertion_sorts;
            self.max_stack_depth = self.max_stack_depth.max(r.max_stack_depth);
            self.worker_shuffles.cached += r.cached_shuffles;
            self.worker_shuffles.uncached += r.uncached_shuffles;
        }
        Ok(())
    }
}

/// Sort `data` with a default single-threaded sorter.
pub fn radix_sort<T: RadixKey>(data: &mut [T]) -> Result<RadixStats, IndexError> {
    RadixSorter::new(RadixConfig::default().counter_width(CounterWidth::U64)).sort(data)
}

/// Plain insertion sort by key.
pub fn insertion_sort<T: RadixKey>(data: &mut [T]) {
    for i in 1..data.len() {
        let value = data[i];
        let mut j = i;
        while j > 0 && value.key_lt(&data[j - 1]) {
            data[j] = data[j - 1];
            j -= 1;
        }
        data[j] = value;
    }
}

pub(crate) fn is_sorted<T: RadixKey>(data: &[T]) -> bool {
    data.windows(2).all(|w| !w[1].key_lt(&w[0]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radixbuf::{CodePos, KeyPair};

    fn lcg(n: usize, seed: u64) -> Vec<u64> {
        let mut x = seed;
        (0..n)
            .map(|_| {
                x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                x
            })
            .collect()
    }

    #[test]
    fn sorts_random_u64() {
        let mut data = lcg(50_000, 3);
        let mut expected = data.clone();
        expected.sort_unstable();
        let stats = radix_sort(&mut data).unwrap();
        assert_eq!(data, expected);
        assert!(stats.cached_shuffles >= 1);
    }

    #[test]
    fn sorts_small_inputs() {
        for n in 0..40usize {
            let mut data: Vec<u64> = lcg(n, n as u64 + 1).into_iter().map(|x| x % 7).collect();
            let mut expected = data.clone();
            expected.sort_unstable();
            radix_sort(&mut data).unwrap();
            assert_eq!(data, expected, "n={n}");
        }
    }

    #[test]
    fn sorts_narrow_codes_with_shared_prefix() {
        // all keys share the top 7 bytes
        let mut data: Vec<u64> = lcg(10_000, 9).into_iter().map(|x| x & 0xFF).collect();
        let mut expected = data.clone();
        expected.sort_unstable();
        let stats = radix_sort(&mut data).unwrap();
        assert_eq!(data, expected);
        assert!(stats.max_stack_depth >= 1);
    }

    #[test]
    fn sorts_u32() {
        let mut data: Vec<u32> = lcg(5000, 5).into_iter().map(|x| (x >> 17) as u32).collect();
        let mut expected = data.clone();
        expected.sort_unstable();
        radix_sort(&mut data).unwrap();
        assert_eq!(data, expected);
    }

    #[test]
    fn codepos_keeps_payload_attached() {
        let codes = lcg(3000, 21);
        let mut data: Vec<CodePos> = codes
            .iter()
            .enumerate()
            .map(|(i, &c)| CodePos {
                code: c % 500,
                pos: i as u64,
            })
            .collect();
        radix_sort(&mut data).unwrap();
        assert!(is_sorted(&data));
        for cp in &data {
            assert_eq!(codes[cp.pos as usize] % 500, cp.code);
        }
        let mut seen: Vec<u64> = data.iter().map(|cp| cp.pos).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..3000).collect::<Vec<_>>());
    }

    #[test]
    fn keypair_lexicographic() {
        let a = lcg(4000, 1);
        let b = lcg(4000, 2);
        let mut data: Vec<KeyPair> = a
            .iter()
            .zip(&b)
            .map(|(&x, &y)| KeyPair { a: x % 16, b: y })
            .collect();
        let mut expected = data.clone();
        expected.sort();
        radix_sort(&mut data).unwrap();
        assert_eq!(data, expected);
    }

    #[test]
    fn parallel_matches_sequential() {
        let mut seq = lcg(40_000, 77);
        let mut par = seq.clone();
        RadixSorter::new(RadixConfig::default()).sort(&mut seq).unwrap();
        let stats = RadixSorter::new(RadixConfig::default().threads(4))
            .sort(&mut par)
            .unwrap();
        assert_eq!(seq, par);
        assert!(stats.parts >= 2);
    }

    #[test]
    fn parallel_sorter_reuses_its_pool() {
        let mut sorter = RadixSorter::new(RadixConfig::default().threads(2));
        for seed in 1..=5 {
            let mut data = lcg(20_000, seed);
            let mut expected = data.clone();
            expected.sort_unstable();
            sorter.sort(&mut data).unwrap();
            assert_eq!(data, expected);
        }
        assert_eq!(sorter.pools_built, 1);
        assert!(sorter.pool.is_some());
    }

    #[test]
    fn parallel_falls_back_when_root_is_concentrated() {
        // every key has the same top byte
        let mut data: Vec<u64> = lcg(5000, 8).into_iter().map(|x| x >> 8).collect();
        let mut expected = data.clone();
        expected.sort_unstable();
        let stats = RadixSorter::new(RadixConfig::default().threads(3))
            .sort(&mut data)
            .unwrap();
        assert_eq!(data, expected);
        assert_eq!(stats.parts, 0);
    }

    #[test]
    fn sort_is_idempotent() {
        let mut data = lcg(2000, 4);
        radix_sort(&mut data).unwrap();
        let once = data.clone();
        radix_sort(&mut data).unwrap();
        assert_eq!(once, data);
    }

    #[test]
    fn counter_width_rejects_long_input() {
        let err = CounterWidth::U32.check(u32::MAX as u64 + 1).unwrap_err();
        assert!(matches!(err, IndexError::CounterWidth { .. }));
        assert!(CounterWidth::U32.check(u32::MAX as u64).is_ok());
        assert!(CounterWidth::U64.check(u64::MAX).is_ok());
    }
}
