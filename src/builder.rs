//! Build pipeline: sort and deduplicate the first codes, count inner-code
//! hits, then prefix-sum the counts into the leftborder table.

use crate::bscache::BinarySearchCache;
use crate::dedup::CountTable;
use crate::encode::CodeSource;
use crate::index::{CodeIndex, IndexError};
use crate::leftborder::{PartialSums, Store};
use crate::partition::mb;
use crate::radix::{CounterWidth, RadixConfig, RadixSorter};
use crate::spacelog::SpaceLog;

use log::{debug, info};
use std::path::PathBuf;

/// Build-time configuration.
#[derive(Clone, Debug)]
pub struct IndexConfig {
    counter_width: CounterWidth,
    threads: usize,
    memory_limit: Option<usize>,
    bscache_depth: u32,
    max_sample_shift: u32,
    radix_buffer_log: u32,
    insertion_threshold: usize,
    parallel_min_bins: usize,
    force_spill: bool,
    force_overflow: bool,
    spill_dir: Option<PathBuf>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            counter_width: CounterWidth::U32,
            threads: 1,
            memory_limit: None,
            bscache_depth: 10,
            max_sample_shift: 9,
            radix_buffer_log: 5,
            insertion_threshold: 32,
            parallel_min_bins: 0,
            force_spill: false,
            force_overflow: false,
            spill_dir: None,
        }
    }
}

impl IndexConfig {
    /// Counter width for bucket borders (default: 32 bit).
    pub fn counter_width(mut self, w: CounterWidth) -> Self {
        self.counter_width = w;
        self
    }
    /// Worker threads for sorting and insertion (default: 1).
    pub fn threads(mut self, n: usize) -> Self {
        self.threads = n.max(1);
        self
    }
    /// Memory limit in bytes. Without a limit nothing is spilled.
    pub fn memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }
    /// The binary-search cache samples `2^(depth+1)` codes.
    pub fn bscache_depth(mut self, d: u32) -> Self {
        self.bscache_depth = d.min(30);
        self
    }
    /// Upper bound for the log2 of the sample stride.
    pub fn max_sample_shift(mut self, s: u32) -> Self {
        self.max_sample_shift = s.min(30);
        self
    }
    /// log2 of the per-bin staging buffer of the radix sort.
    pub fn radix_buffer_log(mut self, l: u32) -> Self {
        self.radix_buffer_log = l;
        self
    }
    pub fn insertion_threshold(mut self, n: usize) -> Self {
        self.insertion_threshold = n;
        self
    }
    /// Minimum number of busy root bins for a parallel sort (0: one per thread).
    pub fn parallel_min_bins(mut self, n: usize) -> Self {
        self.parallel_min_bins = n;
        self
    }
    /// Always spill the leftborder table to a temporary file.
    pub fn force_spill(mut self, yes: bool) -> Self {
        self.force_spill = yes;
        self
    }
    /// Move every leftborder above 255 into the 64-bit overflow table, so
    /// small inputs take the same path as tables past 32 bits.
    pub fn force_overflow(mut self, yes: bool) -> Self {
        self.force_overflow = yes;
        self
    }
    /// Directory for the spill file (default: system temp dir).
    pub fn spill_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spill_dir = Some(dir.into());
        self
    }

    pub(crate) fn get_threads(&self) -> usize {
        self.threads
    }
    pub(crate) fn get_memory_limit(&self) -> Option<usize> {
        self.memory_limit
    }
    pub(crate) fn radix(&self) -> RadixConfig {
        RadixConfig::default()
            .counter_width(self.counter_width)
            .log_bufsize(self.radix_buffer_log)
            .insertion_threshold(self.insertion_threshold)
            .threads(self.threads)
            .parallel_min_bins(self.parallel_min_bins)
    }
}

/// Fail when `extra` more bytes would push the accounted total over the limit.
fn ensure_budget(cfg: &IndexConfig, space: &SpaceLog, extra: usize) -> Result<(), IndexError> {
    let Some(limit) = cfg.memory_limit else {
        return Ok(());
    };
    let used = space.total();
    let required = used + extra;
    if required > limit {
        return Err(IndexError::MemoryBudget {
            used,
            required,
            limit,
            shortfall: required - limit,
        });
    }
    Ok(())
}

/// Entries of the inner-code buffer for the counting pass.
fn accumulate_buffer_entries(
    cfg: &IndexConfig,
    space: &SpaceLog,
    differentcodes: usize,
) -> Result<usize, IndexError> {
    let floor = (differentcodes / 16).max(16);
    let elem = std::mem::size_of::<u64>();
    match cfg.memory_limit {
        Some(limit) => {
            ensure_budget(cfg, space, 2 * floor * elem)?;
            let remaining = limit - space.total();
            Ok((remaining / (2 * elem)).max(floor))
        }
        None => Ok((differentcodes / 5).max(floor)),
    }
}

fn count_buffer(
    sorter: &mut RadixSorter<u64>,
    table: &mut CountTable,
    cache: &BinarySearchCache,
    buffer: &mut Vec<u64>,
) -> Result<u64, IndexError> {
    if buffer.is_empty() {
        return Ok(0);
    }
    sorter.sort(buffer)?;
    let hits = table.accumulate(buffer, cache);
    buffer.clear();
    Ok(hits)
}

/// Build a [`CodeIndex`] from the first and inner codes of `source`.
pub fn build_code_index<S: CodeSource>(source: &S, cfg: IndexConfig) -> Result<CodeIndex, IndexError> {
    let mut space = SpaceLog::new();
    let width = cfg.counter_width;

    // Phase 1: collect, sort and deduplicate the first codes.
    let n = source.num_first_codes();
    width.check(n as u64)?;
    ensure_budget(&cfg, &space, n * std::mem::size_of::<u64>())?;
    let mut codes = Vec::with_capacity(n);
    source.for_each_first_code(|code, _| codes.push(code));
    debug_assert_eq!(codes.len(), n);
    space.add_workspace("allfirstcodes", codes.capacity() * std::mem::size_of::<u64>());

    let mut sorter = RadixSorter::<u64>::new(cfg.radix());
    space.add_workspace("radixsort", sorter.size_in_bytes());
    sorter.sort(&mut codes)?;
    space.subtract_workspace("allfirstcodes");

    let mut table = CountTable::from_sorted(codes);
    let dc = table.len();
    info!(
        "{n} first codes, {dc} different ({:.2}%)",
        if n == 0 { 0.0 } else { 100.0 * dc as f64 / n as f64 }
    );
    space.add_splitspace("countocc", table.size_in_bytes());
    let cache = BinarySearchCache::build(&table, cfg.bscache_depth);
    space.add_workspace("binsearchcache", cache.size_in_bytes());
    debug!(
        "binary-search cache: {} entries, width {}",
        cache.entries().len(),
        cache.width()
    );

    // Phase 2: count the inner codes that equal a first code.
    let capacity = accumulate_buffer_entries(&cfg, &space, dc)?;
    let capacity = capacity.min(source.total_length().max(16) as usize);
    let mut buffer: Vec<u64> = Vec::with_capacity(capacity);
    space.add_workspace("accumulate", capacity * std::mem::size_of::<u64>());
    let mut hits = 0u64;
    let mut failed: Option<IndexError> = None;
    source.for_each_inner_code(|code, _| {
        if failed.is_some() {
            return;
        }
        buffer.push(code);
        if buffer.len() == capacity {
            match count_buffer(&mut sorter, &mut table, &cache, &mut buffer) {
                Ok(h) => hits += h,
                Err(e) => failed = Some(e),
            }
        }
    });
    if let Some(e) = failed {
        return Err(e);
    }
    hits += count_buffer(&mut sorter, &mut table, &cache, &mut buffer)?;
    drop(buffer);
    space.subtract_workspace("accumulate");
    let sort_stats = sorter.stats();
    space.subtract_workspace("radixsort");
    let total = n as u64 + hits;
    info!(
        "firstcodehits: {hits} ({:.2}% of {} positions), {total} suffixes to insert",
        100.0 * hits as f64 / source.total_length().max(1) as f64,
        source.total_length()
    );
    debug!("radix sort: {sort_stats:?}");

    // Phase 3: partial sums, spilled when the budget is tight.
    let leftborder_bytes = (dc + 1) * width.bytes();
    let over_budget = cfg
        .memory_limit
        .is_some_and(|limit| space.total() + leftborder_bytes > limit);
    let store = if cfg.force_spill || over_budget {
        Store::Spill {
            dir: cfg.spill_dir.clone(),
        }
    } else {
        Store::Memory
    };
    let low_max = if cfg.force_overflow {
        u8::MAX as u64
    } else {
        u32::MAX as u64
    };
    let sums = PartialSums::build_with_low_max(&table, width, cfg.max_sample_shift, store, low_max)?;
    space.add_splitspace("leftborder", sums.borders().size_in_bytes());
    space.add_workspace("samples", (sums.num_samples() + 1) * std::mem::size_of::<u64>());
    info!(
        "max bucket size {}, space peak {:.2} MB",
        sums.max_bucket_size(),
        mb(space.peak())
    );

    Ok(CodeIndex {
        cfg,
        table,
        cache,
        sums,
        spacelog: space,
        num_first_codes: n,
        first_code_hits: hits,
        sort_stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::{CodeList, SequenceCollection};

    #[test]
    fn scenario_counts_and_borders() {
        let idx = build_code_index(&CodeList::new(vec![5, 1, 5, 3, 1, 1]), IndexConfig::default()).unwrap();
        assert_eq!(idx.differentcodes(), 3);
        assert_eq!(idx.first_code_hits(), 0);
        let borders: Vec<u64> = (0..=3).map(|i| idx.leftborder(i)).collect();
        assert_eq!(borders, vec![3, 4, 6, 6]);
    }

    #[test]
    fn inner_hits_are_counted() {
        let src = CodeList::new(vec![2, 4]).with_inner(vec![(4, 10), (3, 11), (2, 12), (4, 13), (9, 14)]);
        let idx = build_code_index(&src, IndexConfig::default()).unwrap();
        assert_eq!(idx.first_code_hits(), 3);
        assert_eq!(idx.count(0), 2);
        assert_eq!(idx.count(1), 3);
        assert_eq!(idx.total_suffixes(), 5);
    }

    #[test]
    fn tiny_buffer_flushes_many_times() {
        let first: Vec<u64> = (0..40).collect();
        let inner: Vec<(u64, u64)> = (0..1000u64).map(|i| ((i * 7) % 50, 100 + i)).collect();
        let expected_hits = inner.iter().filter(|(c, _)| *c < 40).count() as u64;
        let idx = build_code_index(&CodeList::new(first).with_inner(inner), IndexConfig::default()).unwrap();
        assert_eq!(idx.first_code_hits(), expected_hits);
    }

    #[test]
    fn sequences_end_to_end() {
        let seqs = [&b"ACGTACGT"[..], b"ACGA", b"TTTT", b"CGTA"];
        let src = SequenceCollection::from_sequences(3, seqs);
        let idx = build_code_index(&src, IndexConfig::default()).unwrap();
        // ACG twice, TTT, CGT
        assert_eq!(idx.num_first_codes(), 4);
        assert_eq!(idx.differentcodes(), 3);
        // inner ACG (pos 4), CGT (pos 1, 5), TTT (pos 13)
        assert_eq!(idx.first_code_hits(), 4);
        assert_eq!(idx.total_suffixes(), 8);
    }

    #[test]
    fn memory_limit_too_small() {
        let err = build_code_index(&CodeList::new((0..1000).collect()), IndexConfig::default().memory_limit(100))
            .err()
            .unwrap();
        assert!(matches!(err, IndexError::MemoryBudget { shortfall, .. } if shortfall == 7900));
    }

    #[test]
    fn tight_limit_spills() {
        // fits the counting pass, but not the count table plus an in-memory leftborder
        let src = CodeList::new((0..10_000).collect());
        let cfg = IndexConfig::default()
            .memory_limit(105_000)
            .radix_buffer_log(0)
            .bscache_depth(3);
        let idx = build_code_index(&src, cfg).unwrap();
        assert!(idx.spill_path().is_some());
        assert_eq!(idx.leftborder(9_999), 10_000);
        assert_eq!(idx.leftborder(10_000), 10_000);
    }

    #[test]
    fn forced_spill() {
        let idx = build_code_index(&CodeList::new(vec![5, 1, 5, 3, 1, 1]), IndexConfig::default().force_spill(true)).unwrap();
        let path = idx.spill_path().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 16);
        drop(idx);
        assert!(!path.exists());
    }
}
