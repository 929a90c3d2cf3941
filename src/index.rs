//! CodeIndex: the result of a build, plus the parallel consumer API.
//!
//! The index owns the deduplicated code table, its binary-search cache and
//! the partial-sum table. Consumers receive disjoint bucket ranges together
//! with the matching slice of the output table and claim slots through
//! [`BucketPart::place`].

use log::info;
use rayon::prelude::*;
use std::ops::{Range, RangeInclusive};
use std::path::PathBuf;
use thiserror::Error;

use crate::builder::IndexConfig;
use crate::bscache::BinarySearchCache;
use crate::dedup::CountTable;
use crate::encode::CodeSource;
use crate::leftborder::{PartClaims, PartialSums};
use crate::partition::{
    Budget, Cumulative, divide_parts, mb, part_weights, partition_by_weight, parts_for_budget,
    remove_empty_parts, variance,
};
use crate::radix::{CounterWidth, RadixConfig, RadixSorter, RadixStats};
use crate::radixbuf::CodePos;
use crate::spacelog::SpaceLog;

#[derive(Debug, Error)]
/// Errors returned by the indexing engine.
pub enum IndexError {
    /// I/O error on the spill file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// More elements than the configured counter width can index.
    #[error("{len} elements exceed the counter width limit of {max}")]
    CounterWidth { len: u64, max: u64 },
    /// Not enough memory for the next phase.
    #[error(
        "memory limit of {limit} bytes exceeded: {used} bytes in use, {required} required, {shortfall} short"
    )]
    MemoryBudget {
        used: usize,
        required: usize,
        limit: usize,
        shortfall: usize,
    },
    /// Worker pool could not be built.
    #[error("thread pool: {0}")]
    ThreadPool(String),
    /// Bytemuck cast of the mapped spill file failed.
    #[error("Cast error: {0}")]
    Cast(String),
    /// A consumer callback failed.
    #[error("consumer failed: {0}")]
    Consumer(String),
}

/// Read-only view used by consumers to map codes to bucket indices.
#[derive(Clone, Copy)]
pub struct CodeLookup<'a> {
    table: &'a CountTable,
    cache: &'a BinarySearchCache,
}

impl CodeLookup<'_> {
    /// Bucket index and code of the first unique code `>= code`.
    #[inline]
    pub fn find(&self, code: u64) -> Option<(usize, u64)> {
        self.cache.find(self.table, code)
    }

    #[inline]
    pub fn delta(&self, idx: usize) -> u64 {
        self.table.delta(idx)
    }

    pub fn differentcodes(&self) -> usize {
        self.table.len()
    }
}

/// One worker's share: a bucket range, its claim counters and its slice of
/// the output table.
pub struct BucketPart<'a, T> {
    part: usize,
    codes: RangeInclusive<u64>,
    claims: PartClaims<'a>,
    target: &'a mut [T],
}

impl<T> BucketPart<'_, T> {
    /// Ordinal of this part.
    pub fn part(&self) -> usize {
        self.part
    }

    pub fn buckets(&self) -> Range<usize> {
        self.claims.buckets()
    }

    /// Output slots owned by this part.
    pub fn slots(&self) -> Range<u64> {
        self.claims.slots()
    }

    /// Smallest and largest unique code in this part.
    pub fn codes(&self) -> RangeInclusive<u64> {
        self.codes.clone()
    }

    /// Claim a slot of bucket `idx` (see [`PartClaims::claim`]).
    #[inline]
    pub fn claim(&mut self, idx: usize) -> u64 {
        self.claims.claim(idx)
    }

    /// Claim a slot of bucket `idx` and store `value` there.
    #[inline]
    pub fn place(&mut self, idx: usize, value: T) -> u64 {
        let slot = self.claims.claim(idx);
        let base = self.claims.slots().start;
        self.target[(slot - base) as usize] = value;
        slot
    }

    /// This part's slice of the output table.
    pub fn target(&mut self) -> &mut [T] {
        &mut self.target[..]
    }
}

/// Deduplicated, counted and prefix-summed first codes.
pub struct CodeIndex {
    pub(crate) cfg: IndexConfig,
    pub(crate) table: CountTable,
    pub(crate) cache: BinarySearchCache,
    pub(crate) sums: PartialSums,
    pub(crate) spacelog: SpaceLog,
    pub(crate) num_first_codes: usize,
    pub(crate) first_code_hits: u64,
    pub(crate) sort_stats: RadixStats,
}

impl CodeIndex {
    pub fn config(&self) -> &IndexConfig {
        &self.cfg
    }

    pub fn count_table(&self) -> &CountTable {
        &self.table
    }

    pub fn cache(&self) -> &BinarySearchCache {
        &self.cache
    }

    pub fn partial_sums(&self) -> &PartialSums {
        &self.sums
    }

    pub fn spacelog(&self) -> &SpaceLog {
        &self.spacelog
    }

    pub fn lookup(&self) -> CodeLookup<'_> {
        CodeLookup {
            table: &self.table,
            cache: &self.cache,
        }
    }

    /// Sequences with a valid first code.
    pub fn num_first_codes(&self) -> usize {
        self.num_first_codes
    }

    /// Inner codes that matched a first code.
    pub fn first_code_hits(&self) -> u64 {
        self.first_code_hits
    }

    pub fn differentcodes(&self) -> usize {
        self.table.len()
    }

    /// Number of suffixes a consumer places: first codes plus hits.
    pub fn total_suffixes(&self) -> u64 {
        self.sums.total()
    }

    pub fn max_bucket_size(&self) -> u64 {
        self.sums.max_bucket_size()
    }

    pub fn sort_stats(&self) -> RadixStats {
        self.sort_stats
    }

    /// Exact bucket index of `code`.
    pub fn find(&self, code: u64) -> Option<usize> {
        self.cache.find_exact(&self.table, code)
    }

    pub fn code(&self, idx: usize) -> u64 {
        self.cache.code_at(&self.table, idx)
    }

    pub fn count(&self, idx: usize) -> u64 {
        self.table.count(idx)
    }

    pub fn leftborder(&self, idx: usize) -> u64 {
        self.sums.leftborder(idx)
    }

    /// Path of the spill file when the leftborder table was spilled.
    pub fn spill_path(&self) -> Option<PathBuf> {
        self.sums.borders().spill_path()
    }

    fn thread_pool(&self) -> Result<rayon::ThreadPool, IndexError> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.cfg.get_threads())
            .build()
            .map_err(|e| IndexError::ThreadPool(e.to_string()))
    }

    /// Smallest and largest code of a bucket range (empty for no buckets).
    fn code_range(&self, buckets: &Range<usize>) -> RangeInclusive<u64> {
        if buckets.is_empty() {
            1..=0
        } else {
            self.cache.code_at(&self.table, buckets.start)..=self.cache.code_at(&self.table, buckets.end - 1)
        }
    }

    /// Run `f` once for each non-empty part of a `numparts`-way split, all
    /// parts at once on the configured number of threads. `target` must hold
    /// exactly [`total_suffixes`](Self::total_suffixes) entries. Claims can
    /// only be made once per index. Returns the bucket ranges that were
    /// processed.
    pub fn for_each_part<T, F>(
        &mut self,
        target: &mut [T],
        numparts: usize,
        f: F,
    ) -> Result<Vec<Range<usize>>, IndexError>
    where
        T: Send,
        F: Fn(&CodeLookup<'_>, &mut BucketPart<'_, T>) -> Result<(), IndexError> + Sync,
    {
        assert_eq!(
            target.len() as u64,
            self.sums.total(),
            "target must hold one entry per suffix"
        );
        let parts = partition_by_weight(&self.sums, numparts.max(1));
        let weights = part_weights(&self.sums, &parts);
        info!(
            "{} parts over {} buckets, widths {:?}, variance {:.2}",
            parts.len(),
            self.table.len(),
            weights,
            variance(&weights)
        );
        let codes: Vec<RangeInclusive<u64>> = parts.iter().map(|p| self.code_range(p)).collect();
        let pool = self.thread_pool()?;

        let lookup = CodeLookup {
            table: &self.table,
            cache: &self.cache,
        };
        let claims = self.sums.split_claims(&parts);
        let mut jobs = bucket_parts(claims.into_iter().zip(codes).enumerate(), target);
        let processed: Vec<Range<usize>> = jobs.iter().map(|j| j.buckets()).collect();
        run_parts(&pool, &lookup, &mut jobs, &f)?;
        Ok(processed)
    }

    /// Reference consumer: place every suffix position of `source` into its
    /// bucket, one memory-bounded part after the other.
    ///
    /// Without a memory limit all buckets form one part. With a limit, the
    /// fewest parts whose widest part fits next to the accounted space are
    /// used. A single buffer of the widest part's size is reused for every
    /// part, and the buckets of each part are split over the configured
    /// threads. `emit` receives the slot range of each finished part and
    /// its positions, in ascending slot order. Returns the bucket ranges of
    /// the parts.
    pub fn insert_suffixes<S, E>(
        &mut self,
        source: &S,
        mut emit: E,
    ) -> Result<Vec<Range<usize>>, IndexError>
    where
        S: CodeSource,
        E: FnMut(Range<u64>, &[u64]) -> Result<(), IndexError>,
    {
        let dc = self.table.len();
        if dc == 0 {
            return Ok(Vec::new());
        }
        let elem = std::mem::size_of::<u64>();
        let parts = match self.cfg.get_memory_limit() {
            Some(limit) => parts_for_budget(
                &self.sums,
                Budget {
                    used: self.spacelog.total(),
                    bytes_per_entry: elem,
                    limit,
                },
            )?,
            None => vec![0..dc],
        };
        let threads = self.cfg.get_threads();
        let groups: Vec<Vec<Range<usize>>> = parts
            .iter()
            .map(|p| remove_empty_parts(divide_parts(&self.sums, p.clone(), threads)))
            .collect();
        let part_slots: Vec<Range<u64>> = parts
            .iter()
            .map(|p| self.sums.cumulative(p.start)..self.sums.cumulative(p.end))
            .collect();
        let widest = part_slots.iter().map(|r| r.end - r.start).max().unwrap_or(0) as usize;
        let subparts: Vec<Range<usize>> = groups.iter().flatten().cloned().collect();
        let codes: Vec<RangeInclusive<u64>> = subparts.iter().map(|p| self.code_range(p)).collect();
        let pool = self.thread_pool()?;
        info!(
            "inserting {} suffixes in {} parts, widest {widest} ({:.2} MB), {} threads",
            self.sums.total(),
            parts.len(),
            mb(widest * elem),
            threads
        );

        self.spacelog.add_workspace("suffixtable", widest * elem);
        let mut buffer = vec![0u64; widest];
        let lookup = CodeLookup {
            table: &self.table,
            cache: &self.cache,
        };
        let insert = |lookup: &CodeLookup<'_>, part: &mut BucketPart<'_, u64>| {
            insert_part(source, lookup, part)
        };
        let mut claims = self.sums.split_claims(&subparts).into_iter().zip(codes).enumerate();
        for (group, slots) in groups.iter().zip(part_slots) {
            let width = (slots.end - slots.start) as usize;
            let mut jobs = bucket_parts(claims.by_ref().take(group.len()), &mut buffer[..width]);
            debug_assert!(jobs.first().is_some_and(|j| j.slots().start == slots.start));
            run_parts(&pool, &lookup, &mut jobs, &insert)?;
            drop(jobs);
            emit(slots, &buffer[..width])?;
        }
        self.spacelog.subtract_workspace("suffixtable");
        Ok(parts)
    }

    /// [`insert_suffixes`](Self::insert_suffixes) into one table holding all
    /// suffixes, bucket-sorted by first code.
    pub fn insert_all<S: CodeSource>(&mut self, source: &S) -> Result<Vec<u64>, IndexError> {
        let mut table = Vec::with_capacity(self.sums.total() as usize);
        self.insert_suffixes(source, |slots, positions| {
            debug_assert_eq!(slots.start, table.len() as u64);
            table.extend_from_slice(positions);
            Ok(())
        })?;
        Ok(table)
    }
}

/// Pair every claim range with its slice of `target`, which starts at the
/// first claim's floor. Parts without buckets are skipped.
fn bucket_parts<'c: 't, 't, T, I>(claims: I, target: &'t mut [T]) -> Vec<BucketPart<'t, T>>
where
    I: Iterator<Item = (usize, (PartClaims<'c>, RangeInclusive<u64>))>,
{
    let mut jobs = Vec::new();
    let mut rest: &'t mut [T] = target;
    for (part, (claims, codes)) in claims {
        let claims: PartClaims<'t> = claims;
        let slots = claims.slots();
        let (mine, tail) = std::mem::take(&mut rest).split_at_mut((slots.end - slots.start) as usize);
        rest = tail;
        if claims.buckets().is_empty() {
            continue;
        }
        jobs.push(BucketPart {
            part,
            codes,
            claims,
            target: mine,
        });
    }
    jobs
}

/// Run `f` on every part in `pool`; the first error is returned after all
/// parts finished.
fn run_parts<T, F>(
    pool: &rayon::ThreadPool,
    lookup: &CodeLookup<'_>,
    jobs: &mut [BucketPart<'_, T>],
    f: &F,
) -> Result<(), IndexError>
where
    T: Send,
    F: Fn(&CodeLookup<'_>, &mut BucketPart<'_, T>) -> Result<(), IndexError> + Sync,
{
    pool.install(|| {
        jobs.par_iter_mut()
            .map(|job| f(lookup, job))
            .collect::<Result<Vec<()>, IndexError>>()
    })?;
    Ok(())
}

/// Buffer, sort and place the `(code, pos)` pairs falling into one part.
fn insert_part<S: CodeSource>(
    source: &S,
    lookup: &CodeLookup<'_>,
    part: &mut BucketPart<'_, u64>,
) -> Result<(), IndexError> {
    let codes = part.codes();
    let width = (part.slots().end - part.slots().start) as usize;
    let capacity = width.clamp(16, 1 << 20);
    let mut sorter =
        RadixSorter::<CodePos>::new(RadixConfig::default().counter_width(CounterWidth::U64));
    let mut buffer: Vec<CodePos> = Vec::with_capacity(capacity);
    let mut failed: Option<IndexError> = None;

    let mut visit = |code: u64, pos: u64| {
        if failed.is_some() || !codes.contains(&code) {
            return;
        }
        buffer.push(CodePos { code, pos });
        if buffer.len() == capacity {
            if let Err(e) = place_sorted(&mut sorter, lookup, part, &mut buffer) {
                failed = Some(e);
            }
        }
    };
    source.for_each_first_code(&mut visit);
    source.for_each_inner_code(&mut visit);
    if let Some(e) = failed {
        return Err(e);
    }
    place_sorted(&mut sorter, lookup, part, &mut buffer)
}

fn place_sorted(
    sorter: &mut RadixSorter<CodePos>,
    lookup: &CodeLookup<'_>,
    part: &mut BucketPart<'_, u64>,
    buffer: &mut Vec<CodePos>,
) -> Result<(), IndexError> {
    if buffer.is_empty() {
        return Ok(());
    }
    sorter.sort(buffer)?;
    let Some((mut idx, mut code)) = lookup.find(buffer[0].code) else {
        buffer.clear();
        return Ok(());
    };
    let end = part.buckets().end;
    let mut q = 0usize;
    while q < buffer.len() {
        let cp = buffer[q];
        if cp.code < code {
            q += 1;
        } else if cp.code == code {
            part.place(idx, cp.pos);
            q += 1;
        } else {
            idx += 1;
            if idx >= end {
                break;
            }
            code += lookup.delta(idx);
        }
    }
    buffer.clear();
    Ok(())
}
