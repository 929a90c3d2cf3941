//! First-code k-mer indexing in modern Rust (edition 2024).
//!
//! Pipeline:
//! - in-place MSD radix sort of the first code of every sequence
//!   (buffered shuffle, insertion sort for small bins, optional parallel root split)
//! - deduplication into a delta-packed code table with per-code counts
//! - counting of inner k-mer codes that hit a first code (sampled lookup cache)
//! - partial sums over the counts (the leftborder table), optionally spilled
//!   to a temporary file and memory-mapped back
//! - weight-balanced partitioning of the buckets for parallel consumers
//!
//! Consumers claim output slots with `slot = --leftborder[bucket]` through
//! [`CodeIndex::for_each_part`]; every part owns a disjoint bucket range and
//! the matching slice of the output table.

mod bscache;
mod builder;
mod dedup;
pub mod encode;
mod index;
mod io;
mod leftborder;
pub mod partition;
mod radix;
mod radixbuf;
mod spacelog;

pub use bscache::{BinarySearchCache, CacheEntry};
pub use builder::{IndexConfig, build_code_index};
pub use dedup::{CountIter, CountTable};
pub use encode::{CodeList, CodeSource, SequenceCollection};
pub use index::{BucketPart, CodeIndex, CodeLookup, IndexError};
pub use io::{LeftborderWriter, MappedLeftborder};
pub use leftborder::{Leftborder, PartClaims, PartialSums, Store, sample_shift};
pub use radix::{CounterWidth, RadixConfig, RadixSorter, RadixStats, insertion_sort, radix_sort};
pub use radixbuf::{BINS, CodePos, KeyPair, RadixBuffer, RadixKey, ShuffleStats};
pub use spacelog::SpaceLog;

pub use std::ops::Range;
