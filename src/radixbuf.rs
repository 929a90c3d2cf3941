//! Radix keys and the per-bin staging buffers used by the in-place shuffle.
//!
//! A shuffle distributes a range into 256 bins by one key byte. Long ranges go
//! through [`RadixBuffer`]: every bin owns a small staging area that holds the
//! next few not-yet-placed elements of its target region, so the random writes
//! of a cycle-leader permutation turn into one sequential flush per
//! `buf_size` elements. Short ranges (at most the cache size) are permuted
//! directly.

use bytemuck::{Pod, Zeroable};
use std::ops::Range;

/// Number of bins per radix pass (one key byte).
pub const BINS: usize = 256;

/// A fixed-width key that can be sorted byte by byte, most significant first.
pub trait RadixKey: Copy + Default + Send + Sync {
    /// Width of the sort key in bits (a multiple of 8).
    const KEY_BITS: u32;

    /// Key byte selected by `shift` (a bit offset, multiple of 8).
    fn radix_byte(&self, shift: u32) -> usize;

    /// Strict order on the key component only.
    fn key_lt(&self, other: &Self) -> bool;
}

impl RadixKey for u64 {
    const KEY_BITS: u32 = 64;

    #[inline]
    fn radix_byte(&self, shift: u32) -> usize {
        ((*self >> shift) & 0xFF) as usize
    }

    #[inline]
    fn key_lt(&self, other: &Self) -> bool {
        *self < *other
    }
}

impl RadixKey for u32 {
    const KEY_BITS: u32 = 32;

    #[inline]
    fn radix_byte(&self, shift: u32) -> usize {
        ((*self >> shift) & 0xFF) as usize
    }

    #[inline]
    fn key_lt(&self, other: &Self) -> bool {
        *self < *other
    }
}

/// Code with an attached payload (usually a suffix position).
/// Only `code` takes part in the ordering.
#[repr(C)]
#[derive(Copy, Clone, Default, Pod, Zeroable, PartialEq, Eq, Debug)]
pub struct CodePos {
    pub code: u64,
    pub pos: u64,
}

impl RadixKey for CodePos {
    const KEY_BITS: u32 = 64;

    #[inline]
    fn radix_byte(&self, shift: u32) -> usize {
        ((self.code >> shift) & 0xFF) as usize
    }

    #[inline]
    fn key_lt(&self, other: &Self) -> bool {
        self.code < other.code
    }
}

/// 128-bit key made of two words; `a` is the more significant one.
#[repr(C)]
#[derive(Copy, Clone, Default, Pod, Zeroable, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct KeyPair {
    pub a: u64,
    pub b: u64,
}

impl RadixKey for KeyPair {
    const KEY_BITS: u32 = 128;

    #[inline]
    fn radix_byte(&self, shift: u32) -> usize {
        if shift >= 64 {
            ((self.a >> (shift - 64)) & 0xFF) as usize
        } else {
            ((self.b >> shift) & 0xFF) as usize
        }
    }

    #[inline]
    fn key_lt(&self, other: &Self) -> bool {
        self.a < other.a || (self.a == other.a && self.b < other.b)
    }
}

/// How many shuffles took which path.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShuffleStats {
    pub cached: u64,
    pub uncached: u64,
}

/// Staging buffers plus bin borders of the most recent shuffle.
pub struct RadixBuffer<T> {
    log_bufsize: u32,
    buf_size: usize,
    cache_size: usize,
    values: Vec<T>,
    nextidx: [usize; BINS],
    startofbin: [usize; BINS + 1],
    endofbin: [usize; BINS],
    stats: ShuffleStats,
}

impl<T: RadixKey> RadixBuffer<T> {
    /// `log_bufsize` is the log2 of the number of staged elements per bin.
    pub fn new(log_bufsize: u32) -> Self {
        let buf_size = 1usize << log_bufsize;
        let cache_size = BINS * buf_size;
        Self {
            log_bufsize,
            buf_size,
            cache_size,
            values: vec![T::default(); cache_size],
            nextidx: [0; BINS],
            startofbin: [0; BINS + 1],
            endofbin: [0; BINS],
            stats: ShuffleStats::default(),
        }
    }

    /// Elements staged per bin.
    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// Ranges longer than this use the buffered shuffle.
    pub fn cache_size(&self) -> usize {
        self.cache_size
    }

    pub fn stats(&self) -> ShuffleStats {
        self.stats
    }

    /// Bytes held by the staging area and the bin tables.
    pub fn size_in_bytes(&self) -> usize {
        std::mem::size_of::<T>() * self.values.len()
            + std::mem::size_of::<usize>() * (3 * BINS + 1)
    }

    /// Range of bin `bin` relative to the slice passed to the last
    /// [`shuffle`](Self::shuffle).
    #[inline]
    pub fn bin_range(&self, bin: usize) -> Range<usize> {
        self.startofbin[bin]..self.startofbin[bin + 1]
    }

    /// Distribute `source` into bins by the key byte at `shift`.
    /// Afterwards every element of bin `b` lies in `bin_range(b)`.
    pub fn shuffle(&mut self, source: &mut [T], shift: u32) {
        if source.len() > self.cache_size {
            self.cached_shuffle(source, shift);
        } else {
            self.uncached_shuffle(source, shift);
        }
        debug_assert!((0..BINS).all(|b| self.endofbin[b] == self.startofbin[b + 1]));
    }

    fn count_bins(source: &[T], shift: u32) -> [usize; BINS] {
        let mut count = [0usize; BINS];
        for v in source {
            count[v.radix_byte(shift)] += 1;
        }
        count
    }

    fn set_bin_borders(&mut self, count: &[usize; BINS], len: usize) {
        let mut sum = 0usize;
        for bin in 0..BINS {
            self.startofbin[bin] = sum;
            self.endofbin[bin] = sum;
            sum += count[bin];
        }
        debug_assert_eq!(sum, len);
        self.startofbin[BINS] = len;
    }

    /// Move `currentidx` to the next position whose element has not been
    /// placed yet, skipping empty and completely filled bins.
    #[inline]
    fn skip_placed(&self, nextbin: &mut usize, currentidx: &mut usize) {
        while *nextbin < BINS && *currentidx >= self.startofbin[*nextbin] {
            *nextbin += 1;
        }
        while *nextbin < BINS && self.endofbin[*nextbin - 1] == self.startofbin[*nextbin] {
            *nextbin += 1;
        }
        if *currentidx < self.endofbin[*nextbin - 1] {
            *currentidx = self.endofbin[*nextbin - 1];
        }
    }

    fn uncached_shuffle(&mut self, source: &mut [T], shift: u32) {
        self.stats.uncached += 1;
        let len = source.len();
        let count = Self::count_bins(source, shift);
        self.set_bin_borders(&count, len);

        let mut currentidx = 0usize;
        let mut nextbin = 0usize;
        while currentidx < len {
            let mut value = source[currentidx];
            let mut bin;
            loop {
                bin = value.radix_byte(shift);
                let dest = self.endofbin[bin];
                if dest == currentidx {
                    break;
                }
                std::mem::swap(&mut value, &mut source[dest]);
                self.endofbin[bin] += 1;
            }
            source[currentidx] = value;
            self.endofbin[bin] += 1;
            currentidx += 1;
            self.skip_placed(&mut nextbin, &mut currentidx);
        }
    }

    fn cached_shuffle(&mut self, source: &mut [T], shift: u32) {
        self.stats.cached += 1;
        let len = source.len();
        let count = Self::count_bins(source, shift);

        // Preload every bin's staging area with the head of its target region.
        let mut first_nonempty = BINS;
        let mut binoffset = 0usize;
        for bin in 0..BINS {
            let elems = self.buf_size.min(count[bin]);
            if elems > 0 {
                if first_nonempty == BINS {
                    first_nonempty = bin;
                }
                let bufoffset = bin << self.log_bufsize;
                self.values[bufoffset..bufoffset + elems]
                    .copy_from_slice(&source[binoffset..binoffset + elems]);
            }
            self.nextidx[bin] = 0;
            binoffset += count[bin];
        }
        self.set_bin_borders(&count, len);

        let mut currentidx = 0usize;
        let mut nextbin = 0usize;
        let mut bin = first_nonempty;
        while currentidx < len {
            let mut value = self.bin_get(bin);
            loop {
                bin = value.radix_byte(shift);
                if currentidx == self.endofbin[bin] {
                    break;
                }
                let displaced = self.bin_get(bin);
                self.bin_update(source, bin, value);
                value = displaced;
            }
            self.bin_update(source, bin, value);
            currentidx += 1;
            self.skip_placed(&mut nextbin, &mut currentidx);
            bin = nextbin - 1;
        }

        for bin in 0..BINS {
            let left = self.nextidx[bin];
            if left > 0 {
                let bufoffset = bin << self.log_bufsize;
                let dest = self.startofbin[bin + 1] - left;
                source[dest..dest + left].copy_from_slice(&self.values[bufoffset..bufoffset + left]);
            }
        }
    }

    /// The element currently stored at the next free position of `bin`.
    #[inline]
    fn bin_get(&self, bin: usize) -> T {
        self.values[(bin << self.log_bufsize) + self.nextidx[bin]]
    }

    /// Place `value` at the next free position of `bin`. When the staging
    /// area is full it is written back in one run and refilled with the
    /// following unplaced elements of the bin.
    #[inline]
    fn bin_update(&mut self, source: &mut [T], bin: usize, value: T) {
        let binoffset = bin << self.log_bufsize;
        let next = self.nextidx[bin];
        self.values[binoffset + next] = value;
        if next + 1 < self.buf_size {
            self.nextidx[bin] = next + 1;
        } else {
            let wstart = self.endofbin[bin] + 1 - self.buf_size;
            let rend = self.startofbin[bin + 1];
            let mut rpos = wstart + self.buf_size;
            for j in 0..self.buf_size {
                source[wstart + j] = self.values[binoffset + j];
                if rpos < rend {
                    self.values[binoffset + j] = source[rpos];
                    rpos += 1;
                }
            }
            self.nextidx[bin] = 0;
        }
        self.endofbin[bin] += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lcg(n: usize, seed: u64) -> Vec<u64> {
        let mut x = seed;
        (0..n)
            .map(|_| {
                x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                x
            })
            .collect()
    }

    fn check_binned(data: &[u64], rb: &RadixBuffer<u64>, shift: u32) {
        for bin in 0..BINS {
            for v in &data[rb.bin_range(bin)] {
                assert_eq!(v.radix_byte(shift), bin);
            }
        }
    }

    #[test]
    fn uncached_shuffle_bins_by_top_byte() {
        let mut rb = RadixBuffer::<u64>::new(5);
        let mut data = lcg(1000, 7);
        let mut expected = data.clone();
        rb.shuffle(&mut data, 56);
        assert_eq!(rb.stats().uncached, 1);
        check_binned(&data, &rb, 56);
        let mut got = data.clone();
        got.sort_unstable();
        expected.sort_unstable();
        assert_eq!(got, expected);
    }

    #[test]
    fn cached_shuffle_bins_by_top_byte() {
        let mut rb = RadixBuffer::<u64>::new(2);
        assert_eq!(rb.cache_size(), 1024);
        let mut data = lcg(20_000, 11);
        let mut expected = data.clone();
        rb.shuffle(&mut data, 56);
        assert_eq!(rb.stats().cached, 1);
        check_binned(&data, &rb, 56);
        let mut got = data.clone();
        got.sort_unstable();
        expected.sort_unstable();
        assert_eq!(got, expected);
    }

    #[test]
    fn cached_shuffle_skewed_bins() {
        // few bins, one of them dominant
        let mut rb = RadixBuffer::<u64>::new(0);
        let mut data: Vec<u64> = (0..5000u64).map(|i| (i % 3) << 8 | (i % 7)).collect();
        data.extend(std::iter::repeat(2u64 << 8).take(3000));
        let mut expected = data.clone();
        rb.shuffle(&mut data, 8);
        check_binned(&data, &rb, 8);
        let bin2 = expected.iter().filter(|&&x| (x >> 8) & 0xFF == 2).count();
        assert_eq!(bin2, 4666);
        assert_eq!(rb.bin_range(2).len(), bin2);
        data.sort_unstable();
        expected.sort_unstable();
        assert_eq!(data, expected);
    }

    #[test]
    fn keypair_byte_order() {
        let k = KeyPair { a: 0xAB << 56, b: 0xCD };
        assert_eq!(k.radix_byte(120), 0xAB);
        assert_eq!(k.radix_byte(0), 0xCD);
        assert!(KeyPair { a: 1, b: 9 }.key_lt(&KeyPair { a: 2, b: 0 }));
        assert!(KeyPair { a: 1, b: 0 }.key_lt(&KeyPair { a: 1, b: 1 }));
    }

    #[test]
    fn codepos_ignores_payload() {
        let x = CodePos { code: 3, pos: 100 };
        let y = CodePos { code: 3, pos: 1 };
        assert!(!x.key_lt(&y) && !y.key_lt(&x));
    }
}
