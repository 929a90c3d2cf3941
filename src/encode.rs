//! K-mer code producers.
//!
//! Conventions
//! - Codes are **LSB-aligned**: a k-mer occupies the lower `2k` bits.
//! - A = 0, C = 1, G = 2, T/U = 3; any other byte breaks the k-mer window.
//! - Positions are global: sequence `s` starts at the sum of the lengths of
//!   sequences `0..s`.

use std::ops::Range;

/// 256-entry LUT: ASCII to 2-bit (A=0, C=1, G=2, T/U=3), 0xFF for ambiguous.
pub static MAP_LUT: [u8; 256] = {
    const X: u8 = 0xFF;
    let mut t = [X; 256];
    t[b'A' as usize] = 0;
    t[b'a' as usize] = 0;
    t[b'C' as usize] = 1;
    t[b'c' as usize] = 1;
    t[b'G' as usize] = 2;
    t[b'g' as usize] = 2;
    t[b'T' as usize] = 3;
    t[b't' as usize] = 3;
    t[b'U' as usize] = 3;
    t[b'u' as usize] = 3;
    t
};

/// 2-bit rank of a base, `None` if ambiguous.
#[inline]
pub fn map_base(b: u8) -> Option<u8> {
    let v = MAP_LUT[b as usize];
    if v <= 3 { Some(v) } else { None }
}

/// Encode a k-mer window. `None` if `k > 32`, empty, or ambiguous.
#[inline]
pub fn encode_kmer(window: &[u8]) -> Option<u64> {
    let k = window.len();
    if k == 0 || k > 32 {
        return None;
    }
    let mut code: u64 = 0;
    for &b in window {
        code = (code << 2) | map_base(b)? as u64;
    }
    Some(code)
}

/// Mask covering the lower `2k` bits.
#[inline]
pub fn kmer_mask(k: usize) -> u64 {
    if k >= 32 { u64::MAX } else { (1u64 << (2 * k)) - 1 }
}

/// Producer of first codes (one per sequence start) and inner codes (every
/// other k-mer position), each reported together with its position.
pub trait CodeSource: Sync {
    /// Number of codes [`for_each_first_code`](Self::for_each_first_code) yields.
    fn num_first_codes(&self) -> usize;

    /// Total number of positions (an upper bound on the number of codes).
    fn total_length(&self) -> u64;

    fn for_each_first_code<F: FnMut(u64, u64)>(&self, f: F);

    fn for_each_inner_code<F: FnMut(u64, u64)>(&self, f: F);
}

/// Encoded multi-sequence collection.
#[derive(Clone, Debug)]
pub struct SequenceCollection {
    k: usize,
    ranks: Vec<u8>,
    starts: Vec<usize>,
    num_first_codes: usize,
}

impl SequenceCollection {
    pub fn new(k: usize) -> Self {
        assert!(k > 0 && k <= 32, "k must be 1..=32");
        Self {
            k,
            ranks: Vec::new(),
            starts: vec![0],
            num_first_codes: 0,
        }
    }

    pub fn from_sequences<I, S>(k: usize, seqs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        let mut c = Self::new(k);
        for s in seqs {
            c.push(s.as_ref());
        }
        c
    }

    /// Append one sequence.
    pub fn push(&mut self, seq: &[u8]) {
        self.ranks.extend(seq.iter().map(|&b| MAP_LUT[b as usize]));
        self.starts.push(self.ranks.len());
        let s = self.starts.len() - 2;
        if self.first_code_of(self.sequence_range(s)).is_some() {
            self.num_first_codes += 1;
        }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn num_sequences(&self) -> usize {
        self.starts.len() - 1
    }

    /// Positions covered by sequence `s`.
    pub fn sequence_range(&self, s: usize) -> Range<usize> {
        self.starts[s]..self.starts[s + 1]
    }

    fn first_code_of(&self, range: Range<usize>) -> Option<u64> {
        if range.len() < self.k {
            return None;
        }
        let window = &self.ranks[range.start..range.start + self.k];
        window
            .iter()
            .try_fold(0u64, |code, &r| (r <= 3).then(|| (code << 2) | r as u64))
    }

    /// Rolling scan over one sequence: `f(offset_in_sequence, code)` for every
    /// unambiguous window.
    fn scan<F: FnMut(usize, u64)>(&self, range: Range<usize>, mut f: F) {
        let mask = kmer_mask(self.k);
        let mut code = 0u64;
        let mut valid = 0usize;
        for (i, &r) in self.ranks[range].iter().enumerate() {
            if r > 3 {
                code = 0;
                valid = 0;
                continue;
            }
            code = ((code << 2) | r as u64) & mask;
            valid += 1;
            if valid >= self.k {
                f(i + 1 - self.k, code);
            }
        }
    }
}

impl CodeSource for SequenceCollection {
    fn num_first_codes(&self) -> usize {
        self.num_first_codes
    }

    fn total_length(&self) -> u64 {
        self.ranks.len() as u64
    }

    fn for_each_first_code<F: FnMut(u64, u64)>(&self, mut f: F) {
        for s in 0..self.num_sequences() {
            let range = self.sequence_range(s);
            if let Some(code) = self.first_code_of(range.clone()) {
                f(code, range.start as u64);
            }
        }
    }

    fn for_each_inner_code<F: FnMut(u64, u64)>(&self, mut f: F) {
        for s in 0..self.num_sequences() {
            let range = self.sequence_range(s);
            let start = range.start;
            self.scan(range, |off, code| {
                if off > 0 {
                    f(code, (start + off) as u64);
                }
            });
        }
    }
}

/// Explicit code lists. First code `i` is at position `i`; inner codes carry
/// their own positions.
#[derive(Clone, Debug, Default)]
pub struct CodeList {
    pub first: Vec<u64>,
    pub inner: Vec<(u64, u64)>,
}

impl CodeList {
    pub fn new(first: Vec<u64>) -> Self {
        Self {
            first,
            inner: Vec::new(),
        }
    }

    pub fn with_inner(mut self, inner: Vec<(u64, u64)>) -> Self {
        self.inner = inner;
        self
    }
}

impl CodeSource for CodeList {
    fn num_first_codes(&self) -> usize {
        self.first.len()
    }

    fn total_length(&self) -> u64 {
        (self.first.len() + self.inner.len()) as u64
    }

    fn for_each_first_code<F: FnMut(u64, u64)>(&self, mut f: F) {
        for (i, &c) in self.first.iter().enumerate() {
            f(c, i as u64);
        }
    }

    fn for_each_inner_code<F: FnMut(u64, u64)>(&self, mut f: F) {
        for &(c, p) in &self.inner {
            f(c, p);
        }
    }
}
