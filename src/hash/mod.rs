use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Fixed value XORed onto every k-mer hash. Counteracts consecutive minimisers
/// from low-complexity sequence.
pub const SEED: u64 = 0x8F3F73B5CF1C9ADE;

/// Shifts the seed so that only the `2 * weight` low bits used by a k-mer hash
/// are affected. Without the shift, gapped shapes would bias the low bits.
pub const fn adjust_seed(weight: u32) -> u64 {
    SEED >> ((32 - weight) * 2)
}

/// 2-bit ranks for the DNA-4 alphabet. 'U' ranks as 'T', anything unknown
/// ranks as 'A'.
const RANK: [u8; 256] = {
    let mut table = [0u8; 256];
    table[b'C' as usize] = 1;
    table[b'c' as usize] = 1;
    table[b'G' as usize] = 2;
    table[b'g' as usize] = 2;
    table[b'T' as usize] = 3;
    table[b't' as usize] = 3;
    table[b'U' as usize] = 3;
    table[b'u' as usize] = 3;
    table
};

/// A gapped k-mer shape: a bitmask of length `size` with `weight` care
/// positions. Bit `size - 1 - i` corresponds to position `i`, so the mask in
/// binary reads like the shape literal. The leading bit is always 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shape {
    mask: u64,
    size: u32,
    weight: u32,
}

impl Shape {
    pub fn ungapped(k: u32) -> Result<Self> {
        if k == 0 || k > 32 {
            bail!("The k-mer size must be in [1, 32].");
        }
        let mask = (1u64 << k) - 1;
        Ok(Shape { mask, size: k, weight: k })
    }

    pub fn from_string(literal: &str) -> Result<Self> {
        let size = literal.len();
        if size == 0 || size > 32 {
            bail!("The shape must have a length in [1, 32]: {}", literal);
        }
        if !literal.bytes().all(|b| b == b'0' || b == b'1') {
            bail!("The shape must only contain 0 and 1: {}", literal);
        }
        if !literal.starts_with('1') {
            bail!("The shape must start with 1: {}", literal);
        }
        let mask = u64::from_str_radix(literal, 2)?;
        Ok(Shape {
            mask,
            size: size as u32,
            weight: mask.count_ones(),
        })
    }

    /// The span of the shape, i.e. the k-mer length.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// The number of care positions.
    pub fn count(&self) -> u32 {
        self.weight
    }

    pub fn is_ungapped(&self) -> bool {
        self.weight == self.size
    }

    pub fn to_literal(&self) -> String {
        (0..self.size)
            .map(|i| if self.mask >> (self.size - 1 - i) & 1 == 1 { '1' } else { '0' })
            .collect()
    }

    /// Packed 2-bit hash of the k-mer starting at `codes[0]`, care positions
    /// only. The result lies in `[0, 4^weight)`.
    #[inline]
    fn hash_at(&self, codes: &[u8]) -> u64 {
        let mut hash = 0u64;
        for i in 0..self.size as usize {
            if self.mask >> (self.size as usize - 1 - i) & 1 == 1 {
                hash = hash << 2 | u64::from(codes[i]);
            }
        }
        hash
    }
}

/// Resolves the `--kmer`/`--shape`/`--window` argument triple shared by the
/// build and prepare commands.
pub fn resolve_shape(kmer: Option<u32>, shape: Option<&str>, window: Option<u32>) -> Result<(Shape, u32)> {
    if kmer.is_some() && shape.is_some() {
        bail!("You cannot set both shape and k-mer arguments.");
    }
    let shape = match shape {
        Some(literal) => Shape::from_string(literal)?,
        None => Shape::ungapped(kmer.unwrap_or(20))?,
    };
    let window = window.unwrap_or(shape.size());
    if shape.size() > window {
        bail!("The k-mer size cannot be bigger than the window size.");
    }
    Ok((shape, window))
}

/// One minimiser occurrence: the winning hash and the begin/end positions of
/// the k-mer it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Minimiser {
    pub hash: u64,
    pub begin: usize,
    pub end: usize,
}

/// Streaming minimiser computation over DNA-4 text.
///
/// Holds all scratch buffers so that one hasher can be reused across many
/// records without reallocating. Not thread-safe; give each worker its own.
pub struct MinimiserHasher {
    shape: Shape,
    window: usize,
    seed: u64,
    codes: Vec<u8>,
    rc_codes: Vec<u8>,
    forward: Vec<u64>,
    reverse: Vec<u64>,
    window_values: VecDeque<(u64, usize, usize)>,
    minimisers: Vec<Minimiser>,
}

impl MinimiserHasher {
    pub fn new(shape: Shape, window: u32) -> Result<Self> {
        if (window as usize) < shape.size() as usize {
            bail!("The k-mer size cannot be bigger than the window size.");
        }
        Ok(MinimiserHasher {
            shape,
            window: window as usize,
            seed: adjust_seed(shape.count()),
            codes: Vec::new(),
            rc_codes: Vec::new(),
            forward: Vec::new(),
            reverse: Vec::new(),
            window_values: VecDeque::new(),
            minimisers: Vec::new(),
        })
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn window(&self) -> u32 {
        self.window as u32
    }

    /// Appends the canonical minimiser hashes of `seq` to `out`.
    pub fn hashes_into(&mut self, seq: &[u8], out: &mut Vec<u64>) {
        self.compute(seq, true);
        out.extend(self.minimisers.iter().map(|m| m.hash));
    }

    /// The minimisers of `seq` with their positions. `canonical` selects
    /// whether the reverse complement participates.
    pub fn minimisers(&mut self, seq: &[u8], canonical: bool) -> &[Minimiser] {
        self.compute(seq, canonical);
        &self.minimisers
    }

    /// Fills all k-mer hashes (seeded, care positions only) of `codes` into
    /// `out`. Rolls for ungapped shapes, extracts per position otherwise.
    fn kmer_hashes(shape: Shape, seed: u64, codes: &[u8], out: &mut Vec<u64>) {
        out.clear();
        let k = shape.size() as usize;
        if codes.len() < k {
            return;
        }
        if shape.is_ungapped() {
            let mask = if k == 32 { u64::MAX } else { (1u64 << (2 * k)) - 1 };
            let mut value = 0u64;
            for &code in &codes[..k - 1] {
                value = value << 2 | u64::from(code);
            }
            for &code in &codes[k - 1..] {
                value = (value << 2 | u64::from(code)) & mask;
                out.push(value ^ seed);
            }
        } else {
            for start in 0..=codes.len() - k {
                out.push(shape.hash_at(&codes[start..]) ^ seed);
            }
        }
    }

    fn compute(&mut self, seq: &[u8], canonical: bool) {
        self.minimisers.clear();
        self.window_values.clear();

        let len = seq.len();
        let k = self.shape.size() as usize;
        if len < k {
            return;
        }

        self.codes.clear();
        self.codes.extend(seq.iter().map(|&b| RANK[b as usize]));

        let possible_kmers = len - k + 1;
        Self::kmer_hashes(self.shape, self.seed, &self.codes, &mut self.forward);
        if canonical {
            self.rc_codes.clear();
            self.rc_codes.extend(self.codes.iter().rev().map(|&c| 3 - c));
            Self::kmer_hashes(self.shape, self.seed, &self.rc_codes, &mut self.reverse);
        }

        let value = |i: usize| -> u64 {
            if canonical {
                self.forward[i].min(self.reverse[possible_kmers - 1 - i])
            } else {
                self.forward[i]
            }
        };

        let possible_minimisers = if len > self.window { len - self.window + 1 } else { 1 };
        let kmers_per_window = (self.window - k + 1).min(possible_kmers);

        for i in 0..kmers_per_window {
            self.window_values.push_back((value(i), i, i + k - 1));
        }

        // Index of the current minimum within the deque; ties keep the first.
        let position_of_min = |window: &VecDeque<(u64, usize, usize)>| -> usize {
            let mut best = 0;
            for (pos, entry) in window.iter().enumerate().skip(1) {
                if entry.0 < window[best].0 {
                    best = pos;
                }
            }
            best
        };

        let mut min_pos = position_of_min(&self.window_values);
        let (hash, begin, end) = self.window_values[min_pos];
        self.minimisers.push(Minimiser { hash, begin, end });

        for i in 1..possible_minimisers {
            let mut changed = false;
            if min_pos == 0 {
                self.window_values.pop_front();
                min_pos = position_of_min(&self.window_values);
                changed = true;
            } else {
                self.window_values.pop_front();
                min_pos -= 1;
            }

            let new_idx = kmers_per_window - 1 + i;
            self.window_values.push_back((value(new_idx), new_idx, new_idx + k - 1));

            if self.window_values.back().unwrap().0 < self.window_values[min_pos].0 {
                min_pos = self.window_values.len() - 1;
                changed = true;
            }

            if changed {
                let (hash, begin, end) = self.window_values[min_pos];
                self.minimisers.push(Minimiser { hash, begin, end });
            }
        }
    }
}

/// Canonical hash of a single k-mer, mainly for tests and spot checks.
pub fn canonical_kmer_hash(shape: Shape, kmer: &[u8]) -> u64 {
    let seed = adjust_seed(shape.count());
    let codes: Vec<u8> = kmer.iter().map(|&b| RANK[b as usize]).collect();
    let rc_codes: Vec<u8> = codes.iter().rev().map(|&c| 3 - c).collect();
    let forward = shape.hash_at(&codes) ^ seed;
    let reverse = shape.hash_at(&rc_codes) ^ seed;
    forward.min(reverse)
}

pub fn reverse_complement(seq: &[u8]) -> Vec<u8> {
    seq.iter()
        .rev()
        .map(|&b| match b {
            b'A' | b'a' => b'T',
            b'C' | b'c' => b'G',
            b'G' | b'g' => b'C',
            _ => b'A',
        })
        .collect()
}
