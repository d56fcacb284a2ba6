use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-hash-function multipliers. At most five hash functions are supported.
const HASH_SEEDS: [u64; 5] = [
    0x9E3779B185EBCA87,
    0xC2B2AE3D27D4EB4F,
    0x165667B19E3779F9,
    0x27D4EB2F165667C5,
    0x85EBCA77C2B2AE63,
];

const FOLD: u64 = 0x9E3779B97F4A7C15;

pub const MAX_HASH_FUNCTIONS: usize = HASH_SEEDS.len();

/// Serialize `Vec<AtomicU64>` as plain words. Insertion is quiesced whenever
/// an index is written, so relaxed loads see the final state.
mod atomic_words {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::sync::atomic::{AtomicU64, Ordering};

    pub fn serialize<S: Serializer>(words: &[AtomicU64], serializer: S) -> Result<S::Ok, S::Error> {
        let plain: Vec<u64> = words.iter().map(|w| w.load(Ordering::Relaxed)).collect();
        serde::Serialize::serialize(&plain, serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<AtomicU64>, D::Error> {
        let plain: Vec<u64> = Vec::deserialize(deserializer)?;
        Ok(plain.into_iter().map(AtomicU64::new).collect())
    }
}

/// Interleaved Bloom filter.
///
/// One bit vector holds `bin_size` rows of `bin_count_padded` columns; bin `b`
/// occupies column `b`. Columns are co-located per row, so one 64-bit word
/// covers 64 consecutive bins of the same row and a query can count all bins
/// word by word. Inserting only ever sets bits, which makes a relaxed
/// atomic-OR the sole synchronisation needed for parallel writers.
#[derive(Debug, Serialize, Deserialize)]
pub struct Ibf {
    bin_count: usize,
    bin_count_padded: usize,
    bin_size: u64,
    hash_count: usize,
    hash_shift: u32,
    #[serde(with = "atomic_words")]
    data: Vec<AtomicU64>,
    #[serde(with = "atomic_words")]
    occupancy: Vec<AtomicU64>,
}

impl Ibf {
    pub fn new(bin_count: usize, bin_size: u64, hash_count: usize) -> Result<Self> {
        ensure!(bin_count > 0, "The bin count must be positive.");
        ensure!(bin_size > 0, "The bin size must be positive. Is the bit budget too small?");
        ensure!(
            (1..=MAX_HASH_FUNCTIONS).contains(&hash_count),
            "The number of hash functions must be in [1, {}].",
            MAX_HASH_FUNCTIONS
        );
        let bin_count_padded = bin_count.next_multiple_of(64);
        let words = bin_size as usize * (bin_count_padded / 64);
        Ok(Ibf {
            bin_count,
            bin_count_padded,
            bin_size,
            hash_count,
            hash_shift: bin_size.leading_zeros(),
            data: (0..words).map(|_| AtomicU64::new(0)).collect(),
            occupancy: (0..bin_count).map(|_| AtomicU64::new(0)).collect(),
        })
    }

    /// A filter with no storage, used as a tombstone slot in the hierarchical
    /// index after a subtree was displaced.
    pub fn tombstone() -> Self {
        Ibf {
            bin_count: 0,
            bin_count_padded: 0,
            bin_size: 0,
            hash_count: 1,
            hash_shift: 0,
            data: Vec::new(),
            occupancy: Vec::new(),
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.data.is_empty()
    }

    pub fn bin_count(&self) -> usize {
        self.bin_count
    }

    pub fn bin_count_padded(&self) -> usize {
        self.bin_count_padded
    }

    pub fn bin_size(&self) -> u64 {
        self.bin_size
    }

    pub fn hash_count(&self) -> usize {
        self.hash_count
    }

    fn words_per_row(&self) -> usize {
        self.bin_count_padded / 64
    }

    #[inline]
    fn row(&self, value: u64, hash_function: usize) -> usize {
        let mut hash = value.wrapping_mul(HASH_SEEDS[hash_function]);
        hash ^= hash >> self.hash_shift;
        hash = hash.wrapping_mul(FOLD);
        (hash % self.bin_size) as usize
    }

    /// Sets the membership bits of `value` in bin `bin_idx` and bumps the
    /// bin's occupancy. Callable from many threads at once.
    pub fn insert(&self, value: u64, bin_idx: usize) {
        debug_assert!(bin_idx < self.bin_count);
        let words_per_row = self.words_per_row();
        let word_in_row = bin_idx / 64;
        let bit = 1u64 << (bin_idx % 64);
        for hash_function in 0..self.hash_count {
            let word = self.row(value, hash_function) * words_per_row + word_in_row;
            self.data[word].fetch_or(bit, Ordering::Relaxed);
        }
        self.occupancy[bin_idx].fetch_add(1, Ordering::Relaxed);
    }

    /// Inserts a k-mer set spread evenly over `number_of_bins` consecutive
    /// bins starting at `bin_idx` (split-bin placement).
    pub fn insert_split<'a>(
        &self,
        values: impl ExactSizeIterator<Item = &'a u64>,
        bin_idx: usize,
        number_of_bins: usize,
    ) {
        let chunk_size = values.len() / number_of_bins + 1;
        for (i, &value) in values.enumerate() {
            self.insert(value, bin_idx + i / chunk_size);
        }
    }

    pub fn contains(&self, value: u64, bin_idx: usize) -> bool {
        debug_assert!(bin_idx < self.bin_count);
        let words_per_row = self.words_per_row();
        let word_in_row = bin_idx / 64;
        let bit = 1u64 << (bin_idx % 64);
        (0..self.hash_count).all(|hash_function| {
            let word = self.row(value, hash_function) * words_per_row + word_in_row;
            self.data[word].load(Ordering::Relaxed) & bit != 0
        })
    }

    pub fn occupancy(&self, bin_idx: usize) -> u64 {
        self.occupancy[bin_idx].load(Ordering::Relaxed)
    }

    pub fn set_occupancy(&self, bin_idx: usize, value: u64) {
        self.occupancy[bin_idx].store(value, Ordering::Relaxed);
    }

    /// Estimated false-positive rate of bin `bin_idx` given its occupancy.
    pub fn fpr(&self, bin_idx: usize) -> f64 {
        fpr_for(self.bin_size, self.hash_count, self.occupancy(bin_idx))
    }

    /// Finds the first run of `length` consecutive bins with zero occupancy.
    pub fn find_empty_run(&self, length: usize) -> Option<usize> {
        let mut run = 0usize;
        for bin in 0..self.bin_count {
            if self.occupancy(bin) == 0 {
                run += 1;
                if run == length {
                    return Some(bin + 1 - length);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    /// Grows the bin count without touching the bit storage. Only succeeds if
    /// the padded capacity already covers the new count. Shrinking is not
    /// supported; a smaller target leaves the filter unchanged.
    pub fn try_increase_bin_number_to(&mut self, new_bin_count: usize) -> bool {
        if new_bin_count <= self.bin_count {
            return true;
        }
        if new_bin_count.next_multiple_of(64) > self.bin_count_padded {
            return false;
        }
        self.bin_count = new_bin_count;
        self.occupancy.resize_with(new_bin_count, || AtomicU64::new(0));
        true
    }

    /// Grows the bin count, reallocating and re-laying every row when the
    /// padded capacity is exceeded.
    pub fn increase_bin_number_to(&mut self, new_bin_count: usize) {
        if self.try_increase_bin_number_to(new_bin_count) {
            return;
        }
        let new_padded = new_bin_count.next_multiple_of(64);
        let new_words_per_row = new_padded / 64;
        let old_words_per_row = self.words_per_row();
        let mut new_data: Vec<AtomicU64> =
            (0..self.bin_size as usize * new_words_per_row).map(|_| AtomicU64::new(0)).collect();
        for row in 0..self.bin_size as usize {
            for word in 0..old_words_per_row {
                let value = self.data[row * old_words_per_row + word].load(Ordering::Relaxed);
                new_data[row * new_words_per_row + word] = AtomicU64::new(value);
            }
        }
        self.data = new_data;
        self.bin_count = new_bin_count;
        self.bin_count_padded = new_padded;
        self.occupancy.resize_with(new_bin_count, || AtomicU64::new(0));
    }

    pub fn counting_agent<C: Counter>(&self) -> CountingAgent<'_, C> {
        CountingAgent { ibf: self, counts: vec![C::default(); self.bin_count_padded] }
    }

    pub fn membership_agent(&self) -> MembershipAgent<'_> {
        MembershipAgent { agent: self.counting_agent(), result: Vec::new() }
    }
}

impl Clone for Ibf {
    fn clone(&self) -> Self {
        Ibf {
            bin_count: self.bin_count,
            bin_count_padded: self.bin_count_padded,
            bin_size: self.bin_size,
            hash_count: self.hash_count,
            hash_shift: self.hash_shift,
            data: self.data.iter().map(|w| AtomicU64::new(w.load(Ordering::Relaxed))).collect(),
            occupancy: self
                .occupancy
                .iter()
                .map(|w| AtomicU64::new(w.load(Ordering::Relaxed)))
                .collect(),
        }
    }
}

impl PartialEq for Ibf {
    fn eq(&self, other: &Self) -> bool {
        self.bin_count == other.bin_count
            && self.bin_count_padded == other.bin_count_padded
            && self.bin_size == other.bin_size
            && self.hash_count == other.hash_count
            && self.data.len() == other.data.len()
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .all(|(a, b)| a.load(Ordering::Relaxed) == b.load(Ordering::Relaxed))
            && self.occupancy.len() == other.occupancy.len()
            && self
                .occupancy
                .iter()
                .zip(other.occupancy.iter())
                .all(|(a, b)| a.load(Ordering::Relaxed) == b.load(Ordering::Relaxed))
    }
}

/// Counter cell types usable with the counting agent.
pub trait Counter: Copy + Default + Send + Sync + 'static {
    fn increment(&mut self);
    fn add(&mut self, other: Self);
    fn as_usize(self) -> usize;
}

macro_rules! impl_counter {
    ($($t:ty),*) => {$(
        impl Counter for $t {
            #[inline]
            fn increment(&mut self) {
                *self += 1;
            }
            #[inline]
            fn add(&mut self, other: Self) {
                *self += other;
            }
            #[inline]
            fn as_usize(self) -> usize {
                self as usize
            }
        }
    )*};
}

impl_counter!(u8, u16, u32, u64, usize);

/// Per-thread counting helper. Owns the counter vector so repeated queries
/// reuse the allocation.
pub struct CountingAgent<'a, C: Counter> {
    ibf: &'a Ibf,
    counts: Vec<C>,
}

impl<'a, C: Counter> CountingAgent<'a, C> {
    /// Counts how many of `values` are present in each bin. The result has
    /// `bin_count_padded` entries; pad bins stay zero.
    pub fn bulk_count(&mut self, values: &[u64]) -> &[C] {
        bulk_count_into(self.ibf, values, &mut self.counts);
        &self.counts
    }
}

/// The word-wise vertical add behind every counting agent: for each value,
/// the words of its `hash_count` rows are ANDed so that only bins with every
/// membership bit set survive, and each surviving bit bumps the counter of
/// its bin. A present value thus contributes exactly 1 to its bin.
pub fn bulk_count_into<C: Counter>(ibf: &Ibf, values: &[u64], counts: &mut Vec<C>) {
    counts.clear();
    counts.resize(ibf.bin_count_padded, C::default());
    let words_per_row = ibf.words_per_row();
    let mut row_bases = [0usize; MAX_HASH_FUNCTIONS];
    for &value in values {
        for (hash_function, row_base) in row_bases[..ibf.hash_count].iter_mut().enumerate() {
            *row_base = ibf.row(value, hash_function) * words_per_row;
        }
        for word_idx in 0..words_per_row {
            let mut word = u64::MAX;
            for &row_base in &row_bases[..ibf.hash_count] {
                word &= ibf.data[row_base + word_idx].load(Ordering::Relaxed);
            }
            while word != 0 {
                let bit = word.trailing_zeros() as usize;
                counts[word_idx * 64 + bit].increment();
                word &= word - 1;
            }
        }
    }
}

/// Per-thread membership helper for the flat filter: bins whose count reaches
/// the threshold, in increasing bin order.
pub struct MembershipAgent<'a> {
    agent: CountingAgent<'a, u16>,
    result: Vec<usize>,
}

impl<'a> MembershipAgent<'a> {
    pub fn membership_for(&mut self, values: &[u64], threshold: usize) -> &[usize] {
        let bin_count = self.agent.ibf.bin_count;
        let counts = self.agent.bulk_count(values);
        self.result.clear();
        for (bin, count) in counts.iter().take(bin_count).enumerate() {
            if count.as_usize() >= threshold {
                self.result.push(bin);
            }
        }
        &self.result
    }
}

/// Smallest bin size (in bits) keeping a bin with `elements` entries at or
/// below `fpr`: `ceil(-hash_count * elements / ln(1 - fpr^(1/hash_count)))`.
pub fn bin_size_for(elements: u64, hash_count: usize, fpr: f64) -> u64 {
    debug_assert!(fpr > 0.0 && fpr < 1.0);
    let numerator = -(hash_count as f64) * elements.max(1) as f64;
    let denominator = (1.0 - (fpr.ln() / hash_count as f64).exp()).ln();
    (numerator / denominator).ceil() as u64
}

/// Largest number of elements a bin of `bin_size` bits can hold at `fpr`.
/// Inverse of `bin_size_for`.
pub fn max_elements_for(bin_size: u64, hash_count: usize, fpr: f64) -> u64 {
    debug_assert!(fpr > 0.0 && fpr < 1.0);
    let numerator = bin_size as f64 * (1.0 - (fpr.ln() / hash_count as f64).exp()).ln();
    let denominator = -(hash_count as f64);
    (numerator / denominator).ceil() as u64
}

/// Bloom-filter false-positive rate for a bin with `elements` entries.
pub fn fpr_for(bin_size: u64, hash_count: usize, elements: u64) -> f64 {
    if bin_size == 0 {
        return 1.0;
    }
    let exp_arg = (hash_count as u64 * elements) as f64 / bin_size as f64;
    let log_arg = 1.0 - (-exp_arg).exp();
    (hash_count as f64 * log_arg.ln()).exp()
}
