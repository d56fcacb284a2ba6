use crate::hash::{MinimiserHasher, Shape};
use anyhow::{Context, Result, ensure};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

/// Fixed seed for the Monte-Carlo estimate; keeps the model reproducible.
const MONTE_CARLO_SEED: u64 = 0x1D2B8284D988C4D0;
const MONTE_CARLO_ITERATIONS: usize = 10_000;

#[derive(Debug, Clone)]
pub struct ThresholdParams {
    /// Pattern length used for thresholding, typically the median query length.
    pub query_length: usize,
    pub window: u32,
    pub shape: Shape,
    pub errors: usize,
    pub tau: f64,
    pub p_max: f64,
    pub fpr: f64,
    /// Fixed fraction given via `--threshold`; bypasses the model.
    pub percentage: Option<f64>,
    /// Directory for the memoised vectors, set with `--cache-thresholds`.
    pub cache_dir: Option<PathBuf>,
}

/// Turns an observed minimiser count into the number of matching minimisers
/// required to report a bin.
pub enum Thresholder {
    Percentage {
        fraction: f64,
    },
    /// k-mer lemma, used when window == k-mer size: every error destroys at
    /// most k k-mers, independent of the minimiser count.
    Lemma {
        value: usize,
    },
    Probabilistic {
        min_minimisers: usize,
        max_minimisers: usize,
        thresholds: Vec<u64>,
        corrections: Vec<u64>,
    },
}

impl Thresholder {
    pub fn new(params: &ThresholdParams) -> Result<Self> {
        if let Some(fraction) = params.percentage {
            return Ok(Thresholder::Percentage { fraction });
        }

        let kmer_size = params.shape.count() as usize;
        if params.window as usize == params.shape.size() as usize && params.shape.is_ungapped() {
            let pattern = params.query_length;
            let destroyed = (params.errors + 1) * kmer_size;
            let value = (pattern + 1).saturating_sub(destroyed);
            return Ok(Thresholder::Lemma { value });
        }

        ensure!(
            params.query_length >= params.window as usize,
            "The query length ({}) is too short to be thresholded with window size {}.",
            params.query_length,
            params.window
        );

        let min_minimisers = minimal_number_of_minimisers(params.query_length, params.window, kmer_size);
        let max_minimisers = params.query_length - params.window as usize + 1;

        let expected_len = max_minimisers - min_minimisers + 1;
        let (thresholds, corrections) = match load_cached(params, expected_len) {
            Some(vectors) => vectors,
            None => {
                let thresholds = precompute_threshold(
                    params.query_length,
                    params.window as usize,
                    kmer_size,
                    params.errors,
                    params.tau,
                );
                ensure!(
                    !thresholds.is_empty(),
                    "The threshold vector is empty; check query length, window and k-mer size."
                );
                let corrections = precompute_correction(
                    params.query_length,
                    params.window as usize,
                    kmer_size,
                    params.fpr,
                    params.p_max,
                );
                if params.cache_dir.is_some() {
                    store_cached(params, &thresholds, &corrections)?;
                }
                (thresholds, corrections)
            }
        };

        Ok(Thresholder::Probabilistic { min_minimisers, max_minimisers, thresholds, corrections })
    }

    pub fn get(&self, minimiser_count: usize) -> usize {
        match self {
            Thresholder::Percentage { fraction } => {
                ((minimiser_count as f64 * fraction).ceil() as usize).max(1)
            }
            Thresholder::Lemma { value } => (*value).max(1),
            Thresholder::Probabilistic { min_minimisers, max_minimisers, thresholds, corrections } => {
                let index = minimiser_count.clamp(*min_minimisers, *max_minimisers) - min_minimisers;
                ((thresholds[index] + corrections[index]) as usize).max(1)
            }
        }
    }
}

fn minimal_number_of_minimisers(pattern: usize, window: u32, kmer_size: usize) -> usize {
    let kmers_per_pattern = pattern - kmer_size + 1;
    let kmers_per_window = window as usize - kmer_size + 1;
    kmers_per_pattern.div_ceil(kmers_per_window)
}

/// One row of Pascal's triangle.
fn pascal_row(n: usize) -> Vec<u64> {
    let mut result = vec![0u64; n + 1];
    result[0] = 1;
    for i in 1..=n {
        result[i] = result[i - 1] * (n as u64 + 1 - i as u64) / i as u64;
    }
    result
}

/// Probability distribution over how many k-mers of one window a single error
/// destroys: a binomial at the worst-case local error density, convolved with
/// the indirect-destruction estimate.
fn simple_model(kmer_size: usize, proba_x: &[f64], indirect_errors: &[f64]) -> Vec<f64> {
    let mut max = 0.0f64;
    for i in 0..proba_x.len() {
        let sum: f64 = proba_x[i..proba_x.len().min(i + kmer_size)].iter().sum();
        max = max.max(sum);
    }

    let coefficients = pascal_row(kmer_size);
    let mut probabilities = vec![0.0f64; kmer_size + 1];
    let p_mean = max / kmer_size as f64;
    let mut p_sum = 0.0;

    for i in 0..=kmer_size {
        let p_i_error =
            coefficients[i] as f64 * p_mean.powi(i as i32) * (1.0 - p_mean).powi((kmer_size - i) as i32);
        for (j, &indirect) in indirect_errors.iter().enumerate() {
            if i + j > kmer_size {
                break;
            }
            probabilities[i + j] += p_i_error * indirect;
        }
        p_sum += probabilities[i];
    }

    for probability in &mut probabilities {
        *probability /= p_sum;
    }

    probabilities
}

/// Sums `prod_j proba[d_j]` over all weak compositions `d` of `destroyed`
/// into `errors` parts.
fn enumerate_all_errors(destroyed: usize, errors: usize, proba: &[f64]) -> f64 {
    fn recurse(
        minimisers_left: usize,
        proba: &[f64],
        distribution: &mut [usize],
        error_index: usize,
        result: &mut f64,
    ) {
        if minimisers_left == 0 {
            let mut product = 1.0;
            for i in 0..error_index {
                product *= proba[distribution[i]];
            }
            for _ in error_index..distribution.len() {
                product *= proba[0];
            }
            *result += product;
            return;
        }

        if error_index >= distribution.len() {
            return;
        }

        for i in 0..=minimisers_left.min(proba.len() - 1) {
            distribution[error_index] = i;
            recurse(minimisers_left - i, proba, distribution, error_index + 1, result);
        }
    }

    let mut result = 0.0;
    let mut distribution = vec![0usize; errors];
    recurse(destroyed, proba, &mut distribution, 0, &mut result);
    result
}

/// Monte-Carlo estimate of the probability that a single error destroys `j`
/// minimisers *indirectly*, i.e. by shifting a window minimum rather than by
/// overlapping the minimiser's k-mer.
fn destroyed_indirectly_by_error(pattern: usize, window: usize, kmer_size: usize) -> Vec<f64> {
    const BASES: [u8; 4] = [b'A', b'C', b'G', b'T'];

    let mut rng = StdRng::seed_from_u64(MONTE_CARLO_SEED);
    let shape = Shape::ungapped(kmer_size as u32).expect("k-mer size was validated");
    let mut hasher = MinimiserHasher::new(shape, window as u32).expect("window >= k was validated");

    let mut result = vec![0.0f64; window - kmer_size];
    let mut sequence = vec![0u8; pattern];
    let mut mins = vec![false; pattern];
    let mut mins_with_error = vec![false; pattern];

    for _ in 0..MONTE_CARLO_ITERATIONS {
        for base in sequence.iter_mut() {
            *base = BASES[rng.random_range(0..4)];
        }
        mins.fill(false);
        mins_with_error.fill(false);

        for minimiser in hasher.minimisers(&sequence, false) {
            mins[minimiser.begin] = true;
        }

        let error_pos = rng.random_range(0..pattern);
        let mut new_base = BASES[rng.random_range(0..4)];
        while new_base == sequence[error_pos] {
            new_base = BASES[rng.random_range(0..4)];
        }
        sequence[error_pos] = new_base;

        for minimiser in hasher.minimisers(&sequence, false) {
            mins_with_error[minimiser.begin] = true;
        }

        let count = (0..pattern)
            .filter(|&i| mins[i] != mins_with_error[i] && (error_pos < i || i + kmer_size < error_pos))
            .count();
        let slot = count.min(result.len() - 1);
        result[slot] += 1.0;
    }

    for x in &mut result {
        *x /= MONTE_CARLO_ITERATIONS as f64;
    }

    result
}

/// For each possible minimiser count, the number of minimisers that still
/// match after `errors` errors with probability at least `tau`.
pub fn precompute_threshold(
    pattern: usize,
    window: usize,
    kmer_size: usize,
    errors: usize,
    tau: f64,
) -> Vec<u64> {
    let kmers_per_pattern = pattern - kmer_size + 1;
    let minimal = minimal_number_of_minimisers(pattern, window as u32, kmer_size);
    let maximal = pattern - window + 1;

    let indirect_errors = destroyed_indirectly_by_error(pattern, window, kmer_size);

    let mut thresholds = Vec::with_capacity(maximal - minimal + 1);
    for number_of_minimisers in minimal..=maximal {
        let proba_x = vec![number_of_minimisers as f64 / kmers_per_pattern as f64; kmers_per_pattern];
        let proba = simple_model(kmer_size, &proba_x, &indirect_errors);

        let mut proba_error = vec![0.0f64; number_of_minimisers];
        for (i, slot) in proba_error.iter_mut().enumerate() {
            *slot = enumerate_all_errors(i, errors, &proba);
        }

        let sum: f64 = proba_error.iter().sum();
        for x in &mut proba_error {
            *x /= sum;
        }

        let mut chosen = 1u64;
        let mut cumulative = 0.0;
        for (i, &p) in proba_error.iter().enumerate() {
            cumulative += p;
            if cumulative >= tau {
                chosen = (number_of_minimisers - i) as u64;
                break;
            }
        }
        thresholds.push(chosen);
    }

    thresholds
}

/// FPR-dependent additive correction. With `X ~ Bin(m, fpr)` spurious
/// minimiser matches in one bin, the threshold is raised by the smallest `c`
/// such that `P[X > c] <= p_max`: the chance that a false-positive bin still
/// survives the corrected threshold stays below `p_max`.
pub fn precompute_correction(
    pattern: usize,
    window: usize,
    kmer_size: usize,
    fpr: f64,
    p_max: f64,
) -> Vec<u64> {
    let minimal = minimal_number_of_minimisers(pattern, window as u32, kmer_size);
    let maximal = pattern - window + 1;

    // log factorials up to the largest minimiser count
    let mut log_factorial = vec![0.0f64; maximal + 1];
    for i in 1..=maximal {
        log_factorial[i] = log_factorial[i - 1] + (i as f64).ln();
    }

    let log_fpr = fpr.ln();
    let log_inverse_fpr = (-fpr).ln_1p();

    let log_pmf = |m: usize, i: usize| -> f64 {
        let log_binom = log_factorial[m] - log_factorial[i] - log_factorial[m - i];
        log_binom + i as f64 * log_fpr + (m - i) as f64 * log_inverse_fpr
    };

    let mut corrections = Vec::with_capacity(maximal - minimal + 1);
    for m in minimal..=maximal {
        let mut tail = 1.0 - log_pmf(m, 0).exp(); // P[X > 0]
        let mut correction = 0usize;
        while correction < m && tail > p_max {
            correction += 1;
            tail -= log_pmf(m, correction).exp();
        }
        corrections.push(correction as u64);
    }

    corrections
}

/// Deterministic name component for the memoised vectors.
fn cache_hash(params: &ThresholdParams) -> u64 {
    let mut hasher = rustc_hash::FxHasher::default();
    params.query_length.hash(&mut hasher);
    params.window.hash(&mut hasher);
    params.shape.to_literal().hash(&mut hasher);
    params.errors.hash(&mut hasher);
    params.tau.to_bits().hash(&mut hasher);
    params.p_max.to_bits().hash(&mut hasher);
    params.fpr.to_bits().hash(&mut hasher);
    hasher.finish()
}

fn cache_paths(params: &ThresholdParams) -> Option<(PathBuf, PathBuf)> {
    let dir = params.cache_dir.as_ref()?;
    let hash = cache_hash(params);
    Some((dir.join(format!("threshold_{hash:016x}.bin")), dir.join(format!("correction_{hash:016x}.bin"))))
}

fn read_u64_vector(path: &Path) -> Result<Vec<u64>> {
    let mut reader = BufReader::new(File::open(path)?);
    let len = reader.read_u64::<LittleEndian>()?;
    let mut values = Vec::with_capacity(len as usize);
    for _ in 0..len {
        values.push(reader.read_u64::<LittleEndian>()?);
    }
    Ok(values)
}

fn write_u64_vector(path: &Path, values: &[u64]) -> Result<()> {
    let mut writer = BufWriter::new(
        File::create(path).with_context(|| format!("Cannot create {}", path.display()))?,
    );
    writer.write_u64::<LittleEndian>(values.len() as u64)?;
    for &value in values {
        writer.write_u64::<LittleEndian>(value)?;
    }
    Ok(())
}

fn load_cached(params: &ThresholdParams, expected_len: usize) -> Option<(Vec<u64>, Vec<u64>)> {
    let (threshold_path, correction_path) = cache_paths(params)?;
    if !threshold_path.exists() || !correction_path.exists() {
        return None;
    }
    let thresholds = read_u64_vector(&threshold_path).ok()?;
    let corrections = read_u64_vector(&correction_path).ok()?;
    (thresholds.len() == expected_len && corrections.len() == expected_len)
        .then_some((thresholds, corrections))
}

fn store_cached(params: &ThresholdParams, thresholds: &[u64], corrections: &[u64]) -> Result<()> {
    let (threshold_path, correction_path) =
        cache_paths(params).expect("cache_dir was checked by the caller");
    write_u64_vector(&threshold_path, thresholds)?;
    write_u64_vector(&correction_path, corrections)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(query_length: usize, window: u32, kmer: u32, errors: usize) -> ThresholdParams {
        ThresholdParams {
            query_length,
            window,
            shape: Shape::ungapped(kmer).unwrap(),
            errors,
            tau: 0.9999,
            p_max: 0.15,
            fpr: 0.05,
            percentage: None,
            cache_dir: None,
        }
    }

    #[test]
    fn lemma_threshold_for_equal_window() {
        let thresholder = Thresholder::new(&params(100, 19, 19, 0)).unwrap();
        assert_eq!(thresholder.get(82), 82); // 100 + 1 - 19
        let thresholder = Thresholder::new(&params(100, 19, 19, 2)).unwrap();
        assert_eq!(thresholder.get(82), 44); // 100 + 1 - 3 * 19
        // Destroyed more than available: clamped to 1.
        let thresholder = Thresholder::new(&params(40, 19, 19, 2)).unwrap();
        assert_eq!(thresholder.get(22), 1);
    }

    #[test]
    fn percentage_threshold_rounds_up() {
        let mut p = params(100, 24, 20, 0);
        p.percentage = Some(0.7);
        let thresholder = Thresholder::new(&p).unwrap();
        assert_eq!(thresholder.get(10), 7);
        assert_eq!(thresholder.get(11), 8);
        assert_eq!(thresholder.get(0), 1);
    }

    #[test]
    fn probabilistic_threshold_is_sane() {
        let p = params(32, 10, 6, 1);
        let thresholder = Thresholder::new(&p).unwrap();
        let min = minimal_number_of_minimisers(32, 10, 6);
        let max = 32 - 10 + 1;
        assert!(min <= max);
        for m in min..=max {
            let value = thresholder.get(m);
            assert!(value >= 1);
            assert!(value <= m);
        }
        // Out-of-range counts clamp to the boundary entries.
        assert_eq!(thresholder.get(0), thresholder.get(min));
        assert_eq!(thresholder.get(1000), thresholder.get(max));
    }

    #[test]
    fn correction_grows_with_fpr() {
        let loose = precompute_correction(32, 10, 6, 0.30, 0.15);
        let tight = precompute_correction(32, 10, 6, 0.01, 0.15);
        assert_eq!(loose.len(), tight.len());
        for (l, t) in loose.iter().zip(tight.iter()) {
            assert!(l >= t);
        }
    }

    #[test]
    fn cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = params(32, 10, 6, 1);
        p.cache_dir = Some(dir.path().to_path_buf());
        let fresh = Thresholder::new(&p).unwrap();
        let cached = Thresholder::new(&p).unwrap();
        for m in 0..40 {
            assert_eq!(fresh.get(m), cached.get(m));
        }
        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn pascal_row_matches_binomials() {
        assert_eq!(pascal_row(4), vec![1, 4, 6, 4, 1]);
        assert_eq!(pascal_row(0), vec![1]);
    }
}
