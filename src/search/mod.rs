use crate::hash::MinimiserHasher;
use crate::index::{RaptorIndex, part_path};
use crate::threshold::{ThresholdParams, Thresholder};
use crate::utils::CommonArgs;
use crate::utils::io::{ChunkedQueryReader, QueryRecord, for_each_record};
use crate::utils::partition::PartitionConfig;
use crate::utils::sync_out::SyncOut;
use anyhow::{Context, Result, bail, ensure};
use clap::{ArgGroup, Parser};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use rustc_hash::FxHashSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Queries are processed in chunks of this many records to bound memory.
const QUERY_CHUNK: usize = 10 * (1 << 20);

#[derive(Parser, Debug)]
#[command(
    about = "Query an index for the user bins that likely contain each read",
    group = ArgGroup::new("threshold_mode").args(["error", "threshold"])
)]
pub struct SearchArgs {
    /// Common thread/verbosity arguments
    #[clap(flatten)]
    pub common: CommonArgs,

    /// The index to search
    #[arg(short, long)]
    pub index: PathBuf,

    /// FASTA/FASTQ file with the query reads
    #[arg(short, long)]
    pub query: PathBuf,

    /// Where to write the results
    #[arg(short, long)]
    pub output: PathBuf,

    /// The number of errors. Mutually exclusive with --threshold
    #[arg(short, long, default_value_t = 0)]
    pub error: usize,

    /// Fraction of minimisers that must match. Mutually exclusive with --error
    #[arg(long)]
    pub threshold: Option<f64>,

    /// The query length used for thresholding; defaults to the median query
    /// length and skips the query length validation when set
    #[arg(long = "query_length")]
    pub query_length: Option<usize>,

    /// The higher tau, the lower the threshold
    #[arg(long, default_value_t = 0.9999)]
    pub tau: f64,

    /// The higher p_max, the lower the threshold
    #[arg(long = "p_max", default_value_t = 0.15)]
    pub p_max: f64,

    /// Store the computed thresholds next to the index and reuse them
    #[arg(long = "cache-thresholds")]
    pub cache_thresholds: bool,
}

pub fn run(args: &SearchArgs) -> Result<()> {
    args.common.init_thread_pool()?;
    ensure!((0.0..=1.0).contains(&args.tau), "tau must be in [0, 1].");
    ensure!((0.0..=1.0).contains(&args.p_max), "p_max must be in [0, 1].");
    if let Some(threshold) = args.threshold {
        ensure!((0.0..=1.0).contains(&threshold), "The threshold must be in [0, 1].");
    }

    let index_file = resolve_index_file(&args.index)?;
    let index = RaptorIndex::load(&index_file)?;

    let query_length = determine_query_length(args, index.window)?;

    let thresholder = Thresholder::new(&ThresholdParams {
        query_length,
        window: index.window,
        shape: index.shape,
        errors: args.error,
        tau: args.tau,
        p_max: args.p_max,
        fpr: index.config.fpr,
        percentage: args.threshold,
        cache_dir: args
            .cache_thresholds
            .then(|| args.index.parent().unwrap_or(Path::new(".")).to_path_buf()),
    })?;

    let out = SyncOut::create(&args.output)?;
    out.write_header(&index.bin_path)?;

    match (index.is_hibf(), index.parts > 1) {
        (false, false) => search_ibf(&index, args, &thresholder, &out)?,
        (true, false) => search_hibf(&index, args, &thresholder, &out)?,
        (false, true) => search_partitioned_ibf(index, args, &thresholder, &out)?,
        (true, true) => search_partitioned_hibf(index, args, &thresholder, &out)?,
    }

    out.finish()
}

/// A partitioned index lives in `_0`-suffixed files; finding both layouts for
/// one base name is ambiguous.
fn resolve_index_file(index: &Path) -> Result<PathBuf> {
    let monolithic = index.exists();
    let part_zero = part_path(index, 0);
    let partitioned = part_zero.exists();
    if monolithic && partitioned {
        bail!(
            "Ambiguous index. Both monolithic ({}) and partitioned ({}) exist.",
            index.display(),
            part_zero.display()
        );
    }
    if partitioned { Ok(part_zero) } else { Ok(index.to_path_buf()) }
}

fn determine_query_length(args: &SearchArgs, window: u32) -> Result<usize> {
    if let Some(length) = args.query_length {
        return Ok(length);
    }

    let mut lengths: Vec<usize> = Vec::new();
    for_each_record(&args.query, |_, seq| {
        lengths.push(seq.len());
        Ok(())
    })
    .with_context(|| format!("Cannot read query file {}", args.query.display()))?;
    ensure!(!lengths.is_empty(), "The query file is empty.");

    lengths.sort_unstable();
    let median = lengths[lengths.len() / 2];
    let shortest = lengths[0];
    let longest = lengths[lengths.len() - 1];

    if args.threshold.is_none() && longest - shortest > median / 20 {
        eprintln!(
            "Warning: the query lengths differ substantially (shortest {shortest}, longest \
             {longest}). The thresholding will use a single query length ({median})."
        );
    }
    ensure!(
        longest <= usize::from(u16::MAX),
        "Queries longer than {} are not supported.",
        u16::MAX
    );
    ensure!(
        shortest >= window as usize,
        "The (minimal) query length ({}) is too short for the window size ({}).",
        shortest,
        window
    );

    Ok(median)
}

fn append_result_line(line: &mut String, id: &str, bins: impl Iterator<Item = u64>) {
    line.clear();
    line.push_str(id);
    line.push('\t');
    let mut first = true;
    for bin in bins {
        if !first {
            line.push(',');
        }
        write!(line, "{bin}").expect("writing to a string cannot fail");
        first = false;
    }
    line.push('\n');
}

fn search_ibf(
    index: &RaptorIndex,
    args: &SearchArgs,
    thresholder: &Thresholder,
    out: &SyncOut,
) -> Result<()> {
    let ibf = index.ibf()?;
    let mut reader = ChunkedQueryReader::open(&args.query)?;
    let mut records: Vec<QueryRecord> = Vec::new();

    while reader.next_chunk(QUERY_CHUNK, &mut records)? {
        records.par_iter().try_for_each_init(
            || {
                (
                    MinimiserHasher::new(index.shape, index.window)
                        .expect("shape and window were validated at build time"),
                    ibf.counting_agent::<u16>(),
                    Vec::<u64>::new(),
                    String::new(),
                )
            },
            |(hasher, agent, minimisers, line), record| -> Result<()> {
                minimisers.clear();
                hasher.hashes_into(&record.seq, minimisers);
                let threshold = thresholder.get(minimisers.len());
                let counts = agent.bulk_count(minimisers);
                let hits = counts
                    .iter()
                    .take(ibf.bin_count())
                    .enumerate()
                    .filter(|&(_, &count)| usize::from(count) >= threshold)
                    .map(|(bin, _)| bin as u64);
                append_result_line(line, &record.id, hits);
                out.write(line)
            },
        )?;
    }
    Ok(())
}

fn search_hibf(
    index: &RaptorIndex,
    args: &SearchArgs,
    thresholder: &Thresholder,
    out: &SyncOut,
) -> Result<()> {
    let hibf = index.hibf()?;
    let mut reader = ChunkedQueryReader::open(&args.query)?;
    let mut records: Vec<QueryRecord> = Vec::new();

    while reader.next_chunk(QUERY_CHUNK, &mut records)? {
        records.par_iter().try_for_each_init(
            || {
                (
                    MinimiserHasher::new(index.shape, index.window)
                        .expect("shape and window were validated at build time"),
                    hibf.membership_agent(),
                    Vec::<u64>::new(),
                    String::new(),
                )
            },
            |(hasher, agent, minimisers, line), record| -> Result<()> {
                minimisers.clear();
                hasher.hashes_into(&record.seq, minimisers);
                let threshold = thresholder.get(minimisers.len());
                let user_bins = agent.membership_for(minimisers, threshold);
                append_result_line(line, &record.id, user_bins.iter().copied());
                out.write(line)
            },
        )?;
    }
    Ok(())
}

/// Partitioned flat search: every part contributes its counts, thresholding
/// happens once after the last part. The next part's index loads while the
/// current part is being counted.
fn search_partitioned_ibf(
    first: RaptorIndex,
    args: &SearchArgs,
    thresholder: &Thresholder,
    out: &SyncOut,
) -> Result<()> {
    let parts = first.parts;
    let partition = PartitionConfig::new(parts)?;
    let shape = first.shape;
    let window = first.window;

    let mut reader = ChunkedQueryReader::open(&args.query)?;
    let mut records: Vec<QueryRecord> = Vec::new();
    let mut first = Some(first);

    while reader.next_chunk(QUERY_CHUNK, &mut records)? {
        // Deterministic shuffle: neighbouring reads often hit the same bins,
        // spreading them out balances the workers.
        records.shuffle(&mut StdRng::seed_from_u64(0));

        let mut counts: Vec<Vec<u16>> = vec![Vec::new(); records.len()];
        let mut current = match first.take() {
            Some(index) => index,
            None => RaptorIndex::load(&part_path(&args.index, 0))?,
        };

        for part in 0..parts {
            let prefetch = (part + 1 < parts).then(|| {
                let path = part_path(&args.index, part + 1);
                std::thread::spawn(move || RaptorIndex::load(&path))
            });

            let ibf = current.ibf()?;
            let is_last = part + 1 == parts;

            records
                .par_iter()
                .zip(counts.par_iter_mut())
                .try_for_each_init(
                    || {
                        (
                            MinimiserHasher::new(shape, window)
                                .expect("shape and window were validated at build time"),
                            ibf.counting_agent::<u16>(),
                            Vec::<u64>::new(),
                            Vec::<u64>::new(),
                            String::new(),
                        )
                    },
                    |(hasher, agent, minimisers, filtered, line), (record, accumulated)| -> Result<()> {
                        minimisers.clear();
                        hasher.hashes_into(&record.seq, minimisers);
                        filtered.clear();
                        filtered.extend(
                            minimisers.iter().copied().filter(|&m| partition.partition(m) == part),
                        );

                        let part_counts = agent.bulk_count(filtered);
                        if accumulated.is_empty() {
                            accumulated.resize(part_counts.len(), 0);
                        }
                        for (total, &part_count) in accumulated.iter_mut().zip(part_counts) {
                            *total += part_count;
                        }

                        if is_last {
                            let threshold = thresholder.get(minimisers.len());
                            let hits = accumulated
                                .iter()
                                .take(ibf.bin_count())
                                .enumerate()
                                .filter(|&(_, &count)| usize::from(count) >= threshold)
                                .map(|(bin, _)| bin as u64);
                            append_result_line(line, &record.id, hits);
                            out.write(line)?;
                        }
                        Ok(())
                    },
                )?;

            if let Some(handle) = prefetch {
                current = handle
                    .join()
                    .map_err(|_| anyhow::anyhow!("The index prefetch thread panicked."))??;
            }
        }
    }
    Ok(())
}

/// Partitioned hierarchical search: each part is queried with the minimisers
/// it owns, per-query hits accumulate across parts and are emitted after the
/// last part.
fn search_partitioned_hibf(
    first: RaptorIndex,
    args: &SearchArgs,
    thresholder: &Thresholder,
    out: &SyncOut,
) -> Result<()> {
    let parts = first.parts;
    let partition = PartitionConfig::new(parts)?;
    let shape = first.shape;
    let window = first.window;

    let mut reader = ChunkedQueryReader::open(&args.query)?;
    let mut records: Vec<QueryRecord> = Vec::new();
    let mut first = Some(first);

    while reader.next_chunk(QUERY_CHUNK, &mut records)? {
        let mut results: Vec<FxHashSet<u64>> = vec![FxHashSet::default(); records.len()];
        let mut current = match first.take() {
            Some(index) => index,
            None => RaptorIndex::load(&part_path(&args.index, 0))?,
        };

        for part in 0..parts {
            let prefetch = (part + 1 < parts).then(|| {
                let path = part_path(&args.index, part + 1);
                std::thread::spawn(move || RaptorIndex::load(&path))
            });

            let hibf = current.hibf()?;
            let is_last = part + 1 == parts;

            records
                .par_iter()
                .zip(results.par_iter_mut())
                .try_for_each_init(
                    || {
                        (
                            MinimiserHasher::new(shape, window)
                                .expect("shape and window were validated at build time"),
                            hibf.membership_agent(),
                            Vec::<u64>::new(),
                            Vec::<u64>::new(),
                            String::new(),
                        )
                    },
                    |(hasher, agent, minimisers, filtered, line), (record, accumulated)| -> Result<()> {
                        minimisers.clear();
                        hasher.hashes_into(&record.seq, minimisers);
                        filtered.clear();
                        filtered.extend(
                            minimisers.iter().copied().filter(|&m| partition.partition(m) == part),
                        );

                        if !filtered.is_empty() {
                            let threshold = thresholder.get(filtered.len());
                            accumulated.extend(agent.membership_for(filtered, threshold));
                        }

                        if is_last {
                            let mut user_bins: Vec<u64> = accumulated.iter().copied().collect();
                            user_bins.sort_unstable();
                            append_result_line(line, &record.id, user_bins.into_iter());
                            out.write(line)?;
                        }
                        Ok(())
                    },
                )?;

            if let Some(handle) = prefetch {
                current = handle
                    .join()
                    .map_err(|_| anyhow::anyhow!("The index prefetch thread panicked."))??;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_lines_keep_the_tab_on_empty_hits() {
        let mut line = String::new();
        append_result_line(&mut line, "query1", [1u64, 5, 17].into_iter());
        assert_eq!(line, "query1\t1,5,17\n");
        append_result_line(&mut line, "query2", std::iter::empty());
        assert_eq!(line, "query2\t\n");
    }

    #[test]
    fn ambiguous_index_layout_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("idx");
        std::fs::write(&base, b"x").unwrap();
        std::fs::write(part_path(&base, 0), b"x").unwrap();
        assert!(resolve_index_file(&base).unwrap_err().to_string().contains("Ambiguous"));
        std::fs::remove_file(&base).unwrap();
        assert_eq!(resolve_index_file(&base).unwrap(), part_path(&base, 0));
    }
}
