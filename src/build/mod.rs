use crate::hash::{MinimiserHasher, Shape};
use crate::hibf::build::build_hibf;
use crate::hibf::layout::{self, Layout, is_layout_file, parse_layout};
use crate::ibf::Ibf;
use crate::index::{IndexConfig, IndexStructure, RaptorIndex, part_path};
use crate::prepare;
use crate::utils::CommonArgs;
use crate::utils::bin_list::{all_minimiser_input, is_minimiser_file, read_bin_list};
use crate::utils::io::{
    for_each_minimiser_value, hash_sequence_files, read_minimiser_header,
};
use crate::utils::partition::PartitionConfig;
use anyhow::{Context, Result, ensure};
use clap::Parser;
use rayon::prelude::*;
use regex::Regex;
use rustc_hash::FxHashSet;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(about = "Build an index over a set of user bins")]
pub struct BuildArgs {
    /// Common thread/verbosity arguments
    #[clap(flatten)]
    pub common: CommonArgs,

    /// Bin list (one user bin per line) or layout file
    #[arg(short, long)]
    pub input: PathBuf,

    /// Where to write the index
    #[arg(short, long)]
    pub output: PathBuf,

    /// The k-mer size. Mutually exclusive with --shape
    #[arg(short, long)]
    pub kmer: Option<u32>,

    /// Gapped shape literal, e.g. 10111011. Mutually exclusive with --kmer
    #[arg(long)]
    pub shape: Option<String>,

    /// The window size; defaults to the k-mer size
    #[arg(short, long)]
    pub window: Option<u32>,

    /// The size of the resulting index, e.g. 8m (suffixes k, m, g, t)
    #[arg(short, long, default_value = "1g")]
    pub size: String,

    /// The number of hash functions
    #[arg(long, default_value_t = 2)]
    pub hash: usize,

    /// False-positive rate target per technical bin
    #[arg(long, default_value_t = 0.05)]
    pub fpr: f64,

    /// Relaxed false-positive rate tolerated for merged bins
    #[arg(long = "relaxed-fpr", default_value_t = 0.3)]
    pub relaxed_fpr: f64,

    /// Target maximum number of technical bins per IBF of an HIBF
    #[arg(long, default_value_t = 64)]
    pub tmax: usize,

    /// Splits the index in this many parts (power of two)
    #[arg(short, long, default_value_t = 1)]
    pub parts: u32,

    /// Build a hierarchical index
    #[arg(long)]
    pub hibf: bool,

    /// Precompute minimiser files instead of building an index
    #[arg(long)]
    pub compute_minimiser: bool,

    /// Use a cutoff of 1 for all files during minimiser computation
    #[arg(long)]
    pub disable_cutoffs: bool,
}

impl BuildArgs {
    fn resolve_shape(&self) -> Result<(Shape, u32)> {
        crate::hash::resolve_shape(self.kmer, self.shape.as_deref(), self.window)
    }

    fn config(&self) -> Result<IndexConfig> {
        ensure!(self.fpr > 0.0 && self.fpr < 1.0, "The false positive rate must be in (0, 1).");
        ensure!(
            self.relaxed_fpr > 0.0 && self.relaxed_fpr < 1.0,
            "The relaxed false positive rate must be in (0, 1)."
        );
        ensure!(self.tmax >= 2, "tmax must be at least 2.");
        Ok(IndexConfig {
            tmax: self.tmax,
            fpr: self.fpr,
            relaxed_fpr: self.relaxed_fpr,
            ..IndexConfig::default()
        })
    }
}

/// Parses a size literal like `8m` into a byte count.
pub fn parse_size(text: &str) -> Result<u64> {
    let pattern = Regex::new(r"^(\d+)\s?([kmgtKMGT])$")?;
    let captures = pattern
        .captures(text.trim())
        .with_context(|| format!("Use {{k, m, g, t}} to pass a size, e.g. --size 8g (got '{text}')."))?;
    let number: u64 = captures[1].parse()?;
    let multiplier: u64 = match captures[2].to_ascii_lowercase().as_str() {
        "k" => 1 << 10,
        "m" => 1 << 20,
        "g" => 1 << 30,
        _ => 1 << 40,
    };
    Ok(number * multiplier)
}

pub fn run(args: &BuildArgs) -> Result<()> {
    args.common.init_thread_pool()?;
    let (shape, window) = args.resolve_shape()?;

    if args.compute_minimiser {
        return prepare::compute_minimisers(&prepare::PrepareArgs {
            common: args.common.clone(),
            input: args.input.clone(),
            output: args.output.clone(),
            kmer: args.kmer,
            shape: args.shape.clone(),
            window: args.window,
            disable_cutoffs: args.disable_cutoffs,
        });
    }

    if is_layout_file(&args.input) {
        let layout = parse_layout(&args.input)?;
        for files in &layout.bin_paths {
            for file in files {
                ensure!(file.exists(), "The file {} does not exist.", file.display());
            }
        }
        return build_hierarchical(args, shape, window, &layout);
    }

    let bins = read_bin_list(&args.input)?;
    if args.hibf {
        let layout = plan_from_bin_list(args, shape, window, bins)?;
        build_hierarchical(args, shape, window, &layout)
    } else {
        build_flat(args, shape, window, &bins)
    }
}

/// Collects the k-mer content of one user bin, from sequence or minimiser
/// files, optionally restricted to one partition.
fn gather_user_bin(
    files: &[PathBuf],
    shape: Shape,
    window: u32,
    partition: Option<(&PartitionConfig, u32)>,
    mut sink: impl FnMut(u64),
) -> Result<()> {
    let keep = |value: u64, sink: &mut dyn FnMut(u64)| match partition {
        Some((config, part)) => {
            if config.partition(value) == part {
                sink(value)
            }
        }
        None => sink(value),
    };

    for file in files {
        if is_minimiser_file(file) {
            let header_path = file.with_extension("header");
            let header = read_minimiser_header(&header_path)?;
            ensure!(
                header.shape == shape && header.window == window,
                "The minimiser file {} was computed with shape {} and window {}, \
                 but the build uses shape {} and window {}.",
                file.display(),
                header.shape.to_literal(),
                header.window,
                shape.to_literal(),
                window
            );
            for_each_minimiser_value(file, |value| keep(value, &mut sink))?;
        } else {
            let mut hasher = MinimiserHasher::new(shape, window)?;
            hash_sequence_files(std::slice::from_ref(file), &mut hasher, |value| {
                keep(value, &mut sink)
            })?;
        }
    }
    Ok(())
}

fn build_flat(args: &BuildArgs, shape: Shape, window: u32, bins: &[Vec<PathBuf>]) -> Result<()> {
    all_minimiser_input(bins)?;
    let config = args.config()?;
    let partition = PartitionConfig::new(args.parts)?;

    let total_bits = parse_size(&args.size)? * 8;
    let padded_bins = bins.len().next_multiple_of(64) as u64;
    let bin_size = total_bits / padded_bins / u64::from(args.parts);
    ensure!(
        bin_size > 0,
        "The bit budget of {} is too small for {} bins in {} parts.",
        args.size,
        bins.len(),
        args.parts
    );

    for part in 0..args.parts {
        let filter = (args.parts > 1).then_some((&partition, part));
        let ibf = Ibf::new(bins.len(), bin_size, args.hash)?;
        bins.par_iter().enumerate().try_for_each(|(bin_idx, files)| -> Result<()> {
            gather_user_bin(files, shape, window, filter, |value| ibf.insert(value, bin_idx))
        })?;

        let index = RaptorIndex {
            window,
            shape,
            parts: args.parts,
            bin_path: bins.to_vec(),
            config: config.clone(),
            structure: IndexStructure::Ibf(ibf),
        };
        let path = target_path(&args.output, args.parts, part);
        index.store(&path)?;
        if args.common.verbose {
            eprintln!("Wrote {}", path.display());
        }
    }

    Ok(())
}

fn target_path(output: &Path, parts: u32, part: u32) -> PathBuf {
    if parts == 1 { output.to_path_buf() } else { part_path(output, part) }
}

/// Derives a layout for `--hibf` builds that come with a plain bin list
/// instead of a layout file.
fn plan_from_bin_list(
    args: &BuildArgs,
    shape: Shape,
    window: u32,
    bins: Vec<Vec<PathBuf>>,
) -> Result<Layout> {
    all_minimiser_input(&bins)?;
    let cardinalities: Vec<(usize, u64)> = bins
        .par_iter()
        .enumerate()
        .map(|(user_bin, files)| -> Result<(usize, u64)> {
            let mut kmers: FxHashSet<u64> = FxHashSet::default();
            gather_user_bin(files, shape, window, None, |value| {
                kmers.insert(value);
            })?;
            Ok((user_bin, kmers.len() as u64))
        })
        .collect::<Result<Vec<_>>>()?;

    let root = layout::plan(&cardinalities, args.tmax);
    Ok(Layout { root, bin_paths: bins })
}

fn build_hierarchical(args: &BuildArgs, shape: Shape, window: u32, layout: &Layout) -> Result<()> {
    let config = args.config()?;
    let partition = PartitionConfig::new(args.parts)?;

    for part in 0..args.parts {
        let filter = (args.parts > 1).then_some((&partition, part));
        let input_fn = |user_bin: usize, out: &mut FxHashSet<u64>| -> Result<()> {
            gather_user_bin(&layout.bin_paths[user_bin], shape, window, filter, |value| {
                out.insert(value);
            })
        };
        let hibf =
            build_hibf(&layout.root, layout.bin_paths.len(), args.hash, &config, &input_fn)?;

        let index = RaptorIndex {
            window,
            shape,
            parts: args.parts,
            bin_path: layout.bin_paths.clone(),
            config: config.clone(),
            structure: IndexStructure::Hibf(hibf),
        };
        let path = target_path(&args.output, args.parts, part);
        index.store(&path)?;
        if args.common.verbose {
            eprintln!("Wrote {}", path.display());
        }
    }

    Ok(())
}
