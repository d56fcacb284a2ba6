use crate::hash::{MinimiserHasher, resolve_shape};
use crate::utils::CommonArgs;
use crate::utils::bin_list::{is_minimiser_file, read_bin_list};
use crate::utils::io::{
    MinimiserHeader, hash_sequence_files, write_minimiser_header, write_minimiser_values,
};
use anyhow::{Context, Result, ensure};
use clap::Parser;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(about = "Precompute cutoff-filtered minimiser files for a set of user bins")]
pub struct PrepareArgs {
    /// Common thread/verbosity arguments
    #[clap(flatten)]
    pub common: CommonArgs,

    /// Bin list: one user bin per line, whitespace-separated sequence files
    #[arg(short, long)]
    pub input: PathBuf,

    /// Output directory for the .minimiser/.header files
    #[arg(short, long)]
    pub output: PathBuf,

    /// The k-mer size. Mutually exclusive with --shape
    #[arg(short, long)]
    pub kmer: Option<u32>,

    /// Gapped shape literal. Mutually exclusive with --kmer
    #[arg(long)]
    pub shape: Option<String>,

    /// The window size; defaults to the k-mer size
    #[arg(short, long)]
    pub window: Option<u32>,

    /// Use a cutoff of 1 for all files
    #[arg(long)]
    pub disable_cutoffs: bool,
}

pub fn run(args: &PrepareArgs) -> Result<()> {
    args.common.init_thread_pool()?;
    compute_minimisers(args)
}

const DEFAULT_CUTOFF: u16 = 50;
/// Cutoffs and bounds from Mantis: k-mers that occur fewer times than a
/// file-size-dependent cutoff are dropped. The bounds refer to gzipped FASTQ.
const CUTOFFS: [u16; 4] = [1, 3, 10, 20];
const CUTOFF_BOUNDS: [u64; 4] = [314_572_800, 524_288_000, 1_073_741_824, 3_221_225_472];

const COMPRESSED_EXTENSIONS: [&str; 3] = ["gz", "bgzf", "bz2"];
const FASTA_EXTENSIONS: [&str; 6] = ["fa", "fasta", "fna", "ffn", "faa", "frn"];

pub fn file_is_compressed(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| COMPRESSED_EXTENSIONS.iter().any(|c| ext.eq_ignore_ascii_case(c)))
}

fn file_is_fasta(path: &Path) -> bool {
    let relevant = if file_is_compressed(path) { path.with_extension("") } else { path.to_path_buf() };
    relevant
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| FASTA_EXTENSIONS.iter().any(|f| ext.eq_ignore_ascii_case(f)))
}

/// The cutoff table is calibrated on gzipped FASTQ sizes; FASTA carries
/// roughly twice the payload per byte, uncompressed input roughly a third.
pub fn cutoff_for(file_size: u64, is_fasta: bool, is_compressed: bool) -> u16 {
    let adjusted = file_size * if is_fasta { 2 } else { 1 } / if is_compressed { 1 } else { 3 };
    for (bound, cutoff) in CUTOFF_BOUNDS.iter().zip(CUTOFFS.iter()) {
        if adjusted <= *bound {
            return *cutoff;
        }
    }
    DEFAULT_CUTOFF
}

fn cutoff_of(path: &Path, disable_cutoffs: bool) -> Result<u16> {
    if disable_cutoffs {
        return Ok(1);
    }
    let size = std::fs::metadata(path)
        .with_context(|| format!("Cannot stat {}", path.display()))?
        .len();
    Ok(cutoff_for(size, file_is_fasta(path), file_is_compressed(path)))
}

/// Output stem of a user bin, named after its first file with compression
/// suffixes stripped.
fn output_stem(output_dir: &Path, file: &Path) -> PathBuf {
    let stripped = if file_is_compressed(file) { file.with_extension("") } else { file.to_path_buf() };
    let stem = stripped.file_stem().unwrap_or_default();
    output_dir.join(stem)
}

pub fn compute_minimisers(args: &PrepareArgs) -> Result<()> {
    let (shape, window) = resolve_shape(args.kmer, args.shape.as_deref(), args.window)?;
    let bins = read_bin_list(&args.input)?;
    ensure!(
        bins.iter().flatten().all(|file| !is_minimiser_file(file)),
        "The input already consists of minimiser files."
    );
    std::fs::create_dir_all(&args.output)
        .with_context(|| format!("Failed to create directory {}", args.output.display()))?;

    bins.par_iter().try_for_each(|files| -> Result<()> {
        let stem = output_stem(&args.output, &files[0]);
        let minimiser_file = stem.with_extension("minimiser");
        let header_file = stem.with_extension("header");
        let progress_file = stem.with_extension("in_progress");

        // A completed bin has both outputs and no sentinel; everything else
        // is (re-)computed under a fresh sentinel.
        let already_done =
            minimiser_file.exists() && header_file.exists() && !progress_file.exists();
        if already_done {
            return Ok(());
        }
        File::create(&progress_file)
            .with_context(|| format!("Cannot create {}", progress_file.display()))?;

        // Occurrence counts saturate at 254: the largest cutoff is 50, so
        // precise counts above that carry no information.
        let mut occurrences: FxHashMap<u64, u8> = FxHashMap::default();
        let mut hasher = MinimiserHasher::new(shape, window)?;
        hash_sequence_files(files, &mut hasher, |hash| {
            let count = occurrences.entry(hash).or_insert(0);
            *count = count.saturating_add(1).min(254);
        })?;

        let cutoff = cutoff_of(&files[0], args.disable_cutoffs)?;
        let count = write_minimiser_values(
            &minimiser_file,
            occurrences
                .iter()
                .filter(|&(_, &count)| u16::from(count) >= cutoff)
                .map(|(&hash, _)| hash),
        )?;

        write_minimiser_header(&header_file, &MinimiserHeader { shape, window, cutoff, count })?;

        std::fs::remove_file(&progress_file)?;
        if args.common.verbose {
            eprintln!("Wrote {} ({} minimisers, cutoff {})", minimiser_file.display(), count, cutoff);
        }
        Ok(())
    })?;

    write_list_file(args, &bins)
}

/// `minimiser.list` names the produced files in bin order, ready to be used
/// as the bin list of a subsequent build.
fn write_list_file(args: &PrepareArgs, bins: &[Vec<PathBuf>]) -> Result<()> {
    let list_path = args.output.join("minimiser.list");
    let mut file = File::create(&list_path)
        .with_context(|| format!("Cannot create {}", list_path.display()))?;
    for files in bins {
        let path = output_stem(&args.output, &files[0]).with_extension("minimiser");
        writeln!(file, "{}", path.display())?;
    }
    Ok(())
}
