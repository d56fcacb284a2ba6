use crate::hash::MinimiserHasher;
use crate::hibf::build::build_hibf;
use crate::hibf::layout::plan;
use crate::hibf::{DELETED, Hibf, MERGED, PrevId};
use crate::ibf::{Ibf, fpr_for, max_elements_for};
use crate::index::{IndexConfig, IndexStructure, RaptorIndex};
use crate::utils::CommonArgs;
use crate::utils::bin_list::{is_minimiser_file, read_bin_list};
use crate::utils::io::hash_sequence_files;
use anyhow::{Result, ensure};
use clap::Parser;
use rayon::prelude::*;
use rustc_hash::FxHashSet;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(about = "Insert new user bins into an existing HIBF index")]
pub struct UpdateArgs {
    /// Common thread/verbosity arguments
    #[clap(flatten)]
    pub common: CommonArgs,

    /// The index to update
    #[arg(short, long)]
    pub index: PathBuf,

    /// Bin list naming the user bins to insert
    #[arg(long)]
    pub insert: PathBuf,

    /// Where to write the updated index
    #[arg(short, long)]
    pub output: PathBuf,
}

pub fn run(args: &UpdateArgs) -> Result<()> {
    args.common.init_thread_pool()?;
    let mut index = RaptorIndex::load(&args.index)?;
    ensure!(index.is_hibf(), "Online insertion requires an HIBF index.");

    for files in read_bin_list(&args.insert)? {
        ensure!(
            files.iter().all(|f| !is_minimiser_file(f)),
            "Online insertion works on sequence files, not minimiser files."
        );
        let report = insert_user_bin(&mut index, files)?;
        if args.common.verbose {
            match report.rebuild {
                Some(RebuildKind::Full) => eprintln!("Full rebuild after inserting user bin {}", report.user_bin),
                Some(RebuildKind::Partial { ibf_idx, bin_idx }) => eprintln!(
                    "Partial rebuild at IBF {ibf_idx}, bin {bin_idx} after inserting user bin {}",
                    report.user_bin
                ),
                None => eprintln!("Inserted user bin {}", report.user_bin),
            }
        }
    }

    index.store(&args.output)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildKind {
    Partial { ibf_idx: usize, bin_idx: usize },
    Full,
}

#[derive(Debug)]
pub struct InsertReport {
    pub user_bin: usize,
    pub rebuild: Option<RebuildKind>,
}

#[derive(Debug, Clone, Copy)]
struct InsertLocation {
    ibf_idx: usize,
    bin_idx: usize,
    number_of_bins: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RebuildLocation {
    ibf_idx: usize,
    bin_idx: usize,
}

/// Capacity of one IBF: the largest k-mer set a single bin absorbs while
/// keeping its FPR within the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct IbfMax {
    max_elements: u64,
    ibf_idx: usize,
}

fn max_ibf_sizes(hibf: &Hibf, config: &IndexConfig) -> Vec<IbfMax> {
    let mut sizes: Vec<IbfMax> = hibf
        .ibf_vector
        .iter()
        .enumerate()
        .filter(|(_, ibf)| !ibf.is_tombstone())
        .map(|(ibf_idx, ibf)| IbfMax {
            max_elements: max_elements_for(ibf.bin_size(), ibf.hash_count(), config.fpr),
            ibf_idx,
        })
        .collect();
    sizes.sort_unstable();
    sizes
}

/// Smallest split width for `elements` such that the union FPR over the split
/// bins stays within the target.
fn required_technical_bins(
    bin_size: u64,
    elements: u64,
    fpr: f64,
    hash_count: usize,
    max_elements: u64,
) -> usize {
    let split_fpr = |split: u64| {
        let fpr_tb = fpr_for(bin_size, hash_count, elements.div_ceil(split));
        1.0 - ((-fpr_tb).ln_1p() * split as f64).exp()
    };

    let mut number_of_bins = elements.div_ceil(max_elements.max(1)).max(1);
    while split_fpr(number_of_bins) > fpr {
        number_of_bins += 1;
    }
    number_of_bins as usize
}

/// Start of a run of `number_of_bins` empty bins, counting the region the IBF
/// could still grow into without reallocating. `None` if neither exists.
fn probe_empty_bin(ibf: &Ibf, number_of_bins: usize) -> Option<usize> {
    let start = ibf.find_empty_run(number_of_bins).unwrap_or(ibf.bin_count());
    let end = start + number_of_bins;
    (end <= ibf.bin_count() || end.next_multiple_of(64) <= ibf.bin_count_padded()).then_some(start)
}

/// Chooses the IBF that hosts the new user bin.
///
/// Best fit first: the smallest IBF whose per-bin capacity holds the set
/// unsplit, then smaller ones (accepting splits). If none has room, walk
/// towards the root, trying parents and any IBF sized between the current one
/// and its parent. Falling through to the root triggers the rebuild path.
fn find_ibf_size_splitting(
    max_sizes: &[IbfMax],
    kmer_count: usize,
    hibf: &Hibf,
    config: &IndexConfig,
) -> (usize, u64) {
    let number_of_ibfs = max_sizes.len();
    let binary_search_index = {
        let first_fit = max_sizes.partition_point(|m| m.max_elements < kmer_count as u64);
        if first_fit == number_of_ibfs { number_of_ibfs - 1 } else { first_fit }
    };

    // 1 & 2: the best fit and everything smaller.
    let mut size_idx = binary_search_index;
    loop {
        let ibf_idx = max_sizes[size_idx].ibf_idx;
        let ibf = &hibf.ibf_vector[ibf_idx];
        let number_of_bins = required_technical_bins(
            ibf.bin_size(),
            kmer_count as u64,
            config.fpr,
            ibf.hash_count(),
            max_sizes[size_idx].max_elements,
        );
        if probe_empty_bin(ibf, number_of_bins).is_some() {
            return (ibf_idx, max_sizes[size_idx].max_elements);
        }
        if size_idx == 0 {
            break;
        }
        size_idx -= 1;
    }

    // 3: walk upwards, allowing promotion into larger IBFs.
    let mut size_idx = binary_search_index;
    let mut ibf_idx = max_sizes[size_idx].ibf_idx;
    while ibf_idx != 0 {
        let parent_ibf_idx = hibf.prev_ibf_id[ibf_idx].ibf_idx;
        let parent_bin_size = hibf.ibf_vector[parent_ibf_idx].bin_size();

        if probe_empty_bin(&hibf.ibf_vector[parent_ibf_idx], 1).is_some() {
            return (ibf_idx, max_sizes[size_idx].max_elements);
        }

        while size_idx < number_of_ibfs && max_sizes[size_idx].max_elements < parent_bin_size {
            ibf_idx = max_sizes[size_idx].ibf_idx;
            if probe_empty_bin(&hibf.ibf_vector[ibf_idx], 1).is_some() {
                return (ibf_idx, max_sizes[size_idx].max_elements);
            }
            size_idx += 1;
        }

        if size_idx == number_of_ibfs {
            return (ibf_idx, max_sizes[number_of_ibfs - 1].max_elements);
        }
        ibf_idx = max_sizes[size_idx].ibf_idx;
    }

    (0, max_sizes[size_idx.min(number_of_ibfs - 1)].max_elements)
}

/// Reserves the technical bins for the new user bin, growing the chosen IBF
/// if needed, and wires the arena bookkeeping.
fn get_location(max_sizes: &[IbfMax], kmer_count: usize, index: &mut RaptorIndex) -> Result<InsertLocation> {
    let (ibf_idx, max_elements) = {
        let hibf = index.hibf()?;
        find_ibf_size_splitting(max_sizes, kmer_count, hibf, &index.config)
    };
    let fpr = index.config.fpr;
    let hibf = index.hibf_mut()?;

    let number_of_bins = {
        let ibf = &hibf.ibf_vector[ibf_idx];
        if max_elements < kmer_count as u64 {
            required_technical_bins(ibf.bin_size(), kmer_count as u64, fpr, ibf.hash_count(), max_elements)
        } else {
            1
        }
    };

    let ibf = &mut hibf.ibf_vector[ibf_idx];
    let bin_idx = probe_empty_bin(ibf, number_of_bins).unwrap_or(ibf.bin_count());
    ibf.increase_bin_number_to(bin_idx + number_of_bins);

    let bin_count = hibf.ibf_vector[ibf_idx].bin_count();
    let new_user_bin = hibf.number_of_user_bins as u64;
    hibf.next_ibf_id[ibf_idx].resize(bin_count, ibf_idx);
    hibf.ibf_bin_to_user_bin_id[ibf_idx].resize(bin_count, DELETED);
    for bin in bin_idx..bin_idx + number_of_bins {
        hibf.ibf_vector[ibf_idx].set_occupancy(bin, 1);
        hibf.next_ibf_id[ibf_idx][bin] = ibf_idx;
        hibf.ibf_bin_to_user_bin_id[ibf_idx][bin] = new_user_bin;
    }
    hibf.number_of_user_bins += 1;

    Ok(InsertLocation { ibf_idx, bin_idx, number_of_bins })
}

fn is_fpr_exceeded(
    hibf: &Hibf,
    config: &IndexConfig,
    ibf_idx: usize,
    bin_idx: usize,
    is_toplevel: bool,
) -> bool {
    let ibf = &hibf.ibf_vector[ibf_idx];
    let new_fpr = fpr_for(ibf.bin_size(), ibf.hash_count(), ibf.occupancy(bin_idx));

    let is_merged = hibf.ibf_bin_to_user_bin_id[ibf_idx][bin_idx] == MERGED;
    let target_fpr = if !is_merged {
        config.fpr
    } else {
        let relaxed = config.relaxed_fpr;
        relaxed * if is_toplevel { (relaxed * 1.25).min(relaxed.max(0.95)) } else { 1.0 }
    };

    new_fpr > target_fpr
}

/// Inserts the k-mer set into the chosen bins and into every ancestor's
/// merged bin. Returns the deepest location whose post-insert FPR breaches
/// its target.
fn insert_tb_and_parents(
    hibf: &Hibf,
    config: &IndexConfig,
    kmers: &FxHashSet<u64>,
    mut location: InsertLocation,
) -> Option<RebuildLocation> {
    let mut rebuild = None;
    loop {
        let ibf = &hibf.ibf_vector[location.ibf_idx];
        ibf.insert_split(kmers.iter(), location.bin_idx, location.number_of_bins);
        if is_fpr_exceeded(hibf, config, location.ibf_idx, location.bin_idx, false) {
            rebuild = Some(RebuildLocation { ibf_idx: location.ibf_idx, bin_idx: location.bin_idx });
        }
        if location.ibf_idx == 0 {
            break;
        }
        let parent = hibf.prev_ibf_id[location.ibf_idx];
        location =
            InsertLocation { ibf_idx: parent.ibf_idx, bin_idx: parent.bin_idx, number_of_bins: 1 };
    }
    rebuild
}

enum TmaxCheck {
    NoRebuild,
    FullRebuild,
    PartialRebuild(RebuildLocation),
}

fn check_tmax(hibf: &Hibf, config: &IndexConfig, ibf_idx: usize) -> TmaxCheck {
    if hibf.ibf_vector[ibf_idx].bin_count() > config.tmax.next_multiple_of(64) {
        if ibf_idx == 0 {
            TmaxCheck::FullRebuild
        } else {
            let parent = hibf.prev_ibf_id[ibf_idx];
            TmaxCheck::PartialRebuild(RebuildLocation {
                ibf_idx: parent.ibf_idx,
                bin_idx: parent.bin_idx,
            })
        }
    } else {
        TmaxCheck::NoRebuild
    }
}

enum Action {
    None,
    Full,
    Partial(RebuildLocation),
}

/// A rebuild must anchor at a merged bin; an FPR breach at a leaf promotes to
/// the merged bin above it.
fn normalise_rebuild_location(hibf: &Hibf, location: RebuildLocation) -> Action {
    if hibf.ibf_bin_to_user_bin_id[location.ibf_idx][location.bin_idx] == MERGED {
        return Action::Partial(location);
    }
    if location.ibf_idx == 0 {
        return Action::Full;
    }
    let parent = hibf.prev_ibf_id[location.ibf_idx];
    Action::Partial(RebuildLocation { ibf_idx: parent.ibf_idx, bin_idx: parent.bin_idx })
}

fn decide(
    hibf: &Hibf,
    config: &IndexConfig,
    rebuild_location: Option<RebuildLocation>,
    insert_location: InsertLocation,
) -> Action {
    match rebuild_location {
        Some(location) => match check_tmax(hibf, config, location.ibf_idx) {
            TmaxCheck::FullRebuild => Action::Full,
            TmaxCheck::PartialRebuild(parent) => Action::Partial(parent),
            TmaxCheck::NoRebuild => {
                if location.ibf_idx == 0 {
                    if is_fpr_exceeded(hibf, config, location.ibf_idx, location.bin_idx, true) {
                        Action::Full
                    } else {
                        Action::None
                    }
                } else {
                    normalise_rebuild_location(hibf, location)
                }
            }
        },
        None => match check_tmax(hibf, config, insert_location.ibf_idx) {
            TmaxCheck::FullRebuild => Action::Full,
            TmaxCheck::PartialRebuild(parent) => Action::Partial(parent),
            TmaxCheck::NoRebuild => Action::None,
        },
    }
}

/// Inserts one new user bin: locate or grow a slot, write the k-mers along
/// the path to the root, then resolve any rebuild trigger.
pub fn insert_user_bin(index: &mut RaptorIndex, files: Vec<PathBuf>) -> Result<InsertReport> {
    let mut hasher = MinimiserHasher::new(index.shape, index.window)?;
    let mut kmers: FxHashSet<u64> = FxHashSet::default();
    hash_sequence_files(&files, &mut hasher, |hash| {
        kmers.insert(hash);
    })?;
    ensure!(
        !kmers.is_empty(),
        "The user bin {} contains no usable sequence content.",
        files[0].display()
    );

    let max_sizes = max_ibf_sizes(index.hibf()?, &index.config);
    let insert_location = get_location(&max_sizes, kmers.len(), index)?;
    index.bin_path.push(files);
    let user_bin = index.bin_path.len() - 1;

    let action = {
        let hibf = index.hibf()?;
        let rebuild_location = insert_tb_and_parents(hibf, &index.config, &kmers, insert_location);
        decide(hibf, &index.config, rebuild_location, insert_location)
    };

    let rebuild = match action {
        Action::None => None,
        Action::Full => {
            full_rebuild(index)?;
            Some(RebuildKind::Full)
        }
        Action::Partial(location) => match partial_rebuild(index, location) {
            Ok(()) => Some(RebuildKind::Partial { ibf_idx: location.ibf_idx, bin_idx: location.bin_idx }),
            Err(error) => {
                // A failed partial rebuild promotes to a full rebuild.
                eprintln!("Warning: partial rebuild failed ({error:#}), performing a full rebuild.");
                full_rebuild(index)?;
                Some(RebuildKind::Full)
            }
        },
    };

    Ok(InsertReport { user_bin, rebuild })
}

/// Rebuilds the subtree behind one merged bin and splices it back into the
/// arena: the new root takes the old child's slot, every other new IBF is
/// appended with an index offset, and the displaced IBFs become tombstones.
fn partial_rebuild(index: &mut RaptorIndex, location: RebuildLocation) -> Result<()> {
    let (child_ibf_id, user_bins, displaced) = {
        let hibf = index.hibf()?;
        ensure!(
            hibf.ibf_bin_to_user_bin_id[location.ibf_idx][location.bin_idx] == MERGED,
            "Partial rebuild requires a merged bin."
        );
        let child = hibf.next_ibf_id[location.ibf_idx][location.bin_idx];
        let mut user_bins = Vec::new();
        hibf.user_bins_below(child, &mut user_bins);
        user_bins.sort_unstable();
        user_bins.dedup();
        let mut displaced = Vec::new();
        hibf.ibfs_below(child, &mut displaced);
        (child, user_bins, displaced)
    };
    ensure!(!user_bins.is_empty(), "The merged bin routes to no user bins.");

    let shape = index.shape;
    let window = index.window;
    let kmer_sets: Vec<FxHashSet<u64>> = user_bins
        .par_iter()
        .map(|&user_bin| -> Result<FxHashSet<u64>> {
            let mut hasher = MinimiserHasher::new(shape, window)?;
            let mut set = FxHashSet::default();
            hash_sequence_files(&index.bin_path[user_bin as usize], &mut hasher, |hash| {
                set.insert(hash);
            })?;
            Ok(set)
        })
        .collect::<Result<Vec<_>>>()?;

    let cardinalities: Vec<(usize, u64)> =
        kmer_sets.iter().enumerate().map(|(local, set)| (local, set.len() as u64)).collect();
    let sub_root = plan(&cardinalities, index.config.tmax);
    let hash_count = index.hibf()?.hash_count();
    let input_fn = |local: usize, out: &mut FxHashSet<u64>| -> Result<()> {
        out.extend(kmer_sets[local].iter().copied());
        Ok(())
    };
    let subindex = build_hibf(&sub_root, user_bins.len(), hash_count, &index.config, &input_fn)?;

    let hibf = index.hibf_mut()?;
    let offset = hibf.ibf_vector.len() - 1;

    for &ibf_id in &displaced[1..] {
        hibf.ibf_vector[ibf_id] = Ibf::tombstone();
        hibf.next_ibf_id[ibf_id].clear();
        hibf.prev_ibf_id[ibf_id] = PrevId::DELETED;
        hibf.ibf_bin_to_user_bin_id[ibf_id].clear();
    }

    let Hibf {
        ibf_vector: mut sub_ibfs,
        next_ibf_id: mut sub_next,
        prev_ibf_id: sub_prev,
        ibf_bin_to_user_bin_id: mut sub_user_bins,
        ..
    } = subindex;

    let translate_user_bin = |id: &mut u64| {
        if *id != MERGED && *id != DELETED {
            *id = user_bins[*id as usize];
        }
    };

    // The sub-root replaces the old child IBF in place; its parent link stays.
    hibf.ibf_vector[child_ibf_id] = std::mem::replace(&mut sub_ibfs[0], Ibf::tombstone());
    let mut first_next = std::mem::take(&mut sub_next[0]);
    for id in &mut first_next {
        *id = if *id == 0 { child_ibf_id } else { *id + offset };
    }
    hibf.next_ibf_id[child_ibf_id] = first_next;
    let mut first_user_bins = std::mem::take(&mut sub_user_bins[0]);
    first_user_bins.iter_mut().for_each(translate_user_bin);
    hibf.ibf_bin_to_user_bin_id[child_ibf_id] = first_user_bins;

    for i in 1..sub_ibfs.len() {
        hibf.ibf_vector.push(std::mem::replace(&mut sub_ibfs[i], Ibf::tombstone()));

        let mut next = std::mem::take(&mut sub_next[i]);
        for id in &mut next {
            *id += offset;
        }
        hibf.next_ibf_id.push(next);

        let mut bins = std::mem::take(&mut sub_user_bins[i]);
        bins.iter_mut().for_each(translate_user_bin);
        hibf.ibf_bin_to_user_bin_id.push(bins);

        let mut prev = sub_prev[i];
        if prev.ibf_idx == 0 {
            prev.ibf_idx = child_ibf_id;
        } else {
            prev.ibf_idx += offset;
        }
        hibf.prev_ibf_id.push(prev);
    }

    Ok(())
}

/// Re-plans the layout over every current user bin and swaps in a freshly
/// built HIBF. User-bin identities are retained.
fn full_rebuild(index: &mut RaptorIndex) -> Result<()> {
    let shape = index.shape;
    let window = index.window;
    let hash_count = index.hibf()?.hash_count();

    let cardinalities: Vec<(usize, u64)> = index
        .bin_path
        .par_iter()
        .enumerate()
        .map(|(user_bin, files)| -> Result<(usize, u64)> {
            let mut hasher = MinimiserHasher::new(shape, window)?;
            let mut set = FxHashSet::default();
            hash_sequence_files(files, &mut hasher, |hash| {
                set.insert(hash);
            })?;
            Ok((user_bin, set.len() as u64))
        })
        .collect::<Result<Vec<_>>>()?;

    let root = plan(&cardinalities, index.config.tmax);
    let bin_path = index.bin_path.clone();
    let input_fn = |user_bin: usize, out: &mut FxHashSet<u64>| -> Result<()> {
        let mut hasher = MinimiserHasher::new(shape, window)?;
        hash_sequence_files(&bin_path[user_bin], &mut hasher, |hash| {
            out.insert(hash);
        })?;
        Ok(())
    };
    let hibf = build_hibf(&root, index.bin_path.len(), hash_count, &index.config, &input_fn)?;
    index.structure = IndexStructure::Hibf(hibf);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_bins_grow_with_content() {
        let bin_size = crate::ibf::bin_size_for(100, 2, 0.05);
        let max = max_elements_for(bin_size, 2, 0.05);
        assert_eq!(required_technical_bins(bin_size, max, 0.05, 2, max), 1);
        let split = required_technical_bins(bin_size, max * 10, 0.05, 2, max);
        assert!(split >= 10);
    }

    #[test]
    fn probing_respects_padding() {
        let ibf = Ibf::new(10, 128, 2).unwrap();
        // Entirely empty: run starts at 0.
        assert_eq!(probe_empty_bin(&ibf, 3), Some(0));
        for bin in 0..10 {
            ibf.set_occupancy(bin, 5);
        }
        // No empty run, but padding leaves room up to 64 bins.
        assert_eq!(probe_empty_bin(&ibf, 54), Some(10));
        assert_eq!(probe_empty_bin(&ibf, 55), None);
    }

    #[test]
    fn fpr_check_distinguishes_merged_bins() {
        let ibf = Ibf::new(2, 64, 2).unwrap();
        // Overfill bin 0 far beyond what 64 bits can hold.
        ibf.set_occupancy(0, 1000);
        ibf.set_occupancy(1, 1000);
        let hibf = Hibf {
            ibf_vector: vec![ibf],
            next_ibf_id: vec![vec![0, 0]],
            prev_ibf_id: vec![PrevId::ROOT],
            ibf_bin_to_user_bin_id: vec![vec![0, MERGED]],
            number_of_user_bins: 1,
        };
        let config = IndexConfig::default();
        assert!(is_fpr_exceeded(&hibf, &config, 0, 0, false));
        assert!(is_fpr_exceeded(&hibf, &config, 0, 1, false));
        // An empty bin never exceeds.
        let fresh = Ibf::new(1, 1024, 2).unwrap();
        let hibf = Hibf {
            ibf_vector: vec![fresh],
            next_ibf_id: vec![vec![0]],
            prev_ibf_id: vec![PrevId::ROOT],
            ibf_bin_to_user_bin_id: vec![vec![0]],
            number_of_user_bins: 1,
        };
        assert!(!is_fpr_exceeded(&hibf, &config, 0, 0, false));
    }
}
