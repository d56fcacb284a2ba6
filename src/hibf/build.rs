use crate::hibf::layout::LayoutNode;
use crate::hibf::{DELETED, Hibf, MERGED, PrevId};
use crate::ibf::{Ibf, bin_size_for};
use crate::index::IndexConfig;
use anyhow::{Result, ensure};
use rustc_hash::FxHashSet;

/// Produces the k-mer set of one user bin. The hierarchical build is agnostic
/// to where the k-mers come from (sequence files, minimiser files, or cached
/// sets during a rebuild).
pub type InputFn<'a> = dyn Fn(usize, &mut FxHashSet<u64>) -> Result<()> + Sync + 'a;

struct BuildData<'a> {
    hibf: Hibf,
    next_free_slot: usize,
    hash_count: usize,
    config: &'a IndexConfig,
    input_fn: &'a InputFn<'a>,
}

impl<'a> BuildData<'a> {
    fn alloc_slot(&mut self) -> usize {
        let slot = self.next_free_slot;
        self.next_free_slot += 1;
        slot
    }
}

/// Bottom-up construction of an HIBF from a layout tree.
///
/// Every node sizes its IBF from the k-mer content of its max bin, builds the
/// favourite child first so that sizing sees the merged content, and hands
/// the union of everything it inserted up to the parent's merged bin.
pub fn build_hibf(
    root: &LayoutNode,
    number_of_user_bins: usize,
    hash_count: usize,
    config: &IndexConfig,
    input_fn: &InputFn<'_>,
) -> Result<Hibf> {
    ensure!(number_of_user_bins > 0, "Cannot build an index over an empty bin list.");
    let node_count = root.node_count();
    let mut data = BuildData {
        hibf: Hibf {
            ibf_vector: (0..node_count).map(|_| Ibf::tombstone()).collect(),
            next_ibf_id: vec![Vec::new(); node_count],
            prev_ibf_id: vec![PrevId::ROOT; node_count],
            ibf_bin_to_user_bin_id: vec![Vec::new(); node_count],
            number_of_user_bins,
        },
        next_free_slot: 0,
        hash_count,
        config,
        input_fn,
    };

    build_node(root, &mut data, None, true)?;
    Ok(data.hibf)
}

fn build_node(
    node: &LayoutNode,
    data: &mut BuildData<'_>,
    parent_kmers: Option<&mut FxHashSet<u64>>,
    is_root: bool,
) -> Result<usize> {
    let ibf_pos = data.alloc_slot();
    let technical_bins = node.technical_bins;
    let mut next_ids = vec![ibf_pos; technical_bins];
    let mut user_bin_ids = vec![DELETED; technical_bins];

    let mut kmers: FxHashSet<u64> = FxHashSet::default();
    let mut union_kmers: FxHashSet<u64> = FxHashSet::default();
    let collect_union = parent_kmers.is_some();

    // The max bin determines the bin size. If it is a merged bin, its child
    // subtree is built first and its union is the max bin's content.
    let favourite_child = node.children.iter().position(|(bin, _)| *bin == node.max_bin_id);
    let mut records: Vec<_> = node.records.iter().collect();
    let mut max_bin_split = 1usize;
    let mut first_record_is_max = false;

    if let Some(child_index) = favourite_child {
        let (bin, child) = &node.children[child_index];
        let child_pos = build_node(child, data, Some(&mut kmers), false)?;
        next_ids[*bin] = child_pos;
        user_bin_ids[*bin] = MERGED;
        data.hibf.prev_ibf_id[child_pos] = PrevId { ibf_idx: ibf_pos, bin_idx: *bin };
    } else {
        if let Some(position) = records.iter().position(|r| r.bin_index == node.max_bin_id) {
            records.swap(0, position);
        }
        ensure!(!records.is_empty(), "The layout contains an IBF node without content.");
        (data.input_fn)(records[0].user_bin, &mut kmers)?;
        max_bin_split = records[0].number_of_bins;
        first_record_is_max = true;
    }

    // Merged bins hold union content, so they tolerate the relaxed FPR; at
    // the top level the relaxed target is tightened again.
    let target_fpr = if favourite_child.is_some() {
        let relaxed = data.config.relaxed_fpr;
        if is_root {
            relaxed * (relaxed * 1.25).min(relaxed.max(0.95))
        } else {
            relaxed
        }
    } else {
        data.config.fpr
    };
    let elements_per_bin = (kmers.len() / max_bin_split + 1) as u64;
    let bin_size = bin_size_for(elements_per_bin, data.hash_count, target_fpr);
    let ibf = Ibf::new(technical_bins, bin_size, data.hash_count)?;

    // Place the max bin's content.
    if favourite_child.is_some() {
        ibf.insert_split(kmers.iter(), node.max_bin_id, 1);
    } else {
        let record = records[0];
        ibf.insert_split(kmers.iter(), record.bin_index, record.number_of_bins);
        for bin in record.bin_index..record.bin_index + record.number_of_bins {
            user_bin_ids[bin] = record.user_bin as u64;
        }
    }
    if collect_union {
        union_kmers.extend(kmers.drain());
    } else {
        kmers.clear();
    }

    // Remaining merged bins.
    for (child_index, (bin, child)) in node.children.iter().enumerate() {
        if Some(child_index) == favourite_child {
            continue;
        }
        let child_pos = build_node(child, data, Some(&mut kmers), false)?;
        ibf.insert_split(kmers.iter(), *bin, 1);
        next_ids[*bin] = child_pos;
        user_bin_ids[*bin] = MERGED;
        data.hibf.prev_ibf_id[child_pos] = PrevId { ibf_idx: ibf_pos, bin_idx: *bin };
        if collect_union {
            union_kmers.extend(kmers.drain());
        } else {
            kmers.clear();
        }
    }

    // Remaining records; splits go across consecutive bins.
    let start = usize::from(first_record_is_max);
    for record in &records[start..] {
        (data.input_fn)(record.user_bin, &mut kmers)?;
        ibf.insert_split(kmers.iter(), record.bin_index, record.number_of_bins);
        for bin in record.bin_index..record.bin_index + record.number_of_bins {
            user_bin_ids[bin] = record.user_bin as u64;
        }
        if collect_union {
            union_kmers.extend(kmers.drain());
        } else {
            kmers.clear();
        }
    }

    data.hibf.ibf_vector[ibf_pos] = ibf;
    data.hibf.next_ibf_id[ibf_pos] = next_ids;
    data.hibf.ibf_bin_to_user_bin_id[ibf_pos] = user_bin_ids;

    if let Some(parent) = parent_kmers {
        parent.extend(union_kmers);
    }

    Ok(ibf_pos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hibf::layout::plan;
    use crate::index::IndexConfig;

    fn synthetic_content(user_bin: usize) -> Vec<u64> {
        (0..50u64).map(|i| (user_bin as u64) << 32 | i * 13 + 1).collect()
    }

    fn build_synthetic(user_bins: usize, tmax: usize) -> Hibf {
        let cardinalities: Vec<(usize, u64)> =
            (0..user_bins).map(|u| (u, synthetic_content(u).len() as u64)).collect();
        let root = plan(&cardinalities, tmax);
        let config = IndexConfig { tmax, ..IndexConfig::default() };
        let input_fn = |user_bin: usize, kmers: &mut FxHashSet<u64>| -> Result<()> {
            kmers.extend(synthetic_content(user_bin));
            Ok(())
        };
        build_hibf(&root, user_bins, 2, &config, &input_fn).unwrap()
    }

    #[test]
    fn root_is_slot_zero_and_parents_resolve() {
        let hibf = build_synthetic(20, 4);
        assert!(hibf.ibf_vector.len() > 1);
        assert_eq!(hibf.prev_ibf_id[0], PrevId::ROOT);
        for ibf_idx in 1..hibf.ibf_vector.len() {
            // Walking up reaches the root in finitely many steps.
            let mut current = ibf_idx;
            let mut steps = 0;
            while current != 0 {
                let parent = hibf.prev_ibf_id[current];
                assert_eq!(hibf.next_ibf_id[parent.ibf_idx][parent.bin_idx], current);
                assert_eq!(hibf.ibf_bin_to_user_bin_id[parent.ibf_idx][parent.bin_idx], MERGED);
                current = parent.ibf_idx;
                steps += 1;
                assert!(steps <= hibf.ibf_vector.len());
            }
        }
    }

    #[test]
    fn every_user_bin_is_reachable() {
        let hibf = build_synthetic(20, 4);
        let mut user_bins = Vec::new();
        hibf.user_bins_below(0, &mut user_bins);
        user_bins.sort_unstable();
        assert_eq!(user_bins, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn downward_consistency_holds() {
        // Every k-mer of a user bin is present in each merged bin on the path
        // from the root to the user bin's leaf.
        let hibf = build_synthetic(20, 4);
        for user_bin in 0..20usize {
            // locate the leaf
            let mut location = None;
            'outer: for ibf_idx in 0..hibf.ibf_vector.len() {
                for (bin, &id) in hibf.ibf_bin_to_user_bin_id[ibf_idx].iter().enumerate() {
                    if id == user_bin as u64 {
                        location = Some((ibf_idx, bin));
                        break 'outer;
                    }
                }
            }
            let (mut ibf_idx, mut bin) = location.expect("user bin must be placed");
            loop {
                let ibf = &hibf.ibf_vector[ibf_idx];
                for value in synthetic_content(user_bin) {
                    assert!(ibf.contains(value, bin), "user bin {user_bin} at ibf {ibf_idx}");
                }
                if ibf_idx == 0 {
                    break;
                }
                let parent = hibf.prev_ibf_id[ibf_idx];
                ibf_idx = parent.ibf_idx;
                bin = parent.bin_idx;
            }
        }
    }

    #[test]
    fn queries_hit_their_user_bin() {
        let hibf = build_synthetic(30, 4);
        let mut agent = hibf.membership_agent();
        for user_bin in 0..30usize {
            let values = synthetic_content(user_bin);
            let hits = agent.membership_for(&values, values.len());
            assert_eq!(hits, &[user_bin as u64]);
        }
    }
}
