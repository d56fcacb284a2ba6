use crate::ibf::{Counter, Ibf, bulk_count_into};
use serde::{Deserialize, Serialize};

pub mod build;
pub mod layout;

/// Sentinel user-bin id of a merged technical bin: the bin routes into a
/// lower-level IBF instead of naming a user bin.
pub const MERGED: u64 = u64::MAX;
/// Sentinel user-bin id of a tombstoned technical bin.
pub const DELETED: u64 = u64::MAX - 1;

/// Parent link of an IBF in the arena: the parent IBF and the merged bin
/// inside it. The root links to itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrevId {
    pub ibf_idx: usize,
    pub bin_idx: usize,
}

impl PrevId {
    pub const ROOT: PrevId = PrevId { ibf_idx: 0, bin_idx: 0 };
    pub const DELETED: PrevId = PrevId { ibf_idx: usize::MAX, bin_idx: usize::MAX };
}

/// Hierarchical interleaved Bloom filter.
///
/// The tree is an arena of parallel index vectors; no IBF owns another.
/// `next_ibf_id[i][b]` is the child IBF behind merged bin `b` of IBF `i` and
/// equals `i` exactly when the bin is a leaf. `prev_ibf_id[i]` walks upward
/// and reaches the root (index 0) in finitely many steps.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Hibf {
    pub ibf_vector: Vec<Ibf>,
    pub next_ibf_id: Vec<Vec<usize>>,
    pub prev_ibf_id: Vec<PrevId>,
    pub ibf_bin_to_user_bin_id: Vec<Vec<u64>>,
    pub number_of_user_bins: usize,
}

impl Hibf {
    pub fn hash_count(&self) -> usize {
        self.ibf_vector[0].hash_count()
    }

    /// All user-bin ids reachable from the subtree rooted at `ibf_idx`,
    /// following merged bins and skipping tombstones.
    pub fn user_bins_below(&self, ibf_idx: usize, out: &mut Vec<u64>) {
        for (bin, &user_bin) in self.ibf_bin_to_user_bin_id[ibf_idx].iter().enumerate() {
            match user_bin {
                MERGED => self.user_bins_below(self.next_ibf_id[ibf_idx][bin], out),
                DELETED => {}
                id => out.push(id),
            }
        }
    }

    /// All IBF indices in the subtree rooted at `ibf_idx`, the root of the
    /// subtree first.
    pub fn ibfs_below(&self, ibf_idx: usize, out: &mut Vec<usize>) {
        out.push(ibf_idx);
        for (bin, &user_bin) in self.ibf_bin_to_user_bin_id[ibf_idx].iter().enumerate() {
            if user_bin == MERGED {
                self.ibfs_below(self.next_ibf_id[ibf_idx][bin], out);
            }
        }
    }

    pub fn membership_agent(&self) -> HibfMembershipAgent<'_> {
        HibfMembershipAgent { hibf: self, result: Vec::new(), count_pool: Vec::new() }
    }
}

/// Walks the tree top-down for one query. Holds one counter vector per depth
/// so repeated queries run allocation-free.
pub struct HibfMembershipAgent<'a> {
    hibf: &'a Hibf,
    result: Vec<u64>,
    count_pool: Vec<Vec<u16>>,
}

impl<'a> HibfMembershipAgent<'a> {
    /// User bins whose (split-merged) count reaches the threshold, in
    /// increasing user-bin order.
    pub fn membership_for(&mut self, values: &[u64], threshold: usize) -> &[u64] {
        self.result.clear();
        self.walk(0, 0, values, threshold);
        self.result.sort_unstable();
        self.result.dedup();
        &self.result
    }

    fn walk(&mut self, ibf_idx: usize, depth: usize, values: &[u64], threshold: usize) {
        if depth == self.count_pool.len() {
            self.count_pool.push(Vec::new());
        }
        let mut counts = std::mem::take(&mut self.count_pool[depth]);
        let ibf = &self.hibf.ibf_vector[ibf_idx];
        bulk_count_into(ibf, values, &mut counts);

        let user_bins = &self.hibf.ibf_bin_to_user_bin_id[ibf_idx];
        let bin_count = ibf.bin_count();
        let mut bin = 0;
        while bin < bin_count {
            match user_bins[bin] {
                DELETED => bin += 1,
                MERGED => {
                    if counts[bin].as_usize() >= threshold {
                        self.walk(self.hibf.next_ibf_id[ibf_idx][bin], depth + 1, values, threshold);
                    }
                    bin += 1;
                }
                user_bin => {
                    // A split user bin occupies consecutive bins; its count is
                    // the union over the whole range.
                    let mut sum = 0usize;
                    while bin < bin_count && user_bins[bin] == user_bin {
                        sum += counts[bin].as_usize();
                        bin += 1;
                    }
                    if sum >= threshold {
                        self.result.push(user_bin);
                    }
                }
            }
        }

        self.count_pool[depth] = counts;
    }
}
