use anyhow::{Result, ensure};

/// Deterministic hash-to-partition mapping shared by build and search.
///
/// With `P` parts (a power of two), the `4^s` smallest power of four with
/// `4^s >= P` defines the suffix space; each part owns `4^s / P` consecutive
/// 2-bit suffixes. A minimiser belongs to exactly one part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionConfig {
    pub parts: u32,
    mask: u64,
    association: Vec<u32>,
}

impl PartitionConfig {
    pub fn new(parts: u32) -> Result<Self> {
        ensure!(parts >= 1 && parts.is_power_of_two(), "The number of parts must be a power of two.");
        if parts == 1 {
            return Ok(PartitionConfig { parts, mask: 0, association: vec![0] });
        }

        let mut suffixes = 4u32;
        while suffixes < parts {
            suffixes *= 4;
        }
        let suffixes_per_part = suffixes / parts;
        let association = (0..suffixes).map(|suffix| suffix / suffixes_per_part).collect();

        Ok(PartitionConfig { parts, mask: u64::from(suffixes - 1), association })
    }

    #[inline]
    pub fn partition(&self, hash: u64) -> u32 {
        self.association[(hash & self.mask) as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_power_of_two_is_rejected() {
        assert!(PartitionConfig::new(3).is_err());
        assert!(PartitionConfig::new(0).is_err());
        assert!(PartitionConfig::new(6).is_err());
    }

    #[test]
    fn two_parts_use_the_fixed_grouping() {
        // {0,1} -> part 0, {2,3} -> part 1
        let config = PartitionConfig::new(2).unwrap();
        assert_eq!(config.partition(0), 0);
        assert_eq!(config.partition(1), 0);
        assert_eq!(config.partition(2), 1);
        assert_eq!(config.partition(3), 1);
        assert_eq!(config.partition(4), 0);
    }

    #[test]
    fn four_parts_map_one_to_one() {
        let config = PartitionConfig::new(4).unwrap();
        for suffix in 0..4u64 {
            assert_eq!(config.partition(suffix), suffix as u32);
        }
    }

    #[test]
    fn every_hash_belongs_to_exactly_one_part() {
        for parts in [1u32, 2, 4, 8, 16] {
            let config = PartitionConfig::new(parts).unwrap();
            for hash in 0..4096u64 {
                let part = config.partition(hash.wrapping_mul(0x9E3779B97F4A7C15));
                assert!(part < parts);
            }
            // Parts cover the suffix space evenly.
            let mut owners = vec![0usize; parts as usize];
            let suffixes = config.mask + 1;
            if parts > 1 {
                for suffix in 0..suffixes {
                    owners[config.partition(suffix) as usize] += 1;
                }
                assert!(owners.iter().all(|&n| n as u64 == suffixes / u64::from(parts)));
            }
        }
    }
}
