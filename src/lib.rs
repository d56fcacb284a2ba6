// src/lib.rs
pub mod build;
pub mod hash;
pub mod hibf;
pub mod ibf;
pub mod index;
pub mod prepare;
pub mod search;
pub mod threshold;
pub mod update;
pub mod utils;

pub use hash::{MinimiserHasher, Shape, adjust_seed};
pub use hibf::{Hibf, HibfMembershipAgent};
pub use ibf::{CountingAgent, Ibf, MembershipAgent};
pub use index::{IndexConfig, IndexStructure, RaptorIndex};
pub use threshold::{ThresholdParams, Thresholder};
pub use utils::partition::PartitionConfig;
