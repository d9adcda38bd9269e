//! Feature-range sharding of a federated boosting party
//!
//! This crate provides:
//! - **Shard planning** from a configurable sample/feature-count policy
//! - **Phase splitting** of each training request across shards, including
//!   contiguous slices of a new tree's encrypted gradients
//! - **Response merging** per phase (concatenate, max gain, first owner)
//! - **Sharded execution** with partial-sum exchange and state sync between shards
//!
//! # Example
//!
//! ```rust
//! use fedgb_core::DistributionPolicy;
//! use fedgb_shard::{split_list, ShardPlanner};
//!
//! // 1,000 samples and 7 features: two features per shard
//! let policy = DistributionPolicy::default();
//! assert_eq!(policy.shard_count(1_000, 7), 4);
//!
//! // The first shards take the remainder
//! let parts = split_list(&[1, 2, 3, 4, 5, 6, 7], 4);
//! assert_eq!(parts, vec![vec![1, 2], vec![3, 4], vec![5, 6], vec![7]]);
//!
//! let planner = ShardPlanner::new(policy).with_shard_count(4);
//! assert_eq!(planner.shard_count(), 4);
//! ```

mod executor;
mod split;

pub use executor::ShardedParty;
pub use split::{
    partition_ranges, pending_instances, split_gh, split_list, ReduceStrategy, ShardPlanner,
    SplitResult,
};

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Pieces keep order and never differ in size by more than one
        #[test]
        fn prop_split_list_is_balanced(len in 0usize..200, parts in 1usize..20) {
            let items: Vec<usize> = (0..len).collect();
            let pieces = split_list(&items, parts);
            prop_assert_eq!(pieces.len(), parts);

            let flat: Vec<usize> = pieces.iter().flatten().copied().collect();
            prop_assert_eq!(flat, items);

            let sizes: Vec<usize> = pieces.iter().map(Vec::len).collect();
            let max = sizes.iter().max().copied().unwrap_or(0);
            let min = sizes.iter().min().copied().unwrap_or(0);
            prop_assert!(max - min <= 1);
            prop_assert!(sizes.windows(2).all(|w| w[0] >= w[1]));
        }
    }
}
