//! Property-based tests for the subnet configuration space.

use proptest::prelude::*;

use ofanas_core::SpaceConfig;
use ofanas_ml::{CandidateSpace, Choice, SweepDims, TrainingStage, subnet_seed};

fn space() -> CandidateSpace {
    CandidateSpace::from(&SpaceConfig::default())
}

proptest! {
    #[test]
    fn same_step_and_slot_sample_the_same_subnet(
        epoch in 0usize..200,
        n_batches in 1usize..5000,
        batch in 0usize..5000,
        slot in 0usize..16,
    ) {
        let seed = subnet_seed(epoch, n_batches, batch, slot);
        prop_assert_eq!(space().sample(seed), space().sample(seed));
    }

    #[test]
    fn sampled_subnets_stay_in_space(seed in any::<u64>()) {
        let space = space();
        prop_assert!(space.validate(&space.sample(seed)).is_ok());
    }

    #[test]
    fn stage_spaces_only_sample_unlocked_dimensions(seed in any::<u64>()) {
        let full = space();
        let stage_space = TrainingStage::ElasticDepth.training_space(&full);
        let setting = stage_space.sample(seed);
        prop_assert!(full.validate(&setting).is_ok());
        prop_assert_eq!(setting.expand_ratio, Choice::Uniform(8.0));
        prop_assert_eq!(setting.scale, Some(4));
    }

    #[test]
    fn enumeration_size_is_the_product(
        depths in prop::collection::btree_set(1u32..8, 1..4),
        kernels in prop::collection::btree_set(1u32..10, 1..4),
    ) {
        let depths: Vec<u32> = depths.into_iter().collect();
        let kernels: Vec<u32> = kernels.into_iter().collect();
        let dims = SweepDims {
            depths: Some(depths.clone()),
            kernel_sizes: Some(kernels.clone()),
            ..SweepDims::default()
        };
        let settings = space().enumerate(&dims);
        prop_assert_eq!(settings.len(), depths.len() * kernels.len() * 4 * 3);
    }

    #[test]
    fn distinct_slots_get_distinct_seeds(step in 0usize..10_000, a in 0usize..1000, b in 0usize..1000) {
        prop_assume!(a != b);
        prop_assert_ne!(subnet_seed(0, 10_000, step, a), subnet_seed(0, 10_000, step, b));
    }
}
