//! Stage entry points of progressive shrinking.
//!
//! Every elastic stage warm-starts from the previous stage's checkpoint
//! when it begins at epoch 0, narrows the validation sweep, and hands a
//! stage-specific validation closure to [`train`].

use std::fmt::Debug;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use ofanas_core::TrainTask;

use super::epoch::{train, train_as};
use super::run_manager::RunManager;
use super::stage::TrainingStage;
use crate::error::MlError;
use crate::network::{Supernet, TrainingHarness};
use crate::space::{CandidateSpace, SweepDims};
use crate::sweep;

/// Run one stage to completion. Returns the best validation EPE.
pub fn run_stage<H: TrainingHarness>(
    stage: TrainingStage,
    rm: &mut RunManager<H>,
    dims: &mut SweepDims,
) -> Result<f64, MlError> {
    info!(%stage, run = %rm.config.name, "Entering training stage");
    match stage {
        TrainingStage::Full => train_full(rm, dims),
        TrainingStage::ElasticDepth => train_elastic_depth(rm, dims),
        TrainingStage::ElasticExpand => train_elastic_expand(rm, dims),
        TrainingStage::ElasticScale => train_elastic_scale(rm, dims),
        TrainingStage::ElasticWidth => train_elastic_width_mult(rm, dims),
    }
}

/// Train the full-size network, one pass per batch whatever the configured
/// task. There is no earlier stage to load from.
pub fn train_full<H: TrainingHarness>(
    rm: &mut RunManager<H>,
    dims: &mut SweepDims,
) -> Result<f64, MlError> {
    if rm.config.task != TrainTask::Large {
        debug!(task = ?rm.config.task, "Full stage trains the full-size network only");
    }
    let dims = dims.clone();
    train_as(rm, TrainTask::Large, move |rm, epoch, is_test| {
        sweep::validate(rm, epoch, is_test, &dims)
    })
}

pub fn train_elastic_depth<H: TrainingHarness>(
    rm: &mut RunManager<H>,
    dims: &mut SweepDims,
) -> Result<f64, MlError> {
    let stages = descending(&rm.space.depths);
    let current = current_stage(&stages);

    if rm.start_epoch == 0 {
        warm_start(rm)?;
    }
    stage_banner(rm, "Depth", &stages, current);

    narrow_sweep(TrainingStage::ElasticDepth, &rm.space, dims)?;
    train_with_sweep(rm, dims)
}

pub fn train_elastic_expand<H: TrainingHarness>(
    rm: &mut RunManager<H>,
    dims: &mut SweepDims,
) -> Result<f64, MlError> {
    let stages = descending(&rm.space.expand_ratios);
    let current = current_stage(&stages);

    if rm.start_epoch == 0 {
        warm_start(rm)?;
        rm.harness
            .network_mut()
            .re_organize_middle_weights(current)?;
    }
    stage_banner(rm, "Expand Ratio", &stages, current);

    narrow_sweep(TrainingStage::ElasticExpand, &rm.space, dims)?;
    train_with_sweep(rm, dims)
}

pub fn train_elastic_scale<H: TrainingHarness>(
    rm: &mut RunManager<H>,
    dims: &mut SweepDims,
) -> Result<f64, MlError> {
    if rm.space.scales.is_empty() {
        return Err(MlError::invalid_setting("network has no elastic scale"));
    }
    let stages = descending(&rm.space.scales);
    let current = current_stage(&stages);

    if rm.start_epoch == 0 {
        warm_start(rm)?;
    }
    stage_banner(rm, "Scale", &stages, current);

    narrow_sweep(TrainingStage::ElasticScale, &rm.space, dims)?;
    train_with_sweep(rm, dims)
}

/// Width stage. On the first width stage the middle and outer weights are
/// reorganized once; failure of the outer step is logged and ignored.
pub fn train_elastic_width_mult<H: TrainingHarness>(
    rm: &mut RunManager<H>,
    dims: &mut SweepDims,
) -> Result<f64, MlError> {
    if rm.space.width_mults.is_empty() {
        return Err(MlError::invalid_setting("network has no elastic width"));
    }
    let stages = descending(&rm.space.width_mults);
    let current = current_stage(&stages);

    if rm.start_epoch == 0 {
        warm_start(rm)?;
        if current == 0 {
            let expand_stage = rm.space.expand_ratios.len().saturating_sub(1);
            rm.harness
                .network_mut()
                .re_organize_middle_weights(expand_stage)?;
            rm.write_log(
                &format!("reorganize_middle_weights (expand_ratio_stage={expand_stage})"),
                "valid",
                true,
            );
            match rm.harness.network_mut().re_organize_outer_weights() {
                Ok(()) => rm.write_log("reorganize_outer_weights", "valid", true),
                Err(e) => warn!(error = %e, "Skipping outer weight reorganization"),
            }
        }
        let test = sweep::validate(rm, 0, true, dims)?;
        rm.write_log(
            &format!("{:.3}\t{:.3}\t{:.3}\t{}", test.loss, test.epe, test.d1, test.log),
            "valid",
            true,
        );
    }
    stage_banner(rm, "Width Mult", &stages, current);

    narrow_sweep(TrainingStage::ElasticWidth, &rm.space, dims)?;
    train_with_sweep(rm, dims)
}

/// Restrict the validation sweep of `stage` to the dimension it unlocks.
///
/// The unlocked dimension is swept over every candidate when all other
/// dimensions of `space` are fixed, and over its extremes otherwise. Width
/// is always checked at the narrowest and widest multiplier.
pub fn narrow_sweep(
    stage: TrainingStage,
    space: &CandidateSpace,
    dims: &mut SweepDims,
) -> Result<(), MlError> {
    match stage {
        TrainingStage::Full => {}
        TrainingStage::ElasticDepth => {
            let fixed = is_uniform(&space.kernel_sizes) && is_uniform(&space.expand_ratios);
            dims.depths = Some(pick(descending(&space.depths), fixed));
        }
        TrainingStage::ElasticExpand => {
            let fixed = is_uniform(&space.kernel_sizes) && is_uniform(&space.depths);
            dims.expand_ratios = Some(pick(descending(&space.expand_ratios), fixed));
        }
        TrainingStage::ElasticScale => {
            if space.scales.is_empty() {
                return Err(MlError::invalid_setting("network has no elastic scale"));
            }
            let fixed = is_uniform(&space.kernel_sizes)
                && is_uniform(&space.depths)
                && is_uniform(&space.expand_ratios);
            dims.scales = Some(pick(descending(&space.scales), fixed));
        }
        TrainingStage::ElasticWidth => {
            if space.width_mults.is_empty() {
                return Err(MlError::invalid_setting("network has no elastic width"));
            }
            let widest = space.width_mults.len() - 1;
            dims.width_mults = Some(if widest == 0 { vec![0] } else { vec![0, widest] });
        }
    }
    Ok(())
}

fn train_with_sweep<H: TrainingHarness>(
    rm: &mut RunManager<H>,
    dims: &SweepDims,
) -> Result<f64, MlError> {
    let dims = dims.clone();
    train(rm, move |rm, epoch, is_test| {
        sweep::validate(rm, epoch, is_test, &dims)
    })
}

fn warm_start<H: TrainingHarness>(rm: &mut RunManager<H>) -> Result<(), MlError> {
    let path: PathBuf = rm.config.ofa_checkpoint_path.clone().ok_or_else(|| {
        MlError::Config("ofa_checkpoint_path is required to start an elastic stage".to_string())
    })?;
    rm.load_models(&path)
}

fn stage_banner<H: TrainingHarness, T: Debug>(
    rm: &RunManager<H>,
    dimension: &str,
    stages: &[T],
    current: usize,
) {
    let rule = "-".repeat(30);
    let before = &stages[..(current + 1).min(stages.len())];
    let after = &stages[..(current + 2).min(stages.len())];
    rm.write_log(
        &format!("{rule}Supporting Elastic {dimension}: {before:?} -> {after:?}{rule}"),
        "valid",
        true,
    );
}

fn pick<T: Copy + PartialEq>(stages: Vec<T>, others_fixed: bool) -> Vec<T> {
    if others_fixed { stages } else { extremes(&stages) }
}

/// Index of the stage being unlocked in a descending candidate list.
fn current_stage<T>(stages: &[T]) -> usize {
    stages.len().saturating_sub(2)
}

fn descending<T: Copy + PartialOrd>(values: &[T]) -> Vec<T> {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    sorted
}

/// Sorted `{min, max}` of a descending list.
fn extremes<T: Copy + PartialEq>(stages: &[T]) -> Vec<T> {
    match (stages.last(), stages.first()) {
        (Some(&min), Some(&max)) if min != max => vec![min, max],
        (Some(&min), _) => vec![min],
        _ => Vec::new(),
    }
}

fn is_uniform<T: PartialEq>(values: &[T]) -> bool {
    values.windows(2).all(|w| w[0] == w[1])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descending_and_current_stage() {
        let stages = descending(&[2, 4, 3]);
        assert_eq!(stages, vec![4, 3, 2]);
        assert_eq!(current_stage(&stages), 1);
        assert_eq!(current_stage(&[4]), 0);
    }

    #[test]
    fn test_extremes() {
        assert_eq!(extremes(&[8.0, 6.0, 4.0, 2.0]), vec![2.0, 8.0]);
        assert_eq!(extremes(&[4]), vec![4]);
        assert!(extremes::<u32>(&[]).is_empty());
    }

    #[test]
    fn test_narrow_sweep_per_stage() {
        let full = CandidateSpace::from(&ofanas_core::SpaceConfig::default());

        let mut dims = SweepDims::default();
        narrow_sweep(TrainingStage::Full, &full, &mut dims).unwrap();
        assert_eq!(dims, SweepDims::default());

        let depth_space = TrainingStage::ElasticDepth.training_space(&full);
        narrow_sweep(TrainingStage::ElasticDepth, &depth_space, &mut dims).unwrap();
        // kernel size is already elastic, so only the extremes are swept
        assert_eq!(dims.depths, Some(vec![2, 4]));

        let scale_space = TrainingStage::ElasticScale.training_space(&full);
        let mut dims = SweepDims::default();
        narrow_sweep(TrainingStage::ElasticScale, &scale_space, &mut dims).unwrap();
        assert_eq!(dims.scales, Some(vec![2, 4]));

        let mut fixed = full.clone();
        fixed.kernel_sizes = vec![7];
        fixed.expand_ratios = vec![6.0];
        let mut dims = SweepDims::default();
        narrow_sweep(TrainingStage::ElasticDepth, &fixed, &mut dims).unwrap();
        assert_eq!(dims.depths, Some(vec![4, 3, 2]));
    }

    #[test]
    fn test_narrow_sweep_requires_width_candidates() {
        let full = CandidateSpace::from(&ofanas_core::SpaceConfig::default());
        let mut dims = SweepDims::default();
        assert!(narrow_sweep(TrainingStage::ElasticWidth, &full, &mut dims).is_err());

        let mut wide = full;
        wide.width_mults = vec![0.65, 0.8, 1.0];
        narrow_sweep(TrainingStage::ElasticWidth, &wide, &mut dims).unwrap();
        assert_eq!(dims.width_mults, Some(vec![0, 2]));
    }

    #[test]
    fn test_is_uniform() {
        assert!(is_uniform(&[7]));
        assert!(is_uniform::<u32>(&[]));
        assert!(!is_uniform(&[3, 5]));
    }
}
