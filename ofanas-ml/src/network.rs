//! The seam to the external deep-learning framework.
//!
//! Layer numerics, the loss and the optimizer live behind [`Supernet`] and
//! [`TrainingHarness`]; the scheduler only decides which subnet runs when
//! and what to do with the numbers that come back.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::bn_stats::BnStats;
use crate::error::MlError;
use crate::metrics::StereoMetrics;
use crate::space::{CandidateSpace, SubnetSetting};

/// A dense parameter or buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self { shape, data }
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let numel = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; numel],
        }
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }
}

/// Parameter name to tensor, in a stable order.
pub type StateDict = BTreeMap<String, Tensor>;

/// Check that `found` can be loaded into a network whose own parameters
/// are `expected`: same keys, same shapes. No partial loads.
pub fn ensure_compatible(expected: &StateDict, found: &StateDict) -> Result<(), MlError> {
    for (name, tensor) in expected {
        match found.get(name) {
            None => {
                return Err(MlError::IncompatibleState {
                    param: name.clone(),
                    expected: format!("{:?}", tensor.shape),
                    found: "missing".to_string(),
                });
            }
            Some(other) if other.shape != tensor.shape => {
                return Err(MlError::IncompatibleState {
                    param: name.clone(),
                    expected: format!("{:?}", tensor.shape),
                    found: format!("{:?}", other.shape),
                });
            }
            Some(_) => {}
        }
    }
    if let Some(extra) = found.keys().find(|name| !expected.contains_key(*name)) {
        return Err(MlError::IncompatibleState {
            param: extra.clone(),
            expected: "absent".to_string(),
            found: "unexpected parameter".to_string(),
        });
    }
    Ok(())
}

/// A weight-sharing network that can run any subnet of its space.
pub trait Supernet {
    /// Every candidate the network was built with.
    fn space(&self) -> &CandidateSpace;

    fn set_active_subnet(&mut self, setting: &SubnetSetting) -> Result<(), MlError>;

    /// Human-readable description of the active subnet.
    fn module_str(&self) -> String;

    fn state_dict(&self) -> StateDict;

    fn load_state_dict(&mut self, state: StateDict) -> Result<(), MlError>;

    /// Sort the middle (expanded) channels by importance so that narrower
    /// expand ratios keep the most useful ones.
    fn re_organize_middle_weights(&mut self, expand_ratio_stage: usize) -> Result<(), MlError>;

    /// Same for the block output channels; not every network supports it.
    fn re_organize_outer_weights(&mut self) -> Result<(), MlError>;

    fn batch_norm_layers(&self) -> Vec<String>;

    /// Running mean and variance buffers of one BatchNorm layer.
    fn running_statistics_mut(&mut self, layer: &str) -> Option<(&mut [f32], &mut [f32])>;

    /// Copy `stats` into the matching layers, leading channels first.
    /// Returns the number of layers updated.
    fn set_running_statistics(&mut self, stats: &BnStats) -> usize {
        let mut updated = 0;
        for layer in self.batch_norm_layers() {
            if let Some((mean, var)) = self.running_statistics_mut(&layer)
                && stats.copy_into(&layer, mean, var) > 0
            {
                updated += 1;
            }
        }
        updated
    }
}

/// One forward pass: the finest predicted disparity and its ground truth,
/// flattened over the batch.
#[derive(Debug, Clone, Default)]
pub struct Prediction {
    pub disparity: Vec<f32>,
    pub ground_truth: Vec<f32>,
    pub batch_size: usize,
}

/// Result of evaluating the active subnet on the validation (or test) set.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EvalOutcome {
    pub loss: f64,
    pub metrics: StereoMetrics,
}

/// Data, loss and optimizer around a [`Supernet`], for one replica.
pub trait TrainingHarness {
    type Net: Supernet;

    fn network(&self) -> &Self::Net;

    fn network_mut(&mut self) -> &mut Self::Net;

    /// Batches per training epoch on this replica.
    fn train_batches(&self) -> usize;

    /// Reshuffle the sampler and switch to train mode.
    fn begin_epoch(&mut self, epoch: usize);

    fn set_learning_rate(&mut self, lr: f64);

    fn zero_grad(&mut self);

    fn forward(&mut self, batch: usize) -> Result<Prediction, MlError>;

    /// Masked task loss of `prediction`, back-propagated into the
    /// accumulated gradients. Only called when the mask selects a pixel.
    fn backward(&mut self, prediction: &Prediction, mask: &[bool]) -> Result<f64, MlError>;

    fn optimizer_step(&mut self);

    fn optimizer_state(&self) -> serde_json::Value;

    fn load_optimizer_state(&mut self, state: serde_json::Value) -> Result<(), MlError>;

    /// Batches of the calibration subset used to recompute BatchNorm
    /// statistics.
    fn calibration_batches(&self) -> usize;

    /// Eval-mode, no-grad forward of one calibration batch, returning the
    /// per-layer batch statistics of the active subnet and the batch size.
    fn batch_norm_statistics(&mut self, batch: usize) -> Result<(BnStats, usize), MlError>;

    /// Evaluate the active subnet over the whole validation or test set.
    fn evaluate(&mut self, epoch: usize, is_test: bool, run_str: &str)
    -> Result<EvalOutcome, MlError>;
}
