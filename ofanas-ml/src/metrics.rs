//! Running averages of loss and disparity metrics, local or reduced across
//! replicas.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::distributed::Collective;
use crate::error::MlError;

/// Count-weighted running mean of a local value.
#[derive(Debug, Clone, Default)]
pub struct AverageMeter {
    pub val: f64,
    pub sum: f64,
    pub count: f64,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn update(&mut self, val: f64, n: usize) {
        self.val = val;
        self.sum += val * n as f64;
        self.count += n as f64;
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0.0 {
            0.0
        } else {
            self.sum / self.count
        }
    }
}

/// A running mean whose every update is first averaged across replicas.
///
/// The reduction is a collective call, so every replica must update the
/// metric the same number of times.
#[derive(Debug, Clone)]
pub struct DistributedMetric {
    name: String,
    sum: f64,
    count: f64,
}

impl DistributedMetric {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sum: 0.0,
            count: 0.0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn update(&mut self, val: f64, n: usize, group: &dyn Collective) -> Result<(), MlError> {
        let mut reduced = [val];
        group.all_reduce_mean(&mut reduced)?;
        self.sum += reduced[0] * n as f64;
        self.count += n as f64;
        Ok(())
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0.0 {
            0.0
        } else {
            self.sum / self.count
        }
    }
}

/// Disparity accuracy of one prediction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StereoMetrics {
    /// Mean absolute disparity error over valid pixels.
    pub epe: f64,
    /// Fraction of valid pixels with error > 3px and > 5% of the ground truth.
    pub d1: f64,
    /// Fraction of valid pixels with error > 1px.
    pub thres1: f64,
    pub thres2: f64,
    pub thres3: f64,
}

impl StereoMetrics {
    pub const NAMES: [&'static str; 5] = ["epe", "d1", "thres1", "thres2", "thres3"];

    /// Metrics over the pixels selected by `mask`; `None` when no pixel is
    /// valid.
    pub fn compute(pred: &[f32], gt: &[f32], mask: &[bool]) -> Option<StereoMetrics> {
        let mut n = 0usize;
        let mut abs_sum = 0.0f64;
        let mut d1 = 0usize;
        let mut over = [0usize; 3];
        for ((&p, &g), _) in pred
            .iter()
            .zip(gt)
            .zip(mask)
            .filter(|(_, valid)| **valid)
        {
            let err = (p as f64 - g as f64).abs();
            n += 1;
            abs_sum += err;
            if err > 3.0 && err / g as f64 > 0.05 {
                d1 += 1;
            }
            for (t, count) in over.iter_mut().enumerate() {
                if err > (t + 1) as f64 {
                    *count += 1;
                }
            }
        }
        if n == 0 {
            return None;
        }
        let n = n as f64;
        Some(StereoMetrics {
            epe: abs_sum / n,
            d1: d1 as f64 / n,
            thres1: over[0] as f64 / n,
            thres2: over[1] as f64 / n,
            thres3: over[2] as f64 / n,
        })
    }

    fn to_array(self) -> [f64; 5] {
        [self.epe, self.d1, self.thres1, self.thres2, self.thres3]
    }

    fn from_array(v: [f64; 5]) -> Self {
        StereoMetrics {
            epe: v[0],
            d1: v[1],
            thres1: v[2],
            thres2: v[3],
            thres3: v[4],
        }
    }
}

/// Pixels whose ground-truth disparity lies strictly inside `(0, max_disp)`.
pub fn validity_mask(gt: &[f32], max_disp: f32) -> Vec<bool> {
    gt.iter().map(|&d| d > 0.0 && d < max_disp).collect()
}

/// Named running means of the stereo metrics for one epoch or validation
/// pass. All five metrics travel in a single collective call.
#[derive(Debug, Clone, Default)]
pub struct MetricAccumulator {
    sums: BTreeMap<&'static str, f64>,
    count: f64,
}

impl MetricAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.sums.clear();
        self.count = 0.0;
    }

    pub fn update(
        &mut self,
        metrics: StereoMetrics,
        n: usize,
        group: &dyn Collective,
    ) -> Result<(), MlError> {
        let mut values = metrics.to_array();
        group.all_reduce_mean(&mut values)?;
        for (name, v) in StereoMetrics::NAMES.iter().zip(values) {
            *self.sums.entry(name).or_insert(0.0) += v * n as f64;
        }
        self.count += n as f64;
        Ok(())
    }

    pub fn get(&self, name: &str) -> f64 {
        if self.count == 0.0 {
            return 0.0;
        }
        self.sums.get(name).copied().unwrap_or(0.0) / self.count
    }

    pub fn values(&self) -> StereoMetrics {
        let mut out = [0.0; 5];
        for (slot, name) in out.iter_mut().zip(StereoMetrics::NAMES) {
            *slot = self.get(name);
        }
        StereoMetrics::from_array(out)
    }
}

/// Unweighted arithmetic mean; 0 for an empty list.
pub fn list_mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}
