//! BatchNorm running statistics: the on-disk `{mean, var}` file and the
//! batch-size weighted averaging used to recalibrate a subnet.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::MlError;

/// Per-layer running mean and variance, keyed by module name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BnStats {
    pub mean: BTreeMap<String, Vec<f32>>,
    pub var: BTreeMap<String, Vec<f32>>,
}

impl BnStats {
    pub fn is_empty(&self) -> bool {
        self.mean.is_empty()
    }

    /// Layers that carry both a mean and a variance.
    pub fn layers(&self) -> impl Iterator<Item = &str> {
        self.mean
            .keys()
            .filter(|name| self.var.contains_key(*name))
            .map(String::as_str)
    }

    pub fn load(path: &Path) -> Result<Self, MlError> {
        ofanas_core::persistence::load_json(path)?.ok_or_else(|| MlError::CheckpointNotFound {
            path: path.to_path_buf(),
        })
    }

    pub fn store(&self, path: &Path) -> Result<(), MlError> {
        ofanas_core::persistence::atomic_write_json(path, self)?;
        Ok(())
    }

    /// Copy the stored statistics of `layer` into the leading channels of a
    /// layer's running buffers. Returns the number of channels copied.
    pub fn copy_into(&self, layer: &str, running_mean: &mut [f32], running_var: &mut [f32]) -> usize {
        let (Some(mean), Some(var)) = (self.mean.get(layer), self.var.get(layer)) else {
            return 0;
        };
        let n = mean
            .len()
            .min(var.len())
            .min(running_mean.len())
            .min(running_var.len());
        running_mean[..n].copy_from_slice(&mean[..n]);
        running_var[..n].copy_from_slice(&var[..n]);
        n
    }
}

/// Batch-size weighted average of per-batch layer statistics.
#[derive(Debug, Default)]
pub struct BnStatsAccumulator {
    mean: BTreeMap<String, Vec<f64>>,
    var: BTreeMap<String, Vec<f64>>,
    count: f64,
}

impl BnStatsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one batch's statistics weighted by its size `n`. A batch whose
    /// channel counts disagree with earlier ones is rejected whole and
    /// leaves the accumulator untouched.
    pub fn update(&mut self, batch: &BnStats, n: usize) -> Result<(), MlError> {
        check_channels(&self.mean, &batch.mean)?;
        check_channels(&self.var, &batch.var)?;
        let weight = n as f64;
        accumulate(&mut self.mean, &batch.mean, weight);
        accumulate(&mut self.var, &batch.var, weight);
        self.count += weight;
        Ok(())
    }

    pub fn finish(self) -> BnStats {
        let count = self.count;
        let average = |sums: BTreeMap<String, Vec<f64>>| {
            sums.into_iter()
                .map(|(name, values)| {
                    let avg = values
                        .into_iter()
                        .map(|v| if count > 0.0 { (v / count) as f32 } else { 0.0 })
                        .collect();
                    (name, avg)
                })
                .collect()
        };
        BnStats {
            mean: average(self.mean),
            var: average(self.var),
        }
    }
}

fn check_channels(
    sums: &BTreeMap<String, Vec<f64>>,
    batch: &BTreeMap<String, Vec<f32>>,
) -> Result<(), MlError> {
    for (name, values) in batch {
        if let Some(acc) = sums.get(name)
            && acc.len() != values.len()
        {
            return Err(MlError::IncompatibleState {
                param: name.clone(),
                expected: format!("{} channels", acc.len()),
                found: format!("{} channels", values.len()),
            });
        }
    }
    Ok(())
}

fn accumulate(sums: &mut BTreeMap<String, Vec<f64>>, batch: &BTreeMap<String, Vec<f32>>, weight: f64) {
    for (name, values) in batch {
        let acc = sums
            .entry(name.clone())
            .or_insert_with(|| vec![0.0; values.len()]);
        for (a, v) in acc.iter_mut().zip(values) {
            *a += *v as f64 * weight;
        }
    }
}
