//! The generic training loop and a single training epoch.

use serde::Serialize;
use tracing::{debug, info};

use ofanas_core::TrainTask;

use super::lr;
use super::run_manager::RunManager;
use crate::checkpoint::Checkpoint;
use crate::error::MlError;
use crate::metrics::{DistributedMetric, MetricAccumulator, StereoMetrics, list_mean, validity_mask};
use crate::network::{Supernet, TrainingHarness};
use crate::space::subnet_seed;
use crate::sweep::SweepSummary;

/// Replica-averaged loss and metrics of one training epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct EpochSummary {
    pub loss: f64,
    pub metrics: StereoMetrics,
}

/// Train every batch once with the configured task.
///
/// Each batch runs `dynamic_batch_size` sampled subnets (one full-size
/// network for the large task), accumulating gradients across them before a
/// single optimizer step. A subnet whose mask selects no pixel counts as
/// zero loss and is not back-propagated.
pub fn train_one_epoch<H: TrainingHarness>(
    rm: &mut RunManager<H>,
    epoch: usize,
) -> Result<EpochSummary, MlError> {
    let task = rm.config.task;
    train_one_epoch_as(rm, epoch, task)
}

/// [`train_one_epoch`] with `task` instead of the configured one.
pub fn train_one_epoch_as<H: TrainingHarness>(
    rm: &mut RunManager<H>,
    epoch: usize,
    task: TrainTask,
) -> Result<EpochSummary, MlError> {
    let n_batches = rm.harness.train_batches();
    rm.harness.begin_epoch(epoch);

    let large = task == TrainTask::Large;
    if large {
        let max = rm.space.max_setting();
        rm.harness.network_mut().set_active_subnet(&max)?;
    }
    let passes = if large {
        1
    } else {
        rm.config.dynamic_batch_size.max(1)
    };

    let mut losses = DistributedMetric::new("train_loss");
    let mut metrics = MetricAccumulator::new();

    for batch in 0..n_batches {
        let lr = lr::scheduled_lr(&rm.config, epoch, batch, n_batches);
        rm.harness.set_learning_rate(lr);
        rm.harness.zero_grad();

        let mut subnet_losses = Vec::with_capacity(passes);
        let mut subnet_strs = Vec::with_capacity(passes);
        let mut batch_size = 0;
        let mut seed = 0;
        for slot in 0..passes {
            if !large {
                seed = subnet_seed(epoch, n_batches, batch, slot);
                let setting = rm.space.sample(seed);
                subnet_strs.push(format!("{slot}: {}", setting.summary()));
                rm.harness.network_mut().set_active_subnet(&setting)?;
            }

            let prediction = rm.harness.forward(batch)?;
            let mask = validity_mask(&prediction.ground_truth, rm.config.max_disparity);
            let loss = if mask.iter().any(|valid| *valid) {
                Some(rm.harness.backward(&prediction, &mask)?)
            } else {
                None
            };
            subnet_losses.push(loss.unwrap_or(0.0));
            batch_size = prediction.batch_size;

            match StereoMetrics::compute(&prediction.disparity, &prediction.ground_truth, &mask) {
                Some(m) => metrics.update(m, prediction.batch_size, rm.collective())?,
                // keep the collective call count equal on every replica
                None => metrics.update(StereoMetrics::default(), 0, rm.collective())?,
            }
        }
        rm.harness.optimizer_step();

        losses.update(list_mean(&subnet_losses), batch_size, rm.collective())?;
        debug!(
            epoch = epoch + 1,
            batch,
            lr,
            seed,
            loss = losses.avg(),
            subnets = %subnet_strs.join(" || "),
            "Train step"
        );
    }

    Ok(EpochSummary {
        loss: losses.avg(),
        metrics: metrics.values(),
    })
}

/// Run epochs `[start_epoch, n_epochs + warmup_epochs)`, validating every
/// `validation_frequency` epochs. Returns the best validation EPE seen.
///
/// `validate` must be called identically on every replica; only the
/// coordinating replica logs and checkpoints.
pub fn train<H, F>(rm: &mut RunManager<H>, validate: F) -> Result<f64, MlError>
where
    H: TrainingHarness,
    F: FnMut(&mut RunManager<H>, usize, bool) -> Result<SweepSummary, MlError>,
{
    let task = rm.config.task;
    train_as(rm, task, validate)
}

/// [`train`] with every epoch run as `task`.
pub fn train_as<H, F>(
    rm: &mut RunManager<H>,
    task: TrainTask,
    mut validate: F,
) -> Result<f64, MlError>
where
    H: TrainingHarness,
    F: FnMut(&mut RunManager<H>, usize, bool) -> Result<SweepSummary, MlError>,
{
    let total = rm.config.n_epochs + rm.config.warmup_epochs;
    let frequency = rm.config.validation_frequency.max(1);
    info!(
        run = %rm.config.name,
        start_epoch = rm.start_epoch,
        epochs = total,
        ?task,
        "Training started"
    );

    for epoch in rm.start_epoch..total {
        let train_summary = train_one_epoch_as(rm, epoch, task)?;

        if (epoch + 1) % frequency != 0 {
            continue;
        }
        let val = validate(rm, epoch, false)?;
        let is_best = val.epe < rm.best_epe;
        rm.best_epe = rm.best_epe.min(val.epe);

        if rm.is_root() {
            let shown_epoch = (epoch + 1) as i64 - rm.config.warmup_epochs as i64;
            let line = format!(
                "Valid [{shown_epoch}/{}] loss={:.3}, epe={:.3} ({:.3}), Train epe {:.3}, Train loss {:.3}\t{}",
                rm.config.n_epochs,
                val.loss,
                val.epe,
                rm.best_epe,
                train_summary.metrics.epe,
                train_summary.loss,
                val.log
            );
            rm.write_log(&line, "valid", false);

            let checkpoint = Checkpoint {
                epoch,
                best_epe: rm.best_epe,
                optimizer: rm.harness.optimizer_state(),
                state_dict: rm.harness.network().state_dict(),
                saved_at: chrono::Utc::now(),
            };
            rm.save_model(&checkpoint, is_best)?;
        }
    }
    Ok(rm.best_epe)
}
