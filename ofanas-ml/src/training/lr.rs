//! Per-batch learning-rate schedules.

use std::f64::consts::PI;

use ofanas_core::{LrSchedule, TrainingConfig};

/// Linear ramp from `warmup_lr` to `init_lr` over the warmup epochs.
pub fn warmup_lr(config: &TrainingConfig, epoch: usize, batch: usize, n_batches: usize) -> f64 {
    let t_total = (config.warmup_epochs * n_batches).max(1) as f64;
    let t_cur = (epoch * n_batches + batch + 1) as f64;
    t_cur / t_total * (config.init_lr - config.warmup_lr) + config.warmup_lr
}

/// Decayed learning rate for `batch` of `epoch`, counted from the end of
/// warmup.
pub fn learning_rate(config: &TrainingConfig, epoch: usize, batch: usize, n_batches: usize) -> f64 {
    match config.lr_schedule {
        LrSchedule::Cosine => {
            let t_total = (config.n_epochs * n_batches).max(1) as f64;
            let t_cur = (epoch * n_batches + batch) as f64;
            0.5 * config.init_lr * (1.0 + (PI * t_cur / t_total).cos())
        }
        LrSchedule::Step { step_epochs, gamma } => {
            let steps = epoch / step_epochs.max(1);
            config.init_lr * gamma.powi(steps as i32)
        }
        LrSchedule::Constant => config.init_lr,
    }
}

/// Learning rate for one batch, switching from warmup to decay once
/// `epoch` passes `warmup_epochs`.
pub fn scheduled_lr(config: &TrainingConfig, epoch: usize, batch: usize, n_batches: usize) -> f64 {
    if epoch < config.warmup_epochs {
        warmup_lr(config, epoch, batch, n_batches)
    } else {
        learning_rate(config, epoch - config.warmup_epochs, batch, n_batches)
    }
}
