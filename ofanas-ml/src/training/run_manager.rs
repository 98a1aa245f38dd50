//! Per-run state: harness, stage space, best EPE, checkpoints and run logs.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use ofanas_core::TrainingConfig;

use crate::bn_stats::BnStatsAccumulator;
use crate::checkpoint::{self, Checkpoint, CheckpointStore};
use crate::distributed::Collective;
use crate::error::MlError;
use crate::network::{Supernet, TrainingHarness, ensure_compatible};
use crate::space::CandidateSpace;

/// Operator-facing run logs under `<run_dir>/logs`.
///
/// `valid` and `test` lines go to `valid.log` and, fenced, to `train.log`;
/// `train` lines go to `train.log`; any other category to
/// `<category>.log`. Only the coordinating replica writes.
#[derive(Debug, Clone)]
pub struct RunLog {
    dir: PathBuf,
    enabled: bool,
}

impl RunLog {
    pub fn new(dir: impl Into<PathBuf>, enabled: bool) -> Self {
        Self {
            dir: dir.into(),
            enabled,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write(&self, message: &str, category: &str, should_print: bool) {
        if !self.enabled {
            return;
        }
        if should_print {
            info!(category, "{message}");
        } else {
            debug!(category, "{message}");
        }
        if let Err(e) = self.append(message, category) {
            warn!(dir = %self.dir.display(), error = %e, "Failed to write run log");
        }
    }

    fn append(&self, message: &str, category: &str) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        match category {
            "valid" | "test" => {
                append_line(&self.dir.join("valid.log"), message)?;
                append_line(&self.dir.join("train.log"), &format!("=========={message}"))
            }
            "train" => append_line(&self.dir.join("train.log"), message),
            other => append_line(&self.dir.join(format!("{other}.log")), message),
        }
    }
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}

/// Everything one replica owns while training a stage.
pub struct RunManager<H: TrainingHarness> {
    pub harness: H,
    pub config: TrainingConfig,
    /// Candidates sampled during training in the current stage.
    pub space: CandidateSpace,
    pub start_epoch: usize,
    pub best_epe: f64,
    collective: Arc<dyn Collective>,
    checkpoints: CheckpointStore,
    log: RunLog,
}

impl<H: TrainingHarness> RunManager<H> {
    /// Checkpoints go to `<run_dir>/checkpoint`, logs to `<run_dir>/logs`.
    pub fn new(
        harness: H,
        config: TrainingConfig,
        space: CandidateSpace,
        collective: Arc<dyn Collective>,
        run_dir: &Path,
    ) -> Self {
        let log = RunLog::new(run_dir.join("logs"), collective.is_root());
        Self {
            harness,
            config,
            space,
            start_epoch: 0,
            best_epe: f64::INFINITY,
            collective,
            checkpoints: CheckpointStore::new(run_dir.join("checkpoint")),
            log,
        }
    }

    pub fn collective(&self) -> &dyn Collective {
        self.collective.as_ref()
    }

    pub fn is_root(&self) -> bool {
        self.collective.is_root()
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn write_log(&self, message: &str, category: &str, should_print: bool) {
        self.log.write(message, category, should_print);
    }

    pub fn log_dir(&self) -> &Path {
        self.log.dir()
    }

    /// Persist `checkpoint` under the run name. Only the coordinating
    /// replica writes; others return `None`.
    pub fn save_model(
        &self,
        checkpoint: &Checkpoint,
        is_best: bool,
    ) -> Result<Option<PathBuf>, MlError> {
        if !self.is_root() {
            return Ok(None);
        }
        self.checkpoints
            .save(checkpoint, is_best, &self.config.name)
            .map(Some)
    }

    /// Continue from the run's latest checkpoint, if any: next epoch, best
    /// EPE, optimizer state and weights.
    pub fn resume(&mut self) -> Result<bool, MlError> {
        let Some(checkpoint) = self.checkpoints.latest(&self.config.name)? else {
            return Ok(false);
        };
        ensure_compatible(&self.harness.network().state_dict(), &checkpoint.state_dict)?;
        self.harness
            .network_mut()
            .load_state_dict(checkpoint.state_dict)?;
        self.harness.load_optimizer_state(checkpoint.optimizer)?;
        self.start_epoch = checkpoint.epoch + 1;
        self.best_epe = checkpoint.best_epe;
        info!(
            run = %self.config.name,
            start_epoch = self.start_epoch,
            best_epe = self.best_epe,
            "Resumed from checkpoint"
        );
        Ok(true)
    }

    /// Warm-start the network from the `state_dict` of a previous stage's
    /// checkpoint. Missing files and mismatched parameters are fatal.
    pub fn load_models(&mut self, path: &Path) -> Result<(), MlError> {
        let state = checkpoint::load_state_dict(path)?;
        ensure_compatible(&self.harness.network().state_dict(), &state)?;
        self.harness.network_mut().load_state_dict(state)?;
        self.write_log(&format!("Loaded init from {}", path.display()), "valid", true);
        Ok(())
    }

    /// Recompute BatchNorm running statistics of the active subnet from the
    /// calibration batches.
    pub fn reset_running_statistics(&mut self) -> Result<(), MlError> {
        let mut acc = BnStatsAccumulator::new();
        for batch in 0..self.harness.calibration_batches() {
            let (stats, n) = self.harness.batch_norm_statistics(batch)?;
            acc.update(&stats, n)?;
        }
        let stats = acc.finish();
        let layers = self.harness.network_mut().set_running_statistics(&stats);
        debug!(layers, "BatchNorm statistics recalibrated");
        Ok(())
    }
}
