//! Progressive-shrinking training of a Once-for-All supernet.

pub mod epoch;
pub mod lr;
pub mod progressive;
pub mod run_manager;
pub mod stage;

pub use epoch::{EpochSummary, train, train_as, train_one_epoch, train_one_epoch_as};
pub use progressive::{
    narrow_sweep, run_stage, train_elastic_depth, train_elastic_expand, train_elastic_scale,
    train_elastic_width_mult, train_full,
};
pub use run_manager::{RunLog, RunManager};
pub use stage::TrainingStage;
