//! # ofanas core
//!
//! Shared foundation for the Once-for-All training scheduler and the job
//! orchestrator: task types, error enums, layered configuration, and atomic
//! JSON persistence.

pub mod config;
pub mod error;
pub mod persistence;
pub mod types;

pub use config::{
    DashboardConfig, LauncherConfig, LrSchedule, OfanasConfig, PathsConfig, SpaceConfig,
    TrainTask, TrainingConfig, load_config,
};
pub use error::{ConfigError, JobError, OfanasError, Result};
pub use types::TaskType;
