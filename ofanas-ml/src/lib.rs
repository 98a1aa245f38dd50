//! # ofanas ml
//!
//! Scheduling core for Once-for-All supernet training: the subnet
//! configuration space, replica-reduced metrics, the progressive-shrinking
//! stages, the validation sweep and checkpoints. The network, its data and
//! its optimizer stay behind the [`network::Supernet`] and
//! [`network::TrainingHarness`] traits.

pub mod bn_stats;
pub mod checkpoint;
pub mod distributed;
pub mod error;
pub mod metrics;
pub mod network;
pub mod space;
pub mod sweep;
pub mod training;

pub use bn_stats::{BnStats, BnStatsAccumulator};
pub use checkpoint::{Checkpoint, CheckpointEntry, CheckpointStore, load_state_dict};
pub use distributed::{Collective, LocalGroup, SingleProcess};
pub use error::MlError;
pub use metrics::{AverageMeter, DistributedMetric, MetricAccumulator, StereoMetrics, validity_mask};
pub use network::{EvalOutcome, Prediction, StateDict, Supernet, Tensor, TrainingHarness};
pub use space::{CandidateSpace, Choice, NamedSetting, SubnetSetting, SweepDims, subnet_seed};
pub use sweep::{SweepSummary, validate};
pub use training::{RunManager, TrainingStage, narrow_sweep, run_stage};
