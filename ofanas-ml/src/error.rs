//! Error types for the ofanas-ml crate.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for supernet training.
#[derive(Debug, Error)]
pub enum MlError {
    #[error("Checkpoint not found: {}", path.display())]
    CheckpointNotFound { path: PathBuf },

    #[error("Checkpoint {} is missing '{field}'", path.display())]
    CheckpointMissingField { path: PathBuf, field: String },

    #[error("Incompatible state for '{param}': expected {expected}, found {found}")]
    IncompatibleState {
        param: String,
        expected: String,
        found: String,
    },

    #[error("Invalid subnet setting: {0}")]
    InvalidSetting(String),

    #[error("Weight reorganization failed: {0}")]
    Reorganize(String),

    #[error("Collective operation failed: {0}")]
    Collective(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl MlError {
    pub fn invalid_setting(msg: impl Into<String>) -> Self {
        Self::InvalidSetting(msg.into())
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    pub fn collective(msg: impl Into<String>) -> Self {
        Self::Collective(msg.into())
    }
}

impl From<ofanas_core::ConfigError> for MlError {
    fn from(err: ofanas_core::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
