//! Error types shared across the ofanas crates.
//!
//! Uses `thiserror` for public API error types; the binary wraps them in
//! `anyhow` at the top level.

use std::path::PathBuf;

/// Top-level error type for the ofanas core library.
#[derive(Debug, thiserror::Error)]
pub enum OfanasError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Errors from launching and controlling distributed training jobs.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Invalid job name: '{name}'")]
    InvalidName { name: String },

    #[error("Job '{name}' is already running")]
    AlreadyRunning { name: String },

    #[error("No nodes selected for job '{name}'")]
    NoNodes { name: String },

    #[error("Failed to open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn job '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

/// A type alias for results using the top-level `OfanasError`.
pub type Result<T> = std::result::Result<T, OfanasError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_job() {
        let err = OfanasError::Job(JobError::AlreadyRunning {
            name: "expA".into(),
        });
        assert_eq!(err.to_string(), "Job error: Job 'expA' is already running");
    }

    #[test]
    fn test_error_display_config() {
        let err = OfanasError::Config(ConfigError::Invalid {
            message: "slots_per_node must be positive".into(),
        });
        assert_eq!(
            err.to_string(),
            "Configuration error: Invalid configuration: slots_per_node must be positive"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: OfanasError = io_err.into();
        assert!(matches!(err, OfanasError::Io(_)));
    }

    #[test]
    fn test_spawn_error_keeps_source() {
        let err = JobError::Spawn {
            name: "expA".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "mpirun"),
        };
        assert_eq!(err.to_string(), "Failed to spawn job 'expA': mpirun");
        assert!(std::error::Error::source(&err).is_some());
    }
}
