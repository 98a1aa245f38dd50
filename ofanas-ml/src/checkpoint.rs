//! Checkpoint persistence for training runs.
//!
//! A run keeps one file per model name, overwritten by every save, plus a
//! `_best` copy that only moves when validation EPE improves.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::MlError;
use crate::network::StateDict;

/// A snapshot of a run at the end of a validated epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub epoch: usize,
    #[serde(with = "finite_or_null")]
    pub best_epe: f64,
    /// Opaque optimizer state, owned by the harness.
    pub optimizer: serde_json::Value,
    pub state_dict: StateDict,
    #[serde(default = "Utc::now")]
    pub saved_at: DateTime<Utc>,
}

/// JSON has no infinity; a run that never validated stores `null`.
mod finite_or_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_some(value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::INFINITY))
    }
}

/// A checkpoint file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointEntry {
    pub name: String,
    pub path: PathBuf,
    pub is_best: bool,
}

/// Checkpoint directory of one run.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, model_name: &str) -> PathBuf {
        self.dir.join(format!("{model_name}.json"))
    }

    pub fn best_path_for(&self, model_name: &str) -> PathBuf {
        self.dir.join(format!("{model_name}_best.json"))
    }

    /// Write `checkpoint` under `model_name`, and also as the best one when
    /// `is_best`. Returns the path of the regular file.
    pub fn save(
        &self,
        checkpoint: &Checkpoint,
        is_best: bool,
        model_name: &str,
    ) -> Result<PathBuf, MlError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(model_name);
        ofanas_core::persistence::atomic_write_json(&path, checkpoint)?;
        if is_best {
            ofanas_core::persistence::atomic_write_json(&self.best_path_for(model_name), checkpoint)?;
        }
        info!(
            path = %path.display(),
            epoch = checkpoint.epoch,
            best_epe = checkpoint.best_epe,
            is_best,
            "Checkpoint saved"
        );
        Ok(path)
    }

    pub fn latest(&self, model_name: &str) -> Result<Option<Checkpoint>, MlError> {
        Ok(ofanas_core::persistence::load_json(&self.path_for(model_name))?)
    }

    pub fn best(&self, model_name: &str) -> Result<Option<Checkpoint>, MlError> {
        Ok(ofanas_core::persistence::load_json(
            &self.best_path_for(model_name),
        )?)
    }

    /// Checkpoint files in the directory whose name contains `filter`,
    /// sorted by name.
    pub fn list(&self, filter: Option<&str>) -> Result<Vec<CheckpointEntry>, MlError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some(filter) = filter
                && !stem.contains(filter)
            {
                continue;
            }
            let (name, is_best) = match stem.strip_suffix("_best") {
                Some(name) => (name.to_string(), true),
                None => (stem.to_string(), false),
            };
            entries.push(CheckpointEntry {
                name,
                path,
                is_best,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name).then(a.is_best.cmp(&b.is_best)));
        Ok(entries)
    }
}

/// Read only the `state_dict` part of a checkpoint file.
pub fn load_state_dict(path: &Path) -> Result<StateDict, MlError> {
    if !path.exists() {
        return Err(MlError::CheckpointNotFound {
            path: path.to_path_buf(),
        });
    }
    let bytes = std::fs::read(path)?;
    let mut value: serde_json::Value = serde_json::from_slice(&bytes)?;
    let state = value
        .get_mut("state_dict")
        .map(serde_json::Value::take)
        .ok_or_else(|| MlError::CheckpointMissingField {
            path: path.to_path_buf(),
            field: "state_dict".to_string(),
        })?;
    Ok(serde_json::from_value(state)?)
}
