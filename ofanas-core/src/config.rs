//! Configuration system for ofanas.
//!
//! Uses `figment` for layered configuration: defaults -> user file -> workspace
//! file -> environment -> explicit overrides. Configuration is loaded from
//! `~/.config/ofanas/config.toml` and/or `.ofanas/config.toml` in the
//! workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OfanasConfig {
    #[serde(default)]
    pub launcher: LauncherConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub space: SpaceConfig,
}

impl OfanasConfig {
    /// Reject values the launcher or scheduler cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.launcher.slots_per_node == 0 {
            return Err(ConfigError::Invalid {
                message: "launcher.slots_per_node must be positive".into(),
            });
        }
        if self.launcher.network_interface.trim().is_empty() {
            return Err(ConfigError::Invalid {
                message: "launcher.network_interface must not be empty".into(),
            });
        }
        if self.training.validation_frequency == 0 {
            return Err(ConfigError::Invalid {
                message: "training.validation_frequency must be positive".into(),
            });
        }
        if self.training.dynamic_batch_size == 0 {
            return Err(ConfigError::Invalid {
                message: "training.dynamic_batch_size must be positive".into(),
            });
        }
        self.space.validate()
    }
}

/// MPI launcher settings. Replaces the per-cluster settings modules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherConfig {
    /// OpenMPI installation prefix; `mpirun` is taken from `{mpi_home}/bin`.
    pub mpi_home: PathBuf,
    /// Python interpreter running the training entry points.
    pub python: PathBuf,
    /// Working directory of launched jobs (the training code checkout).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_dir: Option<PathBuf>,
    /// Interface used for NCCL sockets and the MPI TCP transport.
    pub network_interface: String,
    /// Use the InfiniBand/RDMA transport instead of plain TCP.
    pub rdma: bool,
    /// Pass `--allow-run-as-root` (containers running as root).
    pub allow_run_as_root: bool,
    /// MPI processes started per node; `-np` is `node_count * slots_per_node`.
    pub slots_per_node: u32,
    /// Extra flags appended to the fixed MPI prefix.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            mpi_home: PathBuf::from("/usr/local/openmpi-4.0.1"),
            python: PathBuf::from("python"),
            root_dir: None,
            network_interface: "eth0".to_string(),
            rdma: false,
            allow_run_as_root: false,
            slots_per_node: 2,
            extra_args: Vec::new(),
        }
    }
}

impl LauncherConfig {
    pub fn mpirun(&self) -> PathBuf {
        self.mpi_home.join("bin").join("mpirun")
    }
}

/// Filesystem locations, relative to the workspace unless absolute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Job logs (`{job}_{task}.log`), which also serve as the job registry.
    pub log_dir: PathBuf,
    /// Saved supernet weights.
    pub checkpoint_dir: PathBuf,
    /// Per-run training/validation logs written by the scheduler.
    pub run_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            checkpoint_dir: PathBuf::from("checkpoints"),
            run_dir: PathBuf::from("runs"),
        }
    }
}

impl PathsConfig {
    /// Resolve every relative path against `workspace`.
    pub fn resolved(&self, workspace: &Path) -> PathsConfig {
        let resolve = |p: &Path| {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                workspace.join(p)
            }
        };
        PathsConfig {
            log_dir: resolve(&self.log_dir),
            checkpoint_dir: resolve(&self.checkpoint_dir),
            run_dir: resolve(&self.run_dir),
        }
    }
}

/// Operator front-end settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardConfig {
    /// GPU nodes offered for selection.
    pub nodes: Vec<String>,
    /// Lines shown when tailing a job log.
    pub log_tail_lines: usize,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            nodes: vec!["host1".to_string(), "host2".to_string()],
            log_tail_lines: 20,
        }
    }
}

/// Whether a stage trains the single full-size network or sampled subnets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainTask {
    /// One full-size forward/backward per batch, no sampling.
    Large,
    /// `dynamic_batch_size` sampled subnets per batch.
    Elastic,
}

/// Learning-rate decay after warmup.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LrSchedule {
    Cosine,
    Step { step_epochs: usize, gamma: f64 },
    Constant,
}

/// Scheduler arguments for one training stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Run name; checkpoints are saved under it.
    pub name: String,
    pub task: TrainTask,
    pub n_epochs: usize,
    pub warmup_epochs: usize,
    pub warmup_lr: f64,
    pub init_lr: f64,
    pub lr_schedule: LrSchedule,
    /// Validate every this many epochs.
    pub validation_frequency: usize,
    /// Subnets sampled (and accumulated) per optimizer step.
    pub dynamic_batch_size: usize,
    /// Previous stage's weights, loaded when a stage starts from epoch 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ofa_checkpoint_path: Option<PathBuf>,
    /// Ground-truth disparities outside `(0, max_disparity)` are masked out.
    pub max_disparity: f32,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            name: "ofa_stereo".to_string(),
            task: TrainTask::Elastic,
            n_epochs: 10,
            warmup_epochs: 0,
            warmup_lr: 0.0,
            init_lr: 0.001,
            lr_schedule: LrSchedule::Cosine,
            validation_frequency: 1,
            dynamic_batch_size: 2,
            ofa_checkpoint_path: None,
            max_disparity: 192.0,
        }
    }
}

/// Candidate values of every elastic dimension of the supernet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpaceConfig {
    pub image_sizes: Vec<u32>,
    pub kernel_sizes: Vec<u32>,
    pub expand_ratios: Vec<f64>,
    pub depths: Vec<u32>,
    /// Empty when the network has no elastic scale.
    #[serde(default)]
    pub scales: Vec<u32>,
    /// Empty when the network has no elastic width.
    #[serde(default)]
    pub width_mults: Vec<f64>,
    /// Blocks that carry their own kernel size and expand ratio.
    pub num_blocks: usize,
    /// Stages that carry their own depth.
    pub num_stages: usize,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            image_sizes: vec![576],
            kernel_sizes: vec![3, 5, 7],
            expand_ratios: vec![2.0, 4.0, 6.0, 8.0],
            depths: vec![2, 3, 4],
            scales: vec![2, 3, 4],
            width_mults: Vec::new(),
            num_blocks: 6,
            num_stages: 3,
        }
    }
}

impl SpaceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("space.image_sizes", self.image_sizes.is_empty()),
            ("space.kernel_sizes", self.kernel_sizes.is_empty()),
            ("space.expand_ratios", self.expand_ratios.is_empty()),
            ("space.depths", self.depths.is_empty()),
        ];
        if let Some((field, _)) = required.iter().find(|(_, empty)| *empty) {
            return Err(ConfigError::Invalid {
                message: format!("{field} must list at least one candidate"),
            });
        }
        if self.num_blocks == 0 || self.num_stages == 0 {
            return Err(ConfigError::Invalid {
                message: "space.num_blocks and space.num_stages must be positive".into(),
            });
        }
        Ok(())
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `OFANAS_`, `__` separates levels)
/// 3. Workspace-local config (`.ofanas/config.toml`)
/// 4. User config (`~/.config/ofanas/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&OfanasConfig>,
) -> Result<OfanasConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(OfanasConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("org", "dist-automl", "ofanas") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".ofanas").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // OFANAS_LAUNCHER__MPI_HOME, OFANAS_TRAINING__N_EPOCHS, ...
    figment = figment.merge(Env::prefixed("OFANAS_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

/// Load a configuration from one explicit TOML file on top of the defaults.
pub fn load_config_file(path: &Path) -> Result<OfanasConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    Figment::from(Serialized::defaults(OfanasConfig::default()))
        .merge(Toml::file(path))
        .extract()
        .map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = OfanasConfig::default();
        assert_eq!(config.launcher.slots_per_node, 2);
        assert_eq!(config.paths.log_dir, PathBuf::from("logs"));
        assert_eq!(config.dashboard.log_tail_lines, 20);
        assert_eq!(config.training.max_disparity, 192.0);
        assert_eq!(config.space.kernel_sizes, vec![3, 5, 7]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_mpirun_path() {
        let launcher = LauncherConfig {
            mpi_home: PathBuf::from("/opt/openmpi"),
            ..LauncherConfig::default()
        };
        assert_eq!(launcher.mpirun(), PathBuf::from("/opt/openmpi/bin/mpirun"));
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = OfanasConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: OfanasConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(deserialized.training.lr_schedule, LrSchedule::Cosine);
        assert_eq!(deserialized.space.depths, config.space.depths);
        assert_eq!(deserialized.dashboard.nodes, config.dashboard.nodes);
    }

    #[test]
    fn test_validate_rejects_zero_slots() {
        let mut config = OfanasConfig::default();
        config.launcher.slots_per_node = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_empty_kernel_list() {
        let mut config = OfanasConfig::default();
        config.space.kernel_sizes.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("space.kernel_sizes"));
    }

    #[test]
    fn test_paths_resolved_against_workspace() {
        let paths = PathsConfig {
            checkpoint_dir: PathBuf::from("/data/ckpt"),
            ..PathsConfig::default()
        };
        let resolved = paths.resolved(Path::new("/work"));
        assert_eq!(resolved.log_dir, PathBuf::from("/work/logs"));
        assert_eq!(resolved.checkpoint_dir, PathBuf::from("/data/ckpt"));
    }

    #[test]
    fn test_load_config_with_overrides() {
        let mut overrides = OfanasConfig::default();
        overrides.training.n_epochs = 120;
        overrides.launcher.rdma = true;

        let config = load_config(None, Some(&overrides)).unwrap();
        assert_eq!(config.training.n_epochs, 120);
        assert!(config.launcher.rdma);
    }

    #[test]
    fn test_load_config_from_workspace() {
        figment::Jail::expect_with(|jail| {
            jail.create_dir(".ofanas")?;
            jail.create_file(
                ".ofanas/config.toml",
                r#"
[launcher]
mpi_home = "/home/comp/openmpi-4.0.1"
python = "/opt/conda/bin/python"
network_interface = "bond1"
rdma = true
allow_run_as_root = false
slots_per_node = 2

[training]
name = "aanet_depth"
task = "elastic"
n_epochs = 40
warmup_epochs = 0
warmup_lr = 0.0
init_lr = 0.002
lr_schedule = { type = "step", step_epochs = 10, gamma = 0.5 }
validation_frequency = 5
dynamic_batch_size = 4
max_disparity = 192.0
"#,
            )?;

            let config = load_config(Some(jail.directory()), None).unwrap();
            assert_eq!(config.launcher.network_interface, "bond1");
            assert!(config.launcher.rdma);
            assert_eq!(config.training.validation_frequency, 5);
            assert_eq!(
                config.training.lr_schedule,
                LrSchedule::Step {
                    step_epochs: 10,
                    gamma: 0.5
                }
            );
            // Untouched sections keep their defaults.
            assert_eq!(config.paths.log_dir, PathBuf::from("logs"));
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("OFANAS_LAUNCHER__NETWORK_INTERFACE", "ib0");
            jail.set_env("OFANAS_TRAINING__N_EPOCHS", "7");
            let config = load_config(Some(jail.directory()), None).unwrap();
            assert_eq!(config.launcher.network_interface, "ib0");
            assert_eq!(config.training.n_epochs, 7);
            Ok(())
        });
    }

    #[test]
    fn test_load_config_file_missing() {
        let err = load_config_file(Path::new("/nonexistent/ofanas.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }
}
