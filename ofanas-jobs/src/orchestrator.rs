//! Launching, discovering and stopping training jobs.
//!
//! The process table is the source of truth for which jobs are running, and
//! the log directory for which jobs were ever launched. A job whose log
//! exists but whose launcher is gone counts as stopped and can be resumed
//! under the same name.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use ofanas_core::{JobError, OfanasConfig, TaskType, persistence};

use crate::launcher::{LaunchRequest, MpiLauncher};
use crate::registry::{ProcessRegistry, RunningJob, default_registry, is_no_such_process};

/// Lifecycle of a job launched by this orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    New,
    Running,
    /// `exit_code` is `None` when the process was killed by a signal.
    Stopped { exit_code: Option<i32> },
}

/// Outcome of checking a proposed job name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NameCheck {
    Invalid = 0,
    Running = 1,
    Resume = 2,
    New = 3,
}

impl NameCheck {
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Whether a job may be started under the checked name.
    pub fn can_launch(self) -> bool {
        matches!(self, NameCheck::Resume | NameCheck::New)
    }
}

/// Whether `name` can identify a job: non-empty, a single whitespace-free
/// token on the launcher command line, and a plain log file name.
pub fn is_valid_job_name(name: &str) -> bool {
    !name.is_empty()
        && !name
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || c == '/' || c == '\\')
}

impl fmt::Display for NameCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NameCheck::Invalid => "invalid",
            NameCheck::Running => "running",
            NameCheck::Resume => "resume",
            NameCheck::New => "new",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Stopped,
}

/// One row of the job listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    pub name: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl fmt::Display for JobSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            JobStatus::Running => write!(f, "{} (running)", self.name),
            JobStatus::Stopped => write!(f, "{} (stopped)", self.name),
        }
    }
}

/// A job started by [`JobOrchestrator::launch`].
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub name: String,
    pub task: TaskType,
    pub pid: u32,
    pub argv: Vec<String>,
    pub log_path: PathBuf,
    state: watch::Receiver<JobState>,
}

impl JobHandle {
    pub fn state(&self) -> JobState {
        *self.state.borrow()
    }

    /// Wait until the launcher process has exited.
    pub async fn wait(&mut self) -> JobState {
        let stopped = self
            .state
            .wait_for(|s| matches!(s, JobState::Stopped { .. }))
            .await
            .map(|s| *s);
        // the reaper only drops its sender after publishing the final state
        stopped.unwrap_or_else(|_| *self.state.borrow())
    }
}

type TrackedJobs = Arc<Mutex<HashMap<(TaskType, String), JobState>>>;

pub struct JobOrchestrator {
    launcher: MpiLauncher,
    log_dir: PathBuf,
    registry: Arc<dyn ProcessRegistry>,
    tracked: TrackedJobs,
}

impl JobOrchestrator {
    /// Orchestrator for `config`, with relative paths resolved against
    /// `workspace` and the platform's default process registry.
    pub fn new(config: &OfanasConfig, workspace: &Path) -> Self {
        Self::with_registry(config, workspace, default_registry())
    }

    pub fn with_registry(
        config: &OfanasConfig,
        workspace: &Path,
        registry: Arc<dyn ProcessRegistry>,
    ) -> Self {
        let paths = config.paths.resolved(workspace);
        Self {
            launcher: MpiLauncher::new(config.launcher.clone()),
            log_dir: paths.log_dir,
            registry,
            tracked: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn launcher(&self) -> &MpiLauncher {
        &self.launcher
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn log_path(&self, name: &str, task: TaskType) -> PathBuf {
        self.log_dir.join(task.log_file_name(name))
    }

    /// Start a job without consulting the process table. Output of every
    /// replica is appended to the job's log, which also registers the name
    /// for [`query_stopped`](Self::query_stopped).
    pub async fn launch(&self, request: &LaunchRequest) -> Result<JobHandle, JobError> {
        if !is_valid_job_name(&request.name) {
            return Err(JobError::InvalidName {
                name: request.name.clone(),
            });
        }
        let log_path = self.log_path(&request.name, request.task);
        let log_err = |source| JobError::LogFile {
            path: log_path.clone(),
            source,
        };
        std::fs::create_dir_all(&self.log_dir).map_err(log_err)?;
        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(log_err)?;
        let stderr = stdout.try_clone().map_err(log_err)?;

        let argv = self.launcher.command(request);
        let (program, args) = argv.split_first().ok_or_else(|| JobError::Spawn {
            name: request.name.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
        })?;
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        if let Some(dir) = self.launcher.working_dir() {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| JobError::Spawn {
            name: request.name.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or_default();
        info!(
            job = %request.name,
            task = %request.task,
            pid,
            hosts = %request.hosts,
            log = %log_path.display(),
            "Launched training job"
        );

        let key = (request.task, request.name.clone());
        self.tracked
            .lock()
            .await
            .insert(key.clone(), JobState::Running);
        let (tx, rx) = watch::channel(JobState::Running);

        let tracked = Arc::clone(&self.tracked);
        tokio::spawn(async move {
            let final_state = match child.wait().await {
                Ok(status) => JobState::Stopped {
                    exit_code: status.code(),
                },
                Err(e) => {
                    warn!(job = %key.1, pid, error = %e, "Failed to wait for job");
                    JobState::Stopped { exit_code: None }
                }
            };
            info!(job = %key.1, task = %key.0, pid, state = ?final_state, "Training job exited");
            tracked.lock().await.insert(key, final_state);
            let _ = tx.send(final_state);
        });

        Ok(JobHandle {
            name: request.name.clone(),
            task: request.task,
            pid,
            argv,
            log_path,
            state: rx,
        })
    }

    /// Launch only if the name is usable and at least one node is selected.
    pub async fn submit(&self, request: &LaunchRequest) -> Result<JobHandle, JobError> {
        match self.check_job_name(&request.name, request.task).await {
            NameCheck::Invalid => {
                return Err(JobError::InvalidName {
                    name: request.name.clone(),
                });
            }
            NameCheck::Running => {
                return Err(JobError::AlreadyRunning {
                    name: request.name.trim().to_string(),
                });
            }
            NameCheck::Resume => info!(job = %request.name, "Resuming stopped job"),
            NameCheck::New => {}
        }
        if request.node_count == 0 || request.hosts.as_str().is_empty() {
            return Err(JobError::NoNodes {
                name: request.name.clone(),
            });
        }
        let mut request = request.clone();
        request.name = request.name.trim().to_string();
        self.launch(&request).await
    }

    /// Jobs of `task` currently in the process table.
    pub async fn query_running(&self, task: TaskType) -> Vec<RunningJob> {
        let jobs: Vec<RunningJob> = self
            .registry
            .list()
            .await
            .iter()
            .filter_map(|entry| entry.as_job(task))
            .collect();
        debug!(task = %task, count = jobs.len(), "Queried running jobs");
        jobs
    }

    /// Names of every job of `task` that has a log, sorted.
    pub fn list_logs(&self, task: TaskType) -> Vec<String> {
        let entries = match std::fs::read_dir(&self.log_dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %self.log_dir.display(), error = %e, "No job logs");
                return Vec::new();
            }
        };
        let names: BTreeSet<String> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .and_then(|file| task.job_name_from_log(file))
            })
            .collect();
        names.into_iter().collect()
    }

    /// Jobs with a log but no running process.
    pub async fn query_stopped(&self, task: TaskType) -> Vec<String> {
        let running: BTreeSet<String> = self
            .query_running(task)
            .await
            .into_iter()
            .map(|j| j.name)
            .collect();
        self.list_logs(task)
            .into_iter()
            .filter(|name| !running.contains(name))
            .collect()
    }

    /// Running jobs first, then stopped ones; each name appears once.
    pub async fn query_all(&self, task: TaskType) -> Vec<JobSummary> {
        let running = self.query_running(task).await;
        let mut seen = BTreeSet::new();
        let mut jobs = Vec::new();
        for job in running {
            if seen.insert(job.name.clone()) {
                jobs.push(JobSummary {
                    name: job.name,
                    status: JobStatus::Running,
                    pid: Some(job.pid),
                });
            }
        }
        for name in self.list_logs(task) {
            if seen.insert(name.clone()) {
                jobs.push(JobSummary {
                    name,
                    status: JobStatus::Stopped,
                    pid: None,
                });
            }
        }
        jobs
    }

    /// Kill every running process of the job. Returns `false` when nothing
    /// was running; stopping a stopped job is not an error.
    pub async fn stop(&self, name: &str, task: TaskType) -> Result<bool, JobError> {
        let name = name.trim();
        let targets: Vec<RunningJob> = self
            .query_running(task)
            .await
            .into_iter()
            .filter(|j| j.name == name)
            .collect();
        if targets.is_empty() {
            debug!(job = %name, task = %task, "Stop requested for a job that is not running");
            return Ok(false);
        }
        for job in &targets {
            match self.registry.kill(job.pid) {
                Ok(()) => info!(job = %name, pid = job.pid, "Killed training job"),
                Err(e) if is_no_such_process(&e) => {
                    debug!(job = %name, pid = job.pid, "Job exited before it was killed");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    pub async fn check_job_name(&self, name: &str, task: TaskType) -> NameCheck {
        let name = name.trim();
        if !is_valid_job_name(name) {
            return NameCheck::Invalid;
        }
        let jobs = self.query_all(task).await;
        match jobs.iter().find(|j| j.name == name) {
            Some(job) if job.status == JobStatus::Running => NameCheck::Running,
            Some(_) => NameCheck::Resume,
            None => NameCheck::New,
        }
    }

    /// Last `n` trimmed lines of the job's log; empty if it has none yet.
    pub fn tail_log(&self, name: &str, task: TaskType, n: usize) -> Result<Vec<String>, JobError> {
        let name = name.trim();
        if !is_valid_job_name(name) {
            return Err(JobError::InvalidName {
                name: name.to_string(),
            });
        }
        let path = self.log_path(name, task);
        match persistence::tail_lines(&path, n) {
            Ok(lines) => Ok(lines),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(source) => Err(JobError::LogFile { path, source }),
        }
    }

    /// State of a job launched by this orchestrator, `New` otherwise.
    pub async fn tracked_state(&self, name: &str, task: TaskType) -> JobState {
        self.tracked
            .lock()
            .await
            .get(&(task, name.to_string()))
            .copied()
            .unwrap_or(JobState::New)
    }
}
