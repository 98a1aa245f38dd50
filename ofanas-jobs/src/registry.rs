//! Process discovery and signalling.
//!
//! Running jobs are found by scanning the process table for the MPI
//! launcher of a task's entry script. The backend is pluggable so the
//! orchestrator can be tested without real processes.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use ofanas_core::{JobError, TaskType};

/// One row of the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    /// Command line, arguments separated by single spaces.
    pub args: String,
}

/// A training job found in the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningJob {
    pub pid: u32,
    pub name: String,
}

impl ProcessEntry {
    /// Recognise the `mpirun` process of a `task` job and extract its name:
    /// the value of `--name`, else the last argument.
    pub fn as_job(&self, task: TaskType) -> Option<RunningJob> {
        if !self.args.contains(task.entry_script()) || !self.args.contains("mpirun") {
            return None;
        }
        let tokens: Vec<&str> = self.args.split_whitespace().collect();
        let name = tokens
            .iter()
            .position(|t| *t == "--name")
            .and_then(|i| tokens.get(i + 1))
            .or_else(|| tokens.last())?;
        Some(RunningJob {
            pid: self.pid,
            name: (*name).to_string(),
        })
    }
}

#[async_trait]
pub trait ProcessRegistry: Send + Sync {
    /// Snapshot of the process table. Unreadable sources yield an empty or
    /// partial list, never an error.
    async fn list(&self) -> Vec<ProcessEntry>;

    /// Forcefully terminate `pid` (SIGKILL).
    fn kill(&self, pid: u32) -> Result<(), JobError>;
}

/// Reads `/proc/<pid>/cmdline` (Linux).
#[derive(Debug, Clone)]
pub struct ProcfsRegistry {
    root: PathBuf,
}

impl Default for ProcfsRegistry {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/proc"),
        }
    }
}

impl ProcfsRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ProcessRegistry for ProcfsRegistry {
    async fn list(&self) -> Vec<ProcessEntry> {
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) => {
                warn!(root = %self.root.display(), error = %e, "Cannot read process table");
                return Vec::new();
            }
        };
        let mut entries = Vec::new();
        while let Ok(Some(entry)) = dir.next_entry().await {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            // processes may exit between listing and reading
            let Ok(raw) = tokio::fs::read(entry.path().join("cmdline")).await else {
                continue;
            };
            let args = raw
                .split(|b| *b == 0)
                .filter(|part| !part.is_empty())
                .map(|part| String::from_utf8_lossy(part).into_owned())
                .collect::<Vec<_>>()
                .join(" ");
            if !args.is_empty() {
                entries.push(ProcessEntry { pid, args });
            }
        }
        entries.sort_by_key(|e| e.pid);
        entries
    }

    fn kill(&self, pid: u32) -> Result<(), JobError> {
        send_kill(pid)
    }
}

/// Runs `ps -ax -o pid=,args=`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PsRegistry;

#[async_trait]
impl ProcessRegistry for PsRegistry {
    async fn list(&self) -> Vec<ProcessEntry> {
        let output = tokio::process::Command::new("ps")
            .args(["-ax", "-o", "pid=,args="])
            .output()
            .await;
        match output {
            Ok(out) if out.status.success() => parse_ps_output(&String::from_utf8_lossy(&out.stdout)),
            Ok(out) => {
                warn!(status = %out.status, "ps exited with an error");
                Vec::new()
            }
            Err(e) => {
                warn!(error = %e, "Failed to run ps");
                Vec::new()
            }
        }
    }

    fn kill(&self, pid: u32) -> Result<(), JobError> {
        send_kill(pid)
    }
}

/// Parse `pid args...` lines. Lines without a numeric pid or without
/// arguments are skipped.
pub fn parse_ps_output(output: &str) -> Vec<ProcessEntry> {
    let mut skipped = 0usize;
    let entries: Vec<ProcessEntry> = output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let parsed = line.trim().split_once(char::is_whitespace).and_then(|(pid, args)| {
                let pid = pid.parse::<u32>().ok()?;
                let args = args.trim();
                (!args.is_empty()).then(|| ProcessEntry {
                    pid,
                    args: args.to_string(),
                })
            });
            if parsed.is_none() {
                skipped += 1;
            }
            parsed
        })
        .collect();
    if skipped > 0 {
        debug!(skipped, "Skipped malformed process lines");
    }
    entries
}

/// `/proc` where available, `ps` elsewhere.
pub fn default_registry() -> Arc<dyn ProcessRegistry> {
    if cfg!(target_os = "linux") {
        Arc::new(ProcfsRegistry::default())
    } else {
        Arc::new(PsRegistry)
    }
}

fn send_kill(pid: u32) -> Result<(), JobError> {
    #[cfg(unix)]
    {
        let pid_t = libc::pid_t::try_from(pid).map_err(|_| JobError::Signal {
            pid,
            source: io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"),
        })?;
        // SAFETY: kill(2) takes no pointers; any pid value is sound to pass.
        if unsafe { libc::kill(pid_t, libc::SIGKILL) } == 0 {
            Ok(())
        } else {
            Err(JobError::Signal {
                pid,
                source: io::Error::last_os_error(),
            })
        }
    }
    #[cfg(not(unix))]
    {
        Err(JobError::Signal {
            pid,
            source: io::Error::new(io::ErrorKind::Unsupported, "signals require a Unix host"),
        })
    }
}

/// Whether a signal failure means the process was already gone.
pub fn is_no_such_process(err: &JobError) -> bool {
    #[cfg(unix)]
    if let JobError::Signal { source, .. } = err {
        return source.raw_os_error() == Some(libc::ESRCH);
    }
    let _ = err;
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PS: &str = "\
    1 /sbin/init
  4242 /opt/openmpi/bin/mpirun --prefix /opt/openmpi -np 4 -H h1:2,h2:2 python -W ignore train_ofa_net.py --lr 0.04 --bs 16 --name expA
  4250 python -W ignore train_ofa_net.py --lr 0.04 --bs 16 --name expA
  5000 mpirun -np 2 python train_ofa_stereo.py --lr 0.001 --bs 1 --name depth1
garbage line
  77
";

    #[test]
    fn test_parse_ps_output_skips_malformed_lines() {
        let entries = parse_ps_output(PS);
        let pids: Vec<u32> = entries.iter().map(|e| e.pid).collect();
        assert_eq!(pids, vec![1, 4242, 4250, 5000]);
    }

    #[test]
    fn test_as_job_requires_launcher_and_script() {
        let entries = parse_ps_output(PS);
        let class: Vec<RunningJob> = entries
            .iter()
            .filter_map(|e| e.as_job(TaskType::Class))
            .collect();
        assert_eq!(
            class,
            vec![RunningJob {
                pid: 4242,
                name: "expA".into()
            }]
        );

        let stereo: Vec<String> = entries
            .iter()
            .filter_map(|e| e.as_job(TaskType::Stereo))
            .map(|j| j.name)
            .collect();
        assert_eq!(stereo, vec!["depth1".to_string()]);
    }

    #[test]
    fn test_as_job_falls_back_to_last_token() {
        let entry = ProcessEntry {
            pid: 9,
            args: "mpirun python train_ofa_net.py custom".into(),
        };
        assert_eq!(entry.as_job(TaskType::Class).unwrap().name, "custom");
    }

    #[tokio::test]
    async fn test_procfs_registry_reads_cmdline() {
        let dir = tempfile::tempdir().unwrap();
        let proc_dir = dir.path().join("123");
        std::fs::create_dir(&proc_dir).unwrap();
        std::fs::write(proc_dir.join("cmdline"), b"mpirun\0-np\04\0train_ofa_net.py\0--name\0r1\0").unwrap();
        std::fs::create_dir(dir.path().join("self")).unwrap();
        std::fs::create_dir(dir.path().join("456")).unwrap();

        let entries = ProcfsRegistry::new(dir.path()).list().await;
        assert_eq!(
            entries,
            vec![ProcessEntry {
                pid: 123,
                args: "mpirun -np 4 train_ofa_net.py --name r1".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_procfs_registry_missing_root() {
        let entries = ProcfsRegistry::new("/definitely/not/proc").list().await;
        assert!(entries.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_kill_missing_process_is_esrch() {
        // pid_max on Linux is at most 2^22
        let err = send_kill(4_194_304 + 17).unwrap_err();
        assert!(is_no_such_process(&err));
    }
}
