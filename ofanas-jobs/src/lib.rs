//! # ofanas jobs
//!
//! Runs progressive-shrinking training as MPI jobs: builds `mpirun`
//! command lines, launches them with output appended to a per-job log,
//! finds running jobs in the process table, and stops them.

pub mod launcher;
pub mod orchestrator;
pub mod registry;

pub use launcher::{HostList, LaunchRequest, MpiLauncher};
pub use orchestrator::{
    JobHandle, JobOrchestrator, JobState, JobStatus, JobSummary, NameCheck, is_valid_job_name,
};
pub use registry::{
    ProcessEntry, ProcessRegistry, ProcfsRegistry, PsRegistry, RunningJob, default_registry,
    parse_ps_output,
};
