//! End-to-end launch against a stub `mpirun`, observed through `/proc`.

#![cfg(target_os = "linux")]

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ofanas_core::{LauncherConfig, OfanasConfig, TaskType};
use ofanas_jobs::{JobOrchestrator, JobState, LaunchRequest, NameCheck, ProcfsRegistry};
use tempfile::TempDir;

fn install_stub_mpirun(mpi_home: &Path) {
    let bin = mpi_home.join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    let script = bin.join("mpirun");
    std::fs::write(&script, "#!/bin/sh\necho \"stub launcher: $*\"\nsleep 30\n").unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
}

#[tokio::test]
async fn test_launch_query_and_stop() {
    let workspace = TempDir::new().unwrap();
    let mpi_home = workspace.path().join("openmpi");
    install_stub_mpirun(&mpi_home);

    let config = OfanasConfig {
        launcher: LauncherConfig {
            mpi_home: mpi_home.clone(),
            ..LauncherConfig::default()
        },
        ..OfanasConfig::default()
    };
    let orch = JobOrchestrator::with_registry(
        &config,
        workspace.path(),
        Arc::new(ProcfsRegistry::default()),
    );

    let request = LaunchRequest::on_nodes(TaskType::Class, "expA", &["h1", "h2"], 2);
    assert_eq!(orch.check_job_name("expA", TaskType::Class).await, NameCheck::New);
    let mut handle = orch.submit(&request).await.unwrap();

    assert!(workspace.path().join("logs").join("expA_class.log").exists());
    let np = handle.argv.iter().position(|a| a == "-np").unwrap();
    assert_eq!(handle.argv[np + 1], "4");
    assert_eq!(handle.state(), JobState::Running);

    let mut found = false;
    for _ in 0..50 {
        let running = orch.query_running(TaskType::Class).await;
        let logged = !orch.tail_log("expA", TaskType::Class, 5).unwrap().is_empty();
        if logged && running.iter().any(|j| j.pid == handle.pid && j.name == "expA") {
            found = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(found, "launched job not visible in /proc");
    assert_eq!(
        orch.check_job_name("expA", TaskType::Class).await,
        NameCheck::Running
    );

    assert!(orch.stop("expA", TaskType::Class).await.unwrap());
    let state = tokio::time::timeout(Duration::from_secs(10), handle.wait())
        .await
        .unwrap();
    assert_eq!(state, JobState::Stopped { exit_code: None });
    assert_eq!(
        orch.tracked_state("expA", TaskType::Class).await,
        JobState::Stopped { exit_code: None }
    );

    assert!(!orch.stop("expA", TaskType::Class).await.unwrap());
    assert_eq!(
        orch.check_job_name("expA", TaskType::Class).await,
        NameCheck::Resume
    );

    let log = orch.tail_log("expA", TaskType::Class, 5).unwrap();
    assert!(log.iter().any(|line| line.starts_with("stub launcher:")));
}
