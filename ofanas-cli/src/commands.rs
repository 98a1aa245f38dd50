//! CLI subcommand handlers.

use std::path::Path;

use anyhow::Context;

use ofanas_core::{OfanasConfig, TaskType};
use ofanas_jobs::{HostList, JobOrchestrator, JobSummary, LaunchRequest, NameCheck};
use ofanas_ml::{CandidateSpace, CheckpointStore, SweepDims, TrainingStage, narrow_sweep};

use crate::{Commands, ConfigAction};

fn load(workspace: &Path) -> anyhow::Result<OfanasConfig> {
    let config = ofanas_core::load_config(Some(workspace), None)
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
    config.validate()?;
    Ok(config)
}

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, workspace: &Path) -> anyhow::Result<()> {
    if let Commands::Config { action } = command {
        return handle_config(action, workspace);
    }
    let config = load(workspace)?;
    match command {
        Commands::Train {
            name,
            task,
            nodes,
            hosts,
            bs,
            lr,
        } => {
            let orch = JobOrchestrator::new(&config, workspace);
            let mut request = train_request(&config, task, name, nodes, hosts);
            if let Some(bs) = bs {
                request.batch_size = bs;
            }
            if let Some(lr) = lr {
                request.learning_rate = lr;
            }
            let handle = orch.submit(&request).await?;
            println!(
                "Started {} ({}) as pid {}, logging to {}",
                handle.name,
                handle.task,
                handle.pid,
                handle.log_path.display()
            );
            Ok(())
        }
        Commands::Jobs { task, json } => {
            let orch = JobOrchestrator::new(&config, workspace);
            let jobs = orch.query_all(task).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
            } else {
                for line in job_table(&jobs) {
                    println!("{line}");
                }
            }
            Ok(())
        }
        Commands::Stop { name, task } => {
            let orch = JobOrchestrator::new(&config, workspace);
            tracing::info!(job = %name, task = %task, "Stop requested");
            if orch.stop(&name, task).await? {
                println!("Stopped {name} ({task})");
            } else {
                println!("{name} ({task}) is not running");
            }
            Ok(())
        }
        Commands::Check { name, task } => {
            let orch = JobOrchestrator::new(&config, workspace);
            let check = orch.check_job_name(&name, task).await;
            println!("{} {}", check.code(), describe(check));
            Ok(())
        }
        Commands::Logs { name, task, lines } => {
            let orch = JobOrchestrator::new(&config, workspace);
            let n = lines.unwrap_or(config.dashboard.log_tail_lines);
            for line in orch.tail_log(&name, task, n)? {
                println!("{line}");
            }
            Ok(())
        }
        Commands::Checkpoints { task } => {
            let paths = config.paths.resolved(workspace);
            let store = CheckpointStore::new(paths.checkpoint_dir);
            let entries = store.list(task.as_ref().map(TaskType::as_str))?;
            if entries.is_empty() {
                println!("No checkpoints in {}", store.dir().display());
            }
            for entry in entries {
                let marker = if entry.is_best { " (best)" } else { "" };
                println!("{}{}\t{}", entry.name, marker, entry.path.display());
            }
            Ok(())
        }
        Commands::Plan { stage } => {
            for line in plan_lines(stage, &config)? {
                println!("{line}");
            }
            Ok(())
        }
        Commands::Config { .. } => Ok(()),
    }
}

fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".ofanas");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&OfanasConfig::default())?;
            std::fs::write(&config_path, &toml_str)
                .with_context(|| format!("writing {}", config_path.display()))?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load(workspace)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// `--hosts` replaces the node selection entirely, process count included.
fn train_request(
    config: &OfanasConfig,
    task: TaskType,
    name: String,
    nodes: Vec<String>,
    hosts: Option<String>,
) -> LaunchRequest {
    if let Some(hosts) = hosts {
        return LaunchRequest::on_hosts(task, name, HostList::raw(hosts));
    }
    let nodes = if nodes.is_empty() {
        config.dashboard.nodes.clone()
    } else {
        nodes
    };
    LaunchRequest::on_nodes(task, name, &nodes, config.launcher.slots_per_node)
}

fn describe(check: NameCheck) -> &'static str {
    match check {
        NameCheck::Invalid => "invalid: name must be one token without slashes",
        NameCheck::Running => "invalid: a job with this name is running",
        NameCheck::Resume => "resume: continues the stopped job",
        NameCheck::New => "new",
    }
}

fn job_table(jobs: &[JobSummary]) -> Vec<String> {
    if jobs.is_empty() {
        return vec!["No jobs".to_string()];
    }
    jobs.iter()
        .map(|job| match job.pid {
            Some(pid) => format!("{job}\tpid {pid}"),
            None => job.to_string(),
        })
        .collect()
}

/// The stage's candidate space followed by every subnet its validation
/// sweep evaluates.
fn plan_lines(stage: TrainingStage, config: &OfanasConfig) -> anyhow::Result<Vec<String>> {
    let full = CandidateSpace::from(&config.space);
    let space = stage.training_space(&full);
    let mut dims = SweepDims::default();
    narrow_sweep(stage, &space, &mut dims)?;
    let settings = space.enumerate(&dims);

    let width = match space.pinned_width {
        Some(i) => match space.width_mults.get(i) {
            Some(w) => format!("[{w}] (index {i})"),
            None => format!("index {i}"),
        },
        None => format!("{:?}", space.width_mults),
    };
    let mut lines = vec![
        format!("stage: {stage}"),
        format!("image_sizes: {:?}", space.image_sizes),
        format!("kernel_sizes: {:?}", space.kernel_sizes),
        format!("expand_ratios: {:?}", space.expand_ratios),
        format!("depths: {:?}", space.depths),
        format!("scales: {:?}", space.scales),
        format!("width_mults: {width}"),
        format!("validation subnets: {}", settings.len()),
    ];
    lines.extend(settings.into_iter().map(|s| format!("  {}", s.name)));
    Ok(lines)
}
