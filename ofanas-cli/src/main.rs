//! ofanas CLI: launch, watch and stop Once-for-All training jobs.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use ofanas_core::TaskType;
use ofanas_ml::TrainingStage;

/// Once-for-All supernet training: job control and stage planning
#[derive(Parser, Debug)]
#[command(name = "ofanas", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (holds `.ofanas/config.toml`, logs and checkpoints)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Launch a training job on the selected nodes
    Train {
        /// Job name; reusing a stopped job's name resumes it
        name: String,
        /// Task type: class or stereo
        #[arg(short, long, default_value = "class")]
        task: TaskType,
        /// Nodes to run on (defaults to the configured node list)
        #[arg(short, long, value_delimiter = ',')]
        nodes: Vec<String>,
        /// Raw `-H` host list, overrides the one derived from --nodes
        #[arg(long)]
        hosts: Option<String>,
        /// Per-replica batch size (task default if omitted)
        #[arg(long)]
        bs: Option<u32>,
        /// Learning rate (task default if omitted)
        #[arg(long)]
        lr: Option<f64>,
    },
    /// List running and stopped jobs
    Jobs {
        #[arg(short, long, default_value = "class")]
        task: TaskType,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Kill a running job
    Stop {
        name: String,
        #[arg(short, long, default_value = "class")]
        task: TaskType,
    },
    /// Check whether a job name is new, resumable, running or invalid
    Check {
        name: String,
        #[arg(short, long, default_value = "class")]
        task: TaskType,
    },
    /// Show the tail of a job's log
    Logs {
        name: String,
        #[arg(short, long, default_value = "class")]
        task: TaskType,
        /// Number of lines (configured default if omitted)
        #[arg(short = 'n', long)]
        lines: Option<usize>,
    },
    /// List saved supernet weights
    Checkpoints {
        /// Only weights of this task type
        #[arg(short, long)]
        task: Option<TaskType>,
    },
    /// Show the candidate space and validation sweep of a training stage
    Plan {
        /// full, depth, expand, scale or width
        stage: TrainingStage,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write a default `.ofanas/config.toml` into the workspace
    Init,
    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("org", "dist-automl", "ofanas")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "ofanas.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    tracing::debug!(workspace = %workspace.display(), "Resolved workspace");
    commands::handle_command(cli.command, &workspace).await
}
