//! CLI commands implementation.
//!
//! This module contains the CLI parser and dispatches to command-specific
//! modules.

mod executor;
mod serve;
mod status;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::{QueueType, SettingsOverrides};

#[derive(Parser)]
#[command(name = "pydpiper")]
#[command(about = "Distributed pipeline scheduler for image-registration workloads")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

/// Scheduler settings exposed as flags, layered over the site config file.
#[derive(Args, Debug, Clone, Default)]
struct SettingsArgs {
    /// Minutes without a heartbeat before an executor is declared lost
    #[arg(long)]
    latency_tolerance: Option<u64>,

    /// Minutes a batch-launched executor waits before first contact
    #[arg(long)]
    executor_start_delay: Option<u64>,

    /// Maximum memory in GB per executor
    #[arg(long)]
    mem: Option<f64>,

    /// Batch-system resource variable for memory requests (e.g. "vmem")
    #[arg(long)]
    mem_request_variable: Option<String>,

    /// SGE parallel environment for multi-core executors
    #[arg(long)]
    pe: Option<String>,

    /// Executors run one stage at a time using their full allotment
    #[arg(long)]
    greedy: bool,

    /// Maximum image pairs considered by LSQ12 builders
    #[arg(long)]
    lsq12_max_pairs: Option<u32>,

    /// Seconds between executor heartbeats
    #[arg(long)]
    heartbeat_interval: Option<u64>,

    /// Minutes an idle executor waits for work before draining
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Worker cores per executor (0 = detect)
    #[arg(long)]
    cores: Option<u32>,

    /// Substrate executors run on
    #[arg(long, value_enum)]
    queue_type: Option<QueueType>,
}

impl SettingsArgs {
    fn into_overrides(self) -> SettingsOverrides {
        SettingsOverrides {
            latency_tolerance: self.latency_tolerance,
            executor_start_delay: self.executor_start_delay,
            mem: self.mem,
            mem_request_variable: self.mem_request_variable,
            pe: self.pe,
            greedy: self.greedy,
            lsq12_max_pairs: self.lsq12_max_pairs,
            heartbeat_interval: self.heartbeat_interval,
            idle_timeout: self.idle_timeout,
            cores: self.cores,
            queue_type: self.queue_type,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline server over a pipeline description file
    Serve {
        /// Pipeline description file (TOML)
        #[arg(short, long)]
        pipeline: PathBuf,

        /// Working directory for stage logs and the completion log
        #[arg(long, default_value = ".")]
        work_dir: PathBuf,

        /// Port to listen on (0 picks an ephemeral port)
        #[arg(long, default_value = "0")]
        port: u16,

        /// Executors to launch on the configured queue after startup
        #[arg(long, default_value = "0")]
        num_executors: u32,

        #[command(flatten)]
        settings: SettingsArgs,
    },

    /// Run an executor agent against a pipeline server
    Executor {
        /// Server URI (defaults to the uri file under the working directory)
        #[arg(long)]
        uri: Option<String>,

        /// Working directory shared with the server
        #[arg(long, default_value = ".")]
        work_dir: PathBuf,

        /// Memory allotment in GB (defaults to the configured per-executor max)
        #[arg(long)]
        mem: Option<f64>,

        /// Concurrent stage processes (defaults to detected cores)
        #[arg(long)]
        cores: Option<u32>,

        /// Run one stage at a time using the full allotment
        #[arg(long)]
        greedy: bool,

        /// Minutes to wait before first contacting the server
        #[arg(long, default_value = "0")]
        start_delay: u64,

        /// Minutes of idleness before draining (defaults to the configured value)
        #[arg(long)]
        idle_timeout: Option<u64>,

        /// Batch walltime in minutes, for proactive draining
        #[arg(long)]
        walltime: Option<u64>,
    },

    /// Query a running pipeline server for progress counts
    Status {
        /// Server URI (defaults to the uri file under the working directory)
        #[arg(long)]
        uri: Option<String>,

        /// Working directory the server was started in
        #[arg(long, default_value = ".")]
        work_dir: PathBuf,
    },
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve {
            pipeline,
            work_dir,
            port,
            num_executors,
            settings,
        } => serve::execute(pipeline, work_dir, port, num_executors, settings.into_overrides()).await,
        Commands::Executor {
            uri,
            work_dir,
            mem,
            cores,
            greedy,
            start_delay,
            idle_timeout,
            walltime,
        } => {
            executor::execute(
                uri,
                work_dir,
                mem,
                cores,
                greedy,
                start_delay,
                idle_timeout,
                walltime,
            )
            .await
        }
        Commands::Status { uri, work_dir } => status::execute(uri, work_dir).await,
    }
}
