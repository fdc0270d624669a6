//! jobmigd — the job migration daemon.
//!
//! Loads a cluster description, launches its running jobs through the
//! checkpoint shim, and runs the migration agent against it until
//! interrupted. Final cycle statistics are printed as JSON on exit.
//!
//! # Usage
//!
//! ```text
//! jobmigd --cluster cluster.toml --params-file sched.params
//! ```
//!
//! SIGHUP re-reads `--params-file` and reconfigures the agent. Ctrl-C or
//! SIGTERM stops it.

mod cluster;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use jobmig_checkpoint::CheckpointShim;
use jobmig_checkpoint::shim::DEFAULT_START_SCRIPT;
use jobmig_core::ClusterRegistry;
use jobmig_scheduler::{AgentHandle, MigrationAgent};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::cluster::ClusterFile;

const DEFAULT_LOG_FILTER: &str = "info,jobmigd=debug,jobmig=debug";

#[derive(Parser)]
#[command(name = "jobmigd", about = "Job migration scheduler daemon")]
struct Cli {
    /// Cluster description (TOML).
    #[arg(long)]
    cluster: PathBuf,

    /// Scheduler parameters. Overrides the cluster file and --params-file.
    #[arg(long)]
    params: Option<String>,

    /// File holding scheduler parameters, re-read on SIGHUP.
    #[arg(long)]
    params_file: Option<PathBuf>,

    /// Script used to wrap job launches for checkpointing.
    #[arg(long, default_value = DEFAULT_START_SCRIPT)]
    start_script: PathBuf,

    /// Log as JSON.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    if cli.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("jobmigd starting");

    let params = match (&cli.params, &cli.params_file) {
        (Some(params), _) => Some(params.clone()),
        (None, Some(path)) => Some(read_params(path)?),
        (None, None) => None,
    };

    let shim = CheckpointShim::new(&cli.start_script);
    let cluster = ClusterFile::from_file(&cli.cluster)?.into_cluster(params, &shim);

    let (agent, handle) = MigrationAgent::new(Arc::clone(&cluster.registry), cluster.transport);
    let agent_task = tokio::spawn(agent.run());

    let params_file = cli.params.is_none().then_some(cli.params_file).flatten();
    wait_for_signals(&handle, &cluster.registry, params_file).await?;

    handle.stop();
    let stats = agent_task.await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);

    info!("jobmigd stopped");
    Ok(())
}

fn read_params(path: &Path) -> anyhow::Result<String> {
    Ok(std::fs::read_to_string(path)?.trim().to_string())
}

/// Re-read the params file into the registry and flag the agent.
#[cfg(unix)]
async fn reload(handle: &AgentHandle, registry: &ClusterRegistry, params_file: Option<&Path>) {
    if let Some(path) = params_file {
        match read_params(path) {
            Ok(params) => {
                info!(path = ?path, "scheduler parameters re-read");
                registry.set_sched_params(params).await;
            }
            Err(e) => warn!(path = ?path, error = %e, "cannot re-read scheduler parameters"),
        }
    }
    handle.reconfigure();
}

/// Block until Ctrl-C or SIGTERM, handling SIGHUP along the way.
#[cfg(unix)]
async fn wait_for_signals(
    handle: &AgentHandle,
    registry: &ClusterRegistry,
    params_file: Option<PathBuf>,
) -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;

    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res?;
                info!("interrupt received");
                return Ok(());
            }
            _ = terminate.recv() => {
                info!("terminate received");
                return Ok(());
            }
            _ = hangup.recv() => {
                info!("hangup received, reconfiguring");
                reload(handle, registry, params_file.as_deref()).await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signals(
    _handle: &AgentHandle,
    _registry: &ClusterRegistry,
    _params_file: Option<PathBuf>,
) -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("interrupt received");
    Ok(())
}
