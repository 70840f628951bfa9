use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use scan_dispatch::config::{executable_dir, DispatcherConfig, RunnerConfig, DEFAULT_PARALLEL_JOBS};
use scan_dispatch::events::BroadcastSink;
use scan_dispatch::server::{self, AppState};
use scan_dispatch::store::ResultStore;
use scan_dispatch::{Dispatcher, ProcessRunner};

/// Queue and run external port scans, streaming their progress.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "scan-dispatch",
    version,
    about = "Queue and run external port scans with bounded parallelism, streaming their progress.",
    long_about = None
)]
struct Cli {
    /// Address for the HTTP API.
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:3001")]
    bind: String,

    /// Scans allowed to run at the same time (clamped to 1..=8).
    #[arg(long, env = "MAX_PARALLEL_JOBS", default_value_t = DEFAULT_PARALLEL_JOBS)]
    max_parallel_jobs: usize,

    /// Directory for persisted scan results.
    #[arg(long, env = "DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Explicit path to the scanner binary.
    #[arg(long, env = "SCANNER_BIN")]
    scanner_bin: Option<PathBuf>,

    /// Directory the conventional scanner locations are relative to.
    /// Defaults to the directory of this executable.
    #[arg(long, env = "SCANNER_BASE_DIR")]
    base_dir: Option<PathBuf>,

    /// Accept API requests from non-loopback peers.
    #[arg(long = "allow-remote", default_value_t = false)]
    allow_remote: bool,

    /// Broadcast buffer per event subscriber.
    #[arg(long = "event-buffer", default_value_t = 1024)]
    event_buffer: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scan_dispatch=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let base_dir = match cli.base_dir.clone() {
        Some(dir) => dir,
        None => executable_dir().context("failed to locate the scan-dispatch executable")?,
    };
    let mut runner_config = RunnerConfig::new(base_dir);
    runner_config.scanner_bin = cli.scanner_bin.clone();
    let dispatcher_config = DispatcherConfig::new(cli.max_parallel_jobs);

    info!(
        bind = %cli.bind,
        max_parallel_jobs = dispatcher_config.max_parallel_jobs,
        data_dir = %cli.data_dir.display(),
        scanner_bin = ?runner_config.scanner_bin,
        base_dir = %runner_config.base_dir.display(),
        allow_remote = cli.allow_remote,
        "scan-dispatch configuration"
    );

    let results = ResultStore::new(&cli.data_dir);
    results.ensure_dir().await?;

    let events = BroadcastSink::new(cli.event_buffer);
    let dispatcher = Dispatcher::spawn(
        dispatcher_config,
        Arc::new(ProcessRunner::new(runner_config)),
        Arc::new(events.clone()),
        results.clone(),
    );

    let state = AppState {
        dispatcher: dispatcher.clone(),
        events,
        results,
        allow_remote: cli.allow_remote,
    };

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
    };
    server::serve(&cli.bind, state, shutdown).await?;

    dispatcher.shutdown().await;
    Ok(())
}
