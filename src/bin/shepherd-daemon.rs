use anyhow::Context;
use clap::Parser;
use shepherd::daemon::Daemon;
use shepherd::ipc::{IpcServer, DEFAULT_SOCKET_PATH};
use shepherd::process::SupervisorConfig;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Supervisor daemon: keeps the apps of an ecosystem file running
#[derive(Parser, Debug)]
#[command(name = "shepherd-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Ecosystem file (.json, .toml or .js)
    #[arg(short, long)]
    config: PathBuf,

    /// Unix socket to serve control requests on
    #[arg(short, long, env = "SHEPHERD_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Load the config but wait for an explicit `start`
    #[arg(long)]
    no_autostart: bool,

    /// Upper bound for launching one instance
    #[arg(long, default_value_t = 10)]
    spawn_timeout_secs: u64,

    /// How often CPU and memory usage are sampled
    #[arg(long, default_value_t = 2000)]
    stats_interval_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = SupervisorConfig {
        spawn_timeout: Duration::from_secs(args.spawn_timeout_secs),
        stats_interval: Duration::from_millis(args.stats_interval_ms.max(1)),
    };

    let daemon = Daemon::load(&args.config, config)
        .with_context(|| format!("Failed to load config {}", args.config.display()))?;

    let mut server = IpcServer::with_socket_path(&args.socket);
    server
        .start()
        .with_context(|| format!("Failed to listen on {}", args.socket.display()))?;

    let signals = shutdown_signal()?;

    if args.no_autostart {
        info!("Autostart disabled, waiting for commands");
    } else {
        daemon.autostart().await;
    }

    let stats = daemon.supervisor().spawn_stats_task();
    info!(pid = std::process::id(), "Daemon started");

    let result = daemon.run(&server, signals).await;

    stats.abort();
    server.stop().context("Failed to remove socket")?;
    info!("Daemon stopped");

    result.context("IPC server failed")
}

/// Resolves on SIGTERM or SIGINT
fn shutdown_signal() -> anyhow::Result<impl Future<Output = ()>> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    Ok(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    })
}
