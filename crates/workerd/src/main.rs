use anyhow::{Context, Result};
use clap::Parser;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use workerd::server;
use workerd_types::BackendAddress;

const DEFAULT_SWEEP_INTERVAL_MS: u64 = 30_000;

#[derive(Debug, Parser)]
#[command(
    name = "workerd",
    version,
    about = "Shared backend process for port clients and the dashboard"
)]
struct Args {
    /// Socket path; overrides --runtime-dir and --name.
    #[arg(long)]
    socket: Option<PathBuf>,
    #[arg(long)]
    runtime_dir: Option<PathBuf>,
    #[arg(long)]
    name: Option<String>,
    /// How often closed endpoints are dropped from the registry.
    #[arg(long)]
    sweep_interval_ms: Option<u64>,
}

fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();
    let address = BackendAddress::resolve(args.socket.as_deref(), args.runtime_dir, args.name);
    let sweep_interval = Duration::from_millis(
        args.sweep_interval_ms
            .or_else(sweep_interval_from_env)
            .unwrap_or(DEFAULT_SWEEP_INTERVAL_MS)
            .max(1),
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    runtime.block_on(serve(address, sweep_interval))
}

async fn serve(address: BackendAddress, sweep_interval: Duration) -> Result<()> {
    let socket_path = address.socket_path();
    let listener = server::bind_backend_socket(&address).await?;
    info!("workerd listening on {}", socket_path.display());

    let backend = workerd::shared_backend(&address);
    let outcome = server::run(listener, backend, sweep_interval).await;

    if socket_path.exists() {
        let _ = fs::remove_file(&socket_path);
    }
    info!("workerd shutdown complete");
    outcome
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("WORKERD_LOG")
                .or_else(|_| std::env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string()),
        )
        .try_init();
}

fn sweep_interval_from_env() -> Option<u64> {
    let raw = std::env::var("WORKERD_SWEEP_INTERVAL_MS").ok()?;
    raw.trim().parse::<u64>().ok()
}
