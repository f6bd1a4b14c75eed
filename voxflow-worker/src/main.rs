//! Voxflow worker binary: loads configuration, builds providers, registers
//! the transcription workflows on the task queue, and serves the health
//! endpoint until interrupted.

use clap::Parser;
use voxflow_worker::config::WorkerConfig;
use voxflow_worker::worker::WorkerHost;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the provider configuration file (defaults to the
    /// conventional providers.yaml lookup).
    #[arg(short, long)]
    config: Option<String>,

    /// Task queue this worker consumes.
    #[arg(long)]
    task_queue: Option<String>,

    /// Port for the HTTP health endpoint.
    #[arg(long)]
    health_port: Option<u16>,

    /// Logging filter (overridden by RUST_LOG when set).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = WorkerConfig::from_env();
    if let Some(path) = args.config {
        config.providers_config_path = Some(path);
    }
    if let Some(task_queue) = args.task_queue {
        config.task_queue = task_queue;
    }
    if let Some(port) = args.health_port {
        config.health_port = port;
    }

    let host = WorkerHost::build(config).await?;
    host.run().await
}
