//! Demo binary wiring the session core to a real WebSocket transport and a
//! real PTY collaborator.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use session_core::config::{self, CliOverrides};
use session_core::maintenance;
use session_core::registry::Registry;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "cmdr-server", about = "Persistent terminal session server")]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:7880")]
    listen: SocketAddr,

    /// Optional JSON config file; CLI flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    state_dir: Option<PathBuf>,

    #[arg(long)]
    buffer_capacity: Option<usize>,

    #[arg(long)]
    save_interval_secs: Option<u64>,

    #[arg(long)]
    cleanup_interval_secs: Option<u64>,

    #[arg(long)]
    max_inactive_age_secs: Option<u64>,

    #[arg(long)]
    soft_session_cap: Option<usize>,

    #[arg(long)]
    replay_chunk_size: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = config::resolve(
        cli.config.as_deref(),
        &CliOverrides {
            state_dir: cli.state_dir,
            buffer_capacity: cli.buffer_capacity,
            save_interval_secs: cli.save_interval_secs,
            cleanup_interval_secs: cli.cleanup_interval_secs,
            max_inactive_age_secs: cli.max_inactive_age_secs,
            soft_session_cap: cli.soft_session_cap,
            replay_chunk_size: cli.replay_chunk_size,
        },
    );

    let registry = Registry::new(&config);
    if let Err(e) = registry.restore_from_disk() {
        tracing::error!(error = %e, "failed to restore sessions from disk");
        eprintln!("failed to restore sessions from disk: {e}");
        std::process::exit(1);
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let maintenance_task = tokio::spawn(maintenance::run(
        registry.clone(),
        config.clone(),
        shutdown_rx,
    ));

    let app = cmdr_server::app(cmdr_server::AppState {
        registry: registry.clone(),
        config: config.clone(),
    });

    tracing::info!(listen = %cli.listen, state_dir = ?config.state_dir, "starting server");
    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    axum::serve(listener, app).await?;

    let _ = shutdown_tx.send(());
    let _ = maintenance_task.await;
    Ok(())
}
