//! echod: a concurrent TCP echo server
//!
//! Whatever bytes arrive on a connection are written back verbatim, in
//! order, with no framing or transformation.
//!
//! Features:
//! - One task per connection with per-connection fault isolation
//! - Connection registry with a configurable concurrency limit
//! - Graceful shutdown: drain with timeout, then forced close
//! - Lifecycle events for external subscribers
//! - Configuration via CLI arguments or TOML file

mod config;
mod connection;
mod error;
mod events;
mod listener;
mod registry;
mod server;

use config::Config;
use server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        max_connections = config.max_connections,
        buffer_size = config.buffer_size,
        idle_timeout = config.idle_timeout_secs,
        drain_timeout = config.drain_timeout_secs,
        "Starting echod"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.enable_all().build()?;

    runtime.block_on(run(config))
}

/// Run the server until an interrupt signal arrives.
async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::new(config);
    server.start().await?;

    tokio::signal::ctrl_c().await?;
    info!(
        live_connections = server.connection_count(),
        "Interrupt received, shutting down"
    );

    server.stop().await?;
    Ok(())
}
