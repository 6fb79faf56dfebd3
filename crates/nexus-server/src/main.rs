//! # nexus-server
//!
//! Binary entry point: loads configuration from the environment, starts the
//! chat and admin listeners, and runs until Ctrl+C.

use tracing::info;
use tracing_subscriber::EnvFilter;

use nexus_server::{Server, ServerConfig, ServerContext};

fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,nexus_server=debug")),
        )
        .init();

    info!("Starting Nexus chat server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // The runtime is sized from configuration, so it is built by hand.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads.max(1))
        .thread_name("nexus-worker")
        .enable_all()
        .build()?;

    runtime.block_on(run(config))
}

async fn run(config: ServerConfig) -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 3. Initialize shared state and the engine
    // -----------------------------------------------------------------------
    let ctx = ServerContext::new(config).await?;
    let mut server = Server::new(ctx.clone());
    server.start().await?;

    info!(
        chat = ?server.local_addr(),
        admin = ?server.admin_addr(),
        rooms = ctx.rooms.count().await,
        "Listening"
    );

    // -----------------------------------------------------------------------
    // 4. Run until Ctrl+C
    // -----------------------------------------------------------------------
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down");

    server.stop().await;
    info!("{}", ctx.stats.generate_report());
    Ok(())
}
