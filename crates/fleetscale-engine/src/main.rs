//! Fleetscale - build-agent autoscaler
//!
//! Runs the reconciliation engine against Hetzner Cloud and serves the admin
//! API until interrupted.

use std::sync::Arc;

use fleetscale_engine::{api, Engine, EngineConfig, HttpQueueClient};
use fleetscale_provider::{HetznerConfig, HetznerProvider};
use fleetscale_remote::DockerFactory;
use fleetscale_store::RocksStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,fleetscale=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting fleetscale");

    // Load configuration from environment
    let config = EngineConfig::from_env();
    config.validate()?;

    // Initialize store
    let store = Arc::new(RocksStore::open(&config.data_dir)?);
    tracing::info!(data_dir = %config.data_dir.display(), "Initialized RocksDB store");

    // Collaborators
    let provider = Arc::new(HetznerProvider::new(HetznerConfig::from_env()?)?);
    let remote = Arc::new(DockerFactory::new(&config.cert_dir).with_port(config.zombie.port));
    let queue = Arc::new(HttpQueueClient::new(&config.queue.server, &config.queue.token)?);
    tracing::info!(queue = %queue.base_url(), "Configured CI queue");

    let listen_addr = config.listen_addr.clone();
    let engine = Arc::new(Engine::new(config, store, provider, remote, queue));
    engine.start()?;

    // Start server
    let app = api::router(Arc::clone(&engine));
    tracing::info!(listen_addr = %listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;

    let cancel = engine.cancel_token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            cancel.cancel();
        })
        .await?;

    engine.shutdown().await;
    Ok(())
}
