//! `gearboxd`: the long-lived engine process.
//!
//! Local mode: the in-process memory transport carries both the engine's
//! RPC surface and any workers registered by embedding code.

use std::sync::Arc;

use gearbox_engine::{api, EngineConfig, JobEngine};
use gearbox_rpc::memory::MemoryTransport;
use gearbox_rpc::transport::Transport;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EngineConfig::from_env();
    info!(instance = %config.instance, "starting gearboxd");

    let pool = gearbox_db::create_pool(&config.database_url).await?;
    gearbox_db::run_migrations(&pool).await?;
    gearbox_db::health_check(&pool).await?;
    let store = Arc::new(gearbox_db::JobRepo::new(pool));

    let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
    transport.set_client_id(&config.instance).await?;

    let engine = JobEngine::new(store, transport, config);
    api::register_handlers(Arc::clone(&engine)).await?;

    let sweeper = tokio::spawn(Arc::clone(&engine).run());

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    engine.stop();
    sweeper.await?;
    Ok(())
}
