use std::sync::Arc;

use devgw::collab::{InMemoryAuth, InMemoryPubSub, InMemoryStore, NoopMetrics, NoopTelemetry};
use devgw::config::ServerConfig;
use devgw::server::GatewayServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = if let Ok(path) = std::env::var("DEVGW_CONFIG_PATH") {
        ServerConfig::from_toml(path)?
    } else {
        ServerConfig::from_env()?
    };

    // The auth/storage/pubsub/telemetry/metrics collaborators (spec §6)
    // are external services in production. The in-memory doubles are
    // wired here so the gateway runs standalone; swap in real
    // implementations at this seam.
    let server = GatewayServer::new(
        config,
        Arc::new(InMemoryAuth::default()),
        Arc::new(InMemoryStore::default()),
        Arc::new(InMemoryPubSub::default()),
        Arc::new(NoopTelemetry),
        Arc::new(NoopMetrics),
    )?;

    server.start().await?;

    Ok(())
}
