//! Process-level server: builds the router, binds the device-facing
//! WebSocket endpoint plus a small health/metrics HTTP surface, and
//! drives graceful shutdown.

use std::sync::Arc;

use axum::extract::State;
use axum::{routing::get, Router};
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::collab::{DeviceAuth, DevicePubSub, DeviceStore, MetricsSink, TelemetrySink};
use crate::config::ServerConfig;
use crate::gateway::GatewayState;
use crate::ws;

pub struct GatewayServer {
    config: ServerConfig,
    state: Arc<GatewayState>,
    shutdown_tx: watch::Sender<bool>,
}

impl GatewayServer {
    pub fn new(
        config: ServerConfig,
        auth: Arc<dyn DeviceAuth>,
        store: Arc<dyn DeviceStore>,
        pubsub: Arc<dyn DevicePubSub>,
        telemetry: Arc<dyn TelemetrySink>,
        metrics_sink: Arc<dyn MetricsSink>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let state = Arc::new(GatewayState::new(auth, store, pubsub, telemetry, metrics_sink, config.clone())?);
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self { config, state, shutdown_tx })
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        let device_app = Router::new()
            .route("/wssk/:partition_key/:row_key", get(ws::ws_handler))
            .with_state(Arc::clone(&self.state))
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

        let admin_app = Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(Arc::clone(&self.state));

        let device_listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        info!("devgw listening on {} (device WebSocket endpoint)", self.config.bind_addr);
        let admin_listener = tokio::net::TcpListener::bind(self.config.metrics_bind_addr).await?;
        info!("devgw listening on {} (health/metrics)", self.config.metrics_bind_addr);

        let mut device_shutdown_rx = self.shutdown_tx.subscribe();
        let mut admin_shutdown_rx = self.shutdown_tx.subscribe();

        let device_fut = axum::serve(device_listener, device_app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = device_shutdown_rx.changed().await;
            });
        let admin_fut = axum::serve(admin_listener, admin_app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = admin_shutdown_rx.changed().await;
            });

        let (device_res, admin_res) = tokio::join!(device_fut, admin_fut);
        device_res?;
        admin_res?;

        Ok(())
    }

    /// Idempotent: a repeated send on an already-true `watch` channel is
    /// a no-op, matching the teacher's shutdown idempotence (spec §5
    /// resource discipline: teardown must tolerate re-entry).
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn metrics_handler(State(state): State<Arc<GatewayState>>) -> String {
    state.metrics.export_prometheus()
}
