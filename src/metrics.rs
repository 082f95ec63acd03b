//! Prometheus metrics for the gateway process: connection, handshake,
//! deploy and tick counters, exported as text for scraping.

use prometheus::{
    register_counter_with_registry, register_gauge_with_registry, Counter, Gauge, Registry,
};
use std::sync::Arc;

pub struct GatewayMetrics {
    pub connections_total: Counter,
    pub handshake_failures_total: Counter,
    pub active_sessions: Gauge,
    pub deploy_attempts_total: Counter,
    pub deploy_successes_total: Counter,
    pub deploy_failures_total: Counter,
    pub protocol_warnings_total: Counter,
    pub ticks_total: Counter,
    pub registry: Arc<Registry>,
}

impl GatewayMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Arc::new(Registry::new());

        let connections_total = register_counter_with_registry!(
            "devgw_connections_total",
            "Total number of device connections accepted",
            registry
        )?;

        let handshake_failures_total = register_counter_with_registry!(
            "devgw_handshake_failures_total",
            "Total number of handshake/auth failures",
            registry
        )?;

        let active_sessions = register_gauge_with_registry!(
            "devgw_active_sessions",
            "Number of currently authenticated device sessions",
            registry
        )?;

        let deploy_attempts_total = register_counter_with_registry!(
            "devgw_deploy_attempts_total",
            "Total number of deploy hash-check attempts",
            registry
        )?;

        let deploy_successes_total = register_counter_with_registry!(
            "devgw_deploy_successes_total",
            "Total number of successful program installs",
            registry
        )?;

        let deploy_failures_total = register_counter_with_registry!(
            "devgw_deploy_failures_total",
            "Total number of deploy failures (backoff triggered)",
            registry
        )?;

        let protocol_warnings_total = register_counter_with_registry!(
            "devgw_protocol_warnings_total",
            "Total number of non-fatal protocol warnings",
            registry
        )?;

        let ticks_total = register_counter_with_registry!(
            "devgw_ticks_total",
            "Total number of periodic stats ticks flushed",
            registry
        )?;

        Ok(Self {
            connections_total,
            handshake_failures_total,
            active_sessions,
            deploy_attempts_total,
            deploy_successes_total,
            deploy_failures_total,
            protocol_warnings_total,
            ticks_total,
            registry,
        })
    }

    pub fn export_prometheus(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new().unwrap()
    }
}
