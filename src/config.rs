//! Layered configuration for the gateway process.

use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, time::Duration};

use crate::deploy::BYTECODE_MAX_PKT;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,

    /// Metrics/health HTTP surface, kept separate from the device-facing
    /// WebSocket port so it can sit behind a different network policy.
    pub metrics_bind_addr: SocketAddr,

    /// Interval between `DeviceSession` activity ticks.
    pub tick_interval_secs: u64,

    /// Chunk size used by the deploy engine when streaming a program
    /// body to the device. Defaults to 192 bytes; only lowering it is
    /// safe, since the device's receive buffer is sized to that constant.
    pub deploy_chunk_size: usize,

    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7880".parse().unwrap(),
            metrics_bind_addr: "0.0.0.0:7881".parse().unwrap(),
            tick_interval_secs: 2,
            deploy_chunk_size: BYTECODE_MAX_PKT,
            shutdown_timeout_secs: 30,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("DEVGW_BIND_ADDR") {
            config.bind_addr = addr.parse()?;
        }

        if let Ok(addr) = std::env::var("DEVGW_METRICS_BIND_ADDR") {
            config.metrics_bind_addr = addr.parse()?;
        }

        if let Ok(secs) = std::env::var("DEVGW_TICK_INTERVAL_SECS") {
            config.tick_interval_secs = secs.parse()?;
        }

        if let Ok(size) = std::env::var("DEVGW_DEPLOY_CHUNK_SIZE") {
            config.deploy_chunk_size = size.parse()?;
        }

        if let Ok(secs) = std::env::var("DEVGW_SHUTDOWN_TIMEOUT_SECS") {
            config.shutdown_timeout_secs = secs.parse()?;
        }

        Ok(config)
    }

    pub fn from_toml(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tick_interval_secs == 0 {
            anyhow::bail!("tick_interval_secs must be > 0");
        }
        if self.deploy_chunk_size == 0 || self.deploy_chunk_size > BYTECODE_MAX_PKT {
            anyhow::bail!("deploy_chunk_size must be in 1..={}", BYTECODE_MAX_PKT);
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
