//! External collaborator traits plus in-memory test doubles.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use crate::device::{BackendEvent, DevicePath};

/// Device record looked up by the auth collaborator.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub partition_key: String,
    pub row_key: String,
    pub display_name: String,
    /// base64-encoded long-term device key; callers decode to 32 bytes.
    pub device_key_b64: String,
    pub script_id: Option<String>,
    pub script_version: Option<u32>,
}

impl DeviceIdentity {
    pub fn path(&self) -> DevicePath {
        DevicePath { partition_key: self.partition_key.clone(), row_key: self.row_key.clone() }
    }

    pub fn device_key(&self) -> Result<[u8; 32], AuthError> {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        let bytes = STANDARD.decode(&self.device_key_b64).map_err(|_| AuthError::MalformedKey)?;
        if bytes.len() != 32 {
            return Err(AuthError::MalformedKey);
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        Ok(key)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("no device record for this connection")]
    Unknown,
    #[error("malformed device key")]
    MalformedKey,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("device not found")]
    NotFound,
    #[error("script body not found")]
    ScriptNotFound,
    #[error("storage operation failed: {0}")]
    OperationFailed(String),
}

/// Compiled program body as returned by object storage.
#[derive(Debug, Clone)]
pub struct ScriptBody {
    pub binary: Vec<u8>,
}

/// Mutation applied to a persisted device record via a read-modify-write
/// transaction.
#[derive(Debug, Clone, Default)]
pub struct DeviceMutation {
    pub last_act_epoch_ms: Option<i64>,
    pub add_c2d: u64,
    pub add_c2d_resp: u64,
    pub add_d2c: u64,
    pub deployed_hash_hex: Option<String>,
}

/// Additive totals and latest snapshot fields written to a device
/// record by `DeviceStore::update_device` (spec §6 "Persisted fields
/// written to device record").
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistedDeviceStats {
    pub last_act_epoch_ms: Option<i64>,
    pub total_c2d: u64,
    pub total_c2d_resp: u64,
    pub total_d2c: u64,
    pub deployed_hash_hex: Option<String>,
}

impl PersistedDeviceStats {
    fn apply(&mut self, mutation: &DeviceMutation) {
        self.total_c2d += mutation.add_c2d;
        self.total_c2d_resp += mutation.add_c2d_resp;
        self.total_d2c += mutation.add_d2c;
        if let Some(ms) = mutation.last_act_epoch_ms {
            self.last_act_epoch_ms = Some(ms);
        }
        if let Some(hash) = &mutation.deployed_hash_hex {
            self.deployed_hash_hex = Some(hash.clone());
        }
    }
}

/// Minimal request context the auth collaborator resolves.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub partition_key: String,
    pub row_key: String,
}

#[async_trait]
pub trait DeviceAuth: Send + Sync {
    async fn resolve_device(&self, req: &ConnectRequest) -> Result<DeviceIdentity, AuthError>;
}

#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn get_device(&self, id: &DevicePath) -> Result<DeviceIdentity, StoreError>;
    async fn update_device(&self, id: &DevicePath, mutation: DeviceMutation) -> Result<(), StoreError>;
    async fn get_script_body(&self, script_id: &str, version: u32) -> Result<ScriptBody, StoreError>;
    fn self_host(&self) -> String;
}

pub type Unsub = Box<dyn FnOnce() + Send>;

#[async_trait]
pub trait DevicePubSub: Send + Sync {
    fn pub_from_device(&self, id: &DevicePath, message: BackendEvent);
    async fn sub_to_device(
        &self,
        id: &DevicePath,
        handler: Box<dyn Fn(serde_json::Value) + Send + Sync>,
    ) -> Unsub;
}

#[derive(Debug, Clone)]
pub struct TelemetryRecord {
    pub measurements: serde_json::Value,
}

#[derive(Debug, Error, Clone)]
pub enum TelemetryError {
    #[error("telemetry parse failed: {0}")]
    ParseFailed(String),
    #[error("telemetry insert failed: {0}")]
    InsertFailed(String),
}

#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Decode a raw device telemetry record (the `0x81 UploadBin` frame).
    fn parse(&self, bytes: &[u8]) -> Result<TelemetryRecord, TelemetryError>;
    /// Persist a decoded record to the telemetry store.
    async fn insert(&self, partition_key: &str, record: TelemetryRecord) -> Result<(), TelemetryError>;
}

/// `metrics.track(event, {...})`, kept separate from this crate's own
/// internal Prometheus registry (`crate::metrics`).
pub struct MetricsEvent {
    pub properties: serde_json::Value,
    pub measurements: serde_json::Value,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub user_auth_user_id: Option<String>,
}

pub trait MetricsSink: Send + Sync {
    fn track(&self, event: &str, payload: MetricsEvent);
}

// ---------------------------------------------------------------------
// In-memory test doubles.
// ---------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryAuth {
    pub devices: Mutex<HashMap<(String, String), DeviceIdentity>>,
}

#[async_trait]
impl DeviceAuth for InMemoryAuth {
    async fn resolve_device(&self, req: &ConnectRequest) -> Result<DeviceIdentity, AuthError> {
        self.devices
            .lock()
            .unwrap()
            .get(&(req.partition_key.clone(), req.row_key.clone()))
            .cloned()
            .ok_or(AuthError::Unknown)
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    pub devices: Mutex<HashMap<(String, String), DeviceIdentity>>,
    pub scripts: Mutex<HashMap<(String, u32), ScriptBody>>,
    pub stats: Mutex<HashMap<(String, String), PersistedDeviceStats>>,
}

#[async_trait]
impl DeviceStore for InMemoryStore {
    async fn get_device(&self, id: &DevicePath) -> Result<DeviceIdentity, StoreError> {
        self.devices
            .lock()
            .unwrap()
            .get(&(id.partition_key.clone(), id.row_key.clone()))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn update_device(&self, id: &DevicePath, mutation: DeviceMutation) -> Result<(), StoreError> {
        let devices = self.devices.lock().unwrap();
        if !devices.contains_key(&(id.partition_key.clone(), id.row_key.clone())) {
            return Err(StoreError::NotFound);
        }
        drop(devices);

        let mut stats = self.stats.lock().unwrap();
        stats
            .entry((id.partition_key.clone(), id.row_key.clone()))
            .or_default()
            .apply(&mutation);
        Ok(())
    }

    async fn get_script_body(&self, script_id: &str, version: u32) -> Result<ScriptBody, StoreError> {
        self.scripts
            .lock()
            .unwrap()
            .get(&(script_id.to_string(), version))
            .cloned()
            .ok_or(StoreError::ScriptNotFound)
    }

    fn self_host(&self) -> String {
        "test-host".to_string()
    }
}

#[derive(Default)]
pub struct InMemoryPubSub {
    pub published: Mutex<Vec<(DevicePath, BackendEvent)>>,
}

#[async_trait]
impl DevicePubSub for InMemoryPubSub {
    fn pub_from_device(&self, id: &DevicePath, message: BackendEvent) {
        self.published.lock().unwrap().push((id.clone(), message));
    }

    async fn sub_to_device(
        &self,
        _id: &DevicePath,
        _handler: Box<dyn Fn(serde_json::Value) + Send + Sync>,
    ) -> Unsub {
        Box::new(|| {})
    }
}

pub struct NoopTelemetry;

#[async_trait]
impl TelemetrySink for NoopTelemetry {
    fn parse(&self, bytes: &[u8]) -> Result<TelemetryRecord, TelemetryError> {
        Ok(TelemetryRecord { measurements: serde_json::json!({ "len": bytes.len() }) })
    }

    async fn insert(&self, _partition_key: &str, _record: TelemetryRecord) -> Result<(), TelemetryError> {
        Ok(())
    }
}

pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn track(&self, _event: &str, _payload: MetricsEvent) {}
}
