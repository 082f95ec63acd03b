//! Gateway endpoint: accepts connections, drives the handshake, wires
//! the session layer to the device session, and performs idempotent
//! teardown.

use std::sync::Arc;
use std::time::Instant;

use base64::Engine as _;
use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use crate::collab::{
    ConnectRequest, DeviceAuth, DevicePubSub, DeviceStore, MetricsEvent, MetricsSink, TelemetrySink,
};
use crate::config::ServerConfig;
use crate::deploy::{self, DeployAction, DeployRetryState};
use crate::device::{BackendEvent, DeviceAction, DevicePath, DeviceSession, FrameRoute, OutboundCmd};
use crate::errors::GatewayError;
use crate::metrics::GatewayMetrics;
use crate::session::{self, RecordTransport, Session};

/// Shared collaborators and process-wide state (spec §9: cross-session
/// retry bookkeeping and the liveness map are the only state shared
/// across connections).
pub struct GatewayState {
    pub auth: Arc<dyn DeviceAuth>,
    pub store: Arc<dyn DeviceStore>,
    pub pubsub: Arc<dyn DevicePubSub>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub metrics_sink: Arc<dyn MetricsSink>,
    pub metrics: Arc<GatewayMetrics>,
    pub config: ServerConfig,
    /// Cross-session deploy retry bookkeeping, keyed by device path
    /// (spec §3, §9). Survives reconnects within this process.
    retry_state: DashMap<DevicePath, Arc<AsyncMutex<DeployRetryState>>>,
    /// Liveness map rejecting a second concurrent session for the same
    /// device (spec §9 recommendation).
    live: DashMap<DevicePath, ()>,
}

impl GatewayState {
    pub fn new(
        auth: Arc<dyn DeviceAuth>,
        store: Arc<dyn DeviceStore>,
        pubsub: Arc<dyn DevicePubSub>,
        telemetry: Arc<dyn TelemetrySink>,
        metrics_sink: Arc<dyn MetricsSink>,
        config: ServerConfig,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            auth,
            store,
            pubsub,
            telemetry,
            metrics_sink,
            metrics: Arc::new(GatewayMetrics::new()?),
            config,
            retry_state: DashMap::new(),
            live: DashMap::new(),
        })
    }
}

/// Encrypt and transmit one plaintext record, per spec §4.2 outbound
/// record I/O.
async fn send_record<T: RecordTransport>(
    transport: &mut T,
    session: &mut Session,
    plaintext: &[u8],
) -> Result<(), GatewayError> {
    let record = session.encrypt_outbound(plaintext)?;
    transport
        .send(&record)
        .await
        .map_err(GatewayError::Transport)
}

/// Run one device connection end to end: resolve identity, reject a
/// duplicate session, perform the handshake, then bridge records until
/// the transport closes or a fatal error occurs. Always tears down
/// idempotently (spec §4.5, §5).
pub async fn serve_connection<T: RecordTransport>(
    mut transport: T,
    req: ConnectRequest,
    state: Arc<GatewayState>,
) {
    let identity = match state.auth.resolve_device(&req).await {
        Ok(identity) => identity,
        Err(e) => {
            state.metrics.handshake_failures_total.inc();
            transport.close(&format!("auth failed: {e}")).await;
            return;
        }
    };

    let path = identity.path();
    if state.live.insert(path.clone(), ()).is_some() {
        transport.close("duplicate session for this device").await;
        return;
    }

    let result = run_session(&mut transport, &identity, &path, &state).await;

    state.live.remove(&path);
    state.metrics.active_sessions.dec();
    state.metrics_sink.track(
        "sessionEnd",
        MetricsEvent {
            properties: serde_json::json!({ "ok": result.is_ok() }),
            measurements: serde_json::json!({}),
            session_id: None,
            user_id: Some(path.row_key.clone()),
            user_auth_user_id: Some(identity.display_name.clone()),
        },
    );

    match result {
        Ok(()) => transport.close("closed").await,
        Err(e) => {
            warn!(device = %path.row_key, error = %e, "device session ended");
            transport.close(&e.to_string()).await;
        }
    }
}

async fn run_session<T: RecordTransport>(
    transport: &mut T,
    identity: &crate::collab::DeviceIdentity,
    path: &DevicePath,
    state: &Arc<GatewayState>,
) -> Result<(), GatewayError> {
    let devkey = identity
        .device_key()
        .map_err(|e| GatewayError::Collaborator(e.to_string()))?;

    let mut sess = session::perform_handshake(transport, &devkey).await.map_err(|e| {
        state.metrics.handshake_failures_total.inc();
        GatewayError::from(e)
    })?;

    state.metrics.connections_total.inc();
    state.metrics.active_sessions.inc();

    let mut device = DeviceSession::new(path.clone());

    if let (Some(script_id), Some(script_version)) = (&identity.script_id, identity.script_version) {
        sync_script(&mut device, state, script_id, script_version).await;
        flush_deploy_actions(&mut device, &mut sess, transport, state).await?;
    }

    let (backend_tx, mut backend_rx) = tokio::sync::mpsc::unbounded_channel();
    let unsub = state
        .pubsub
        .sub_to_device(path, Box::new(move |value| {
            let _ = backend_tx.send(value);
        }))
        .await;

    let mut tick = tokio::time::interval(state.config.tick_interval());
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let outcome = loop {
        tokio::select! {
            record = transport.recv() => {
                match record {
                    Ok(bytes) => {
                        if let Err(e) = handle_inbound_record(&mut device, &mut sess, transport, state, &bytes).await {
                            break Err(e);
                        }
                    }
                    Err(e) => break Err(GatewayError::Transport(e)),
                }
            }
            Some(value) = backend_rx.recv() => {
                if let Err(e) = handle_backend_message(&mut device, &mut sess, transport, state, value).await {
                    break Err(e);
                }
            }
            _ = tick.tick() => {
                do_tick(&mut device, state).await;
            }
        }
    };

    unsub();
    outcome
}

async fn handle_inbound_record<T: RecordTransport>(
    device: &mut DeviceSession,
    sess: &mut Session,
    transport: &mut T,
    state: &Arc<GatewayState>,
    record: &[u8],
) -> Result<(), GatewayError> {
    let plaintext = sess.decrypt_inbound(record)?;
    let now = Instant::now();

    let route = match crate::device::route_frame(&plaintext) {
        Ok(route) => route,
        Err(e) => {
            state.metrics.protocol_warnings_total.inc();
            publish_warning(state, &device.path, e.to_string());
            return Ok(());
        }
    };

    match route {
        FrameRoute::WireFrame { bytes } => {
            let action = device.handle_wire_frame(&bytes, now);
            dispatch_action(device, sess, transport, state, action).await
        }
        FrameRoute::Command { opcode, payload } => {
            let cmd = match crate::device::decode_command(opcode, &payload) {
                Ok(cmd) => cmd,
                Err(e) => {
                    state.metrics.protocol_warnings_total.inc();
                    publish_warning(state, &device.path, e.to_string());
                    return Ok(());
                }
            };

            let retry_arc = retry_entry(state, &device.path);
            let mut retry = retry_arc.lock().await;
            let (actions, outcome) = device.handle_inbound(cmd, &mut retry, now, state.config.deploy_chunk_size);
            drop(retry);

            match outcome {
                Some(crate::device::DeployOutcome::Success) => state.metrics.deploy_successes_total.inc(),
                Some(crate::device::DeployOutcome::Failure) => state.metrics.deploy_failures_total.inc(),
                None => {}
            }

            for action in actions {
                dispatch_action(device, sess, transport, state, action).await?;
            }
            Ok(())
        }
    }
}

async fn dispatch_action<T: RecordTransport>(
    device: &mut DeviceSession,
    sess: &mut Session,
    transport: &mut T,
    state: &Arc<GatewayState>,
    action: DeviceAction,
) -> Result<(), GatewayError> {
    match action {
        DeviceAction::SendToDevice(bytes) => send_record(transport, sess, &bytes).await,
        DeviceAction::PublishBackend(event) => {
            if let BackendEvent::UploadBin { payload64 } = &event {
                if let Ok(raw) = base64::engine::general_purpose::STANDARD.decode(payload64) {
                    if let Ok(record) = state.telemetry.parse(&raw) {
                        if let Err(e) = state.telemetry.insert(&device.path.partition_key, record).await {
                            publish_warning(state, &device.path, e.to_string());
                        }
                    }
                }
            }
            state.pubsub.pub_from_device(&device.path, event);
            Ok(())
        }
    }
}

fn publish_warning(state: &Arc<GatewayState>, path: &DevicePath, message: String) {
    state.pubsub.pub_from_device(path, BackendEvent::Warning { message });
}

fn retry_entry(state: &Arc<GatewayState>, path: &DevicePath) -> Arc<AsyncMutex<DeployRetryState>> {
    state
        .retry_state
        .entry(path.clone())
        .or_insert_with(|| Arc::new(AsyncMutex::new(DeployRetryState::default())))
        .clone()
}

async fn sync_script(device: &mut DeviceSession, state: &Arc<GatewayState>, script_id: &str, script_version: u32) {
    if device.deploy.deploy_id == script_id && device.deploy.deploy_version == script_version && !device.deploy.deploy_buffer.is_empty() {
        return;
    }
    if let Err(e) = deploy::load_program(&mut device.deploy, state.store.as_ref(), script_id, script_version).await {
        publish_warning(state, &device.path, e.to_string());
    }
}

/// Kick off `ensure_deployed` immediately after a fresh program load or
/// an `update` command, sending the resulting hash request if any
/// (spec §4.3 state 0).
async fn flush_deploy_actions<T: RecordTransport>(
    device: &mut DeviceSession,
    sess: &mut Session,
    transport: &mut T,
    state: &Arc<GatewayState>,
) -> Result<(), GatewayError> {
    let retry_arc = retry_entry(state, &device.path);
    let mut retry = retry_arc.lock().await;
    let now = Instant::now();
    match deploy::ensure_deployed(&mut device.deploy, &mut retry, now) {
        Ok(DeployAction::None) => Ok(()),
        Ok(action) => {
            drop(retry);
            state.metrics.deploy_attempts_total.inc();
            if let Some(frame) = crate::device::deploy_action_to_frame(&action) {
                send_record(transport, sess, &frame).await
            } else {
                Ok(())
            }
        }
        Err(e) => {
            drop(retry);
            publish_warning(state, &device.path, e.to_string());
            Ok(())
        }
    }
}

async fn handle_backend_message<T: RecordTransport>(
    device: &mut DeviceSession,
    sess: &mut Session,
    transport: &mut T,
    state: &Arc<GatewayState>,
    value: serde_json::Value,
) -> Result<(), GatewayError> {
    let cmd: OutboundCmd = match serde_json::from_value(value) {
        Ok(cmd) => cmd,
        Err(e) => {
            publish_warning(state, &device.path, format!("malformed backend command: {e}"));
            return Ok(());
        }
    };

    if let OutboundCmd::Update { script_id, script_version } = &cmd {
        sync_script(device, state, script_id, *script_version).await;
        return flush_deploy_actions(device, sess, transport, state).await;
    }

    match device.handle_outbound(&cmd) {
        Ok(Some(DeviceAction::SendToDevice(bytes))) => send_record(transport, sess, &bytes).await,
        Ok(Some(DeviceAction::PublishBackend(event))) => {
            state.pubsub.pub_from_device(&device.path, event);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(e) => {
            publish_warning(state, &device.path, e.to_string());
            Ok(())
        }
    }
}

async fn do_tick(device: &mut DeviceSession, state: &Arc<GatewayState>) {
    if !device.has_activity_since_last_tick() {
        return;
    }

    let stats = device.flush_tick();
    let deployed_hash_hex = device.deploy.deployed_hash.map(hex::encode);

    let mutation = crate::collab::DeviceMutation {
        last_act_epoch_ms: Some(chrono::Utc::now().timestamp_millis()),
        add_c2d: stats.c2d,
        add_c2d_resp: stats.c2d_resp,
        add_d2c: stats.d2c,
        deployed_hash_hex,
    };

    if let Err(e) = state.store.update_device(&device.path, mutation).await {
        publish_warning(state, &device.path, e.to_string());
    }

    state.pubsub.pub_from_device(
        &device.path,
        BackendEvent::Tick { measurements: stats.to_measurements() },
    );
    state.metrics.ticks_total.inc();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::*;
    use crate::device::BackendEvent;

    fn path(r: &str) -> DevicePath {
        DevicePath { partition_key: "p".into(), row_key: r.into() }
    }

    #[tokio::test]
    async fn duplicate_session_is_rejected() {
        let state = Arc::new(
            GatewayState::new(
                Arc::new(InMemoryAuth::default()),
                Arc::new(InMemoryStore::default()),
                Arc::new(InMemoryPubSub::default()),
                Arc::new(NoopTelemetry),
                Arc::new(NoopMetrics),
                ServerConfig::default(),
            )
            .unwrap(),
        );

        assert!(state.live.insert(path("d1"), ()).is_none());
        assert!(state.live.insert(path("d1"), ()).is_some());
    }

    #[tokio::test]
    async fn tick_flush_persists_accumulated_stats_via_store() {
        let store = Arc::new(InMemoryStore::default());
        store.devices.lock().unwrap().insert(
            ("p".to_string(), "d1".to_string()),
            DeviceIdentity {
                partition_key: "p".to_string(),
                row_key: "d1".to_string(),
                display_name: "dev".to_string(),
                device_key_b64: "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=".to_string(),
                script_id: None,
                script_version: None,
            },
        );
        let state = Arc::new(
            GatewayState::new(
                Arc::new(InMemoryAuth::default()),
                Arc::clone(&store) as Arc<dyn DeviceStore>,
                Arc::new(InMemoryPubSub::default()),
                Arc::new(NoopTelemetry),
                Arc::new(NoopMetrics),
                ServerConfig::default(),
            )
            .unwrap(),
        );

        let mut device = DeviceSession::new(path("d1"));
        device.stats.c2d = 2;
        device.stats.c2d_resp = 1;
        device.stats.d2c = 5;

        do_tick(&mut device, &state).await;

        let stats = store.stats.lock().unwrap();
        let recorded = stats.get(&("p".to_string(), "d1".to_string())).unwrap();
        assert_eq!(recorded.total_c2d, 2);
        assert_eq!(recorded.total_c2d_resp, 1);
        assert_eq!(recorded.total_d2c, 5);
        assert!(recorded.last_act_epoch_ms.is_some());
    }

    #[test]
    fn deploy_action_frame_matches_build_command_frame_shape() {
        let frame = crate::device::deploy_action_to_frame(&DeployAction::RequestHash).unwrap();
        assert_eq!(frame, vec![0x93, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn backend_event_serializes_for_pubsub() {
        let event = BackendEvent::Warning { message: "frame too short".to_string() };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "warning");
    }
}
