//! Device session: frame dispatch, stats accounting, backend bridging
//! and the periodic tick.

use std::time::Instant;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::deploy::{self, DeployAction, DeployRetryState, DeployState};
use crate::wire::{self, *};

/// Stable per-device key for the cross-session retry maps and the
/// duplicate-connection liveness map (spec §3, §9).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DevicePath {
    pub partition_key: String,
    pub row_key: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame too short")]
    FrameTooShort,
    #[error("unknown cmd: {0:#x}")]
    UnknownCmd(u16),
    #[error("malformed payload")]
    MalformedPayload,
}

/// The shape a raw inbound frame routes to (spec §4.4, §8 property 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameRoute {
    Command { opcode: u16, payload: Vec<u8> },
    WireFrame { bytes: Vec<u8> },
}

pub fn route_frame(msg: &[u8]) -> Result<FrameRoute, ProtocolError> {
    if msg.len() < 4 {
        return Err(ProtocolError::FrameTooShort);
    }
    if msg[2] == 0 {
        let opcode = u16::from_le_bytes([msg[0], msg[1]]);
        Ok(FrameRoute::Command { opcode, payload: msg[4..].to_vec() })
    } else {
        let flen = msg[2] as usize + 12;
        if flen > msg.len() {
            return Err(ProtocolError::FrameTooShort);
        }
        Ok(FrameRoute::WireFrame { bytes: msg[..flen].to_vec() })
    }
}

/// Decoded device→server commands (spec §4.4 inbound table).
#[derive(Debug, Clone, PartialEq)]
pub enum InboundCmd {
    Upload { label: String, values: Vec<f64> },
    UploadBin { payload: Vec<u8> },
    AckCloudCommand { rid: u32, status_code: u32, result: Vec<f64> },
    Pong { payload: Vec<u8> },
    KeepAlive { payload: Vec<u8> },
    Deploy { opcode: u16, payload: Vec<u8> },
    Unknown { opcode: u16 },
}

pub fn decode_command(opcode: u16, payload: &[u8]) -> Result<InboundCmd, ProtocolError> {
    match opcode {
        OP_UPLOAD => {
            let (label, values) = wire::parse_labelled_f64s(payload).ok_or(ProtocolError::MalformedPayload)?;
            Ok(InboundCmd::Upload { label, values })
        }
        OP_UPLOAD_BIN => Ok(InboundCmd::UploadBin { payload: payload.to_vec() }),
        OP_ACK_CLOUD_COMMAND => {
            if payload.len() < 8 || (payload.len() - 8) % 8 != 0 {
                return Err(ProtocolError::MalformedPayload);
            }
            let rid = u32::from_le_bytes(payload[0..4].try_into().unwrap());
            let status_code = u32::from_le_bytes(payload[4..8].try_into().unwrap());
            let result = payload[8..]
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
                .collect();
            Ok(InboundCmd::AckCloudCommand { rid, status_code, result })
        }
        OP_PONG => Ok(InboundCmd::Pong { payload: payload.to_vec() }),
        OP_PING => Ok(InboundCmd::KeepAlive { payload: payload.to_vec() }),
        OP_DEPLOY_REQUEST_HASH | OP_DEPLOY_BEGIN_UPLOAD | OP_DEPLOY_CHUNK | OP_DEPLOY_FINALIZE | OP_DEPLOY_REJECT => {
            Ok(InboundCmd::Deploy { opcode, payload: payload.to_vec() })
        }
        other => Ok(InboundCmd::Unknown { opcode: other }),
    }
}

/// Events published to the backend pub/sub plane (spec §4.4, §9:
/// "outbound events should be tagged sum types").
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum BackendEvent {
    #[serde(rename = "warning")]
    Warning { message: String },
    #[serde(rename = "methodRes")]
    MethodRes { rid: u32, status_code: u32, result: Vec<f64> },
    #[serde(rename = "jacsUpload")]
    JacsUpload { label: String, values: Vec<f64> },
    #[serde(rename = "uploadBin")]
    UploadBin { payload64: String },
    #[serde(rename = "frame")]
    Frame { frame64: String },
    #[serde(rename = "pong")]
    Pong { payload64: String },
    #[serde(rename = "tick")]
    Tick { measurements: serde_json::Value },
}

/// Backend-originated commands (spec §4.4 outbound table, §9: "inbound
/// messages should be tagged sum types").
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum OutboundCmd {
    #[serde(rename = "method")]
    Method { rid: u32, method: String, args: Vec<f64> },
    #[serde(rename = "frameTo")]
    FrameTo { payload64: String },
    #[serde(rename = "setfwd")]
    SetFwd { enabled: bool },
    #[serde(rename = "ping")]
    Ping { payload64: String },
    #[serde(rename = "update")]
    Update { script_id: String, script_version: u32 },
}

/// What a handler wants done next: send bytes to the device (already
/// plaintext, the gateway encrypts and transports them), or publish an
/// event to the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceAction {
    SendToDevice(Vec<u8>),
    PublishBackend(BackendEvent),
}

/// Terminal deploy verdict reached by this inbound command, if any —
/// used only to drive the gateway's deploy success/failure counters.
/// Intermediate steps (begin-upload, chunk, finalize-before-reverify)
/// report `None`; only a confirmed hash match or a hard failure reports
/// a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployOutcome {
    Success,
    Failure,
}

fn build_command_frame(opcode: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&opcode.to_le_bytes());
    out.push(0);
    out.push(0);
    out.extend_from_slice(payload);
    out
}

pub(crate) fn deploy_action_to_frame(action: &DeployAction) -> Option<Vec<u8>> {
    match action {
        DeployAction::None => None,
        DeployAction::RequestHash => Some(build_command_frame(OP_DEPLOY_REQUEST_HASH, &[])),
        DeployAction::BeginUpload { length } => {
            Some(build_command_frame(OP_DEPLOY_BEGIN_UPLOAD, &length.to_le_bytes()))
        }
        DeployAction::Chunk { data } => Some(build_command_frame(OP_DEPLOY_CHUNK, data)),
        DeployAction::Finalize => Some(build_command_frame(OP_DEPLOY_FINALIZE, &[])),
    }
}

/// Four counters plus whatever extra zero-initialized fields the stats
/// collaborator defines (spec §3 `SessionStats`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStats {
    pub c2d: u64,
    pub c2d_resp: u64,
    pub d2c: u64,
    pub extra: std::collections::BTreeMap<String, u64>,
}

impl SessionStats {
    pub fn is_zero(&self) -> bool {
        self.c2d == 0 && self.c2d_resp == 0 && self.d2c == 0 && self.extra.values().all(|v| *v == 0)
    }

    pub fn reset(&mut self) {
        self.c2d = 0;
        self.c2d_resp = 0;
        self.d2c = 0;
        for v in self.extra.values_mut() {
            *v = 0;
        }
    }

    pub fn to_measurements(&self) -> serde_json::Value {
        let mut m = serde_json::json!({ "c2d": self.c2d, "c2dResp": self.c2d_resp, "d2c": self.d2c });
        if let serde_json::Value::Object(ref mut obj) = m {
            for (k, v) in &self.extra {
                obj.insert(k.clone(), serde_json::json!(v));
            }
        }
        m
    }
}

/// Per-device, per-connection state (spec §3 lifecycle, §4.4).
pub struct DeviceSession {
    pub path: DevicePath,
    pub stats: SessionStats,
    pub deploy: DeployState,
    last_msg: Option<Instant>,
}

impl DeviceSession {
    pub fn new(path: DevicePath) -> Self {
        DeviceSession { path, stats: SessionStats::default(), deploy: DeployState::default(), last_msg: None }
    }

    fn record_activity(&mut self, now: Instant) {
        self.last_msg = Some(now);
    }

    /// §8 property 8: with no activity since the last tick, no flush
    /// occurs and no event is emitted.
    pub fn has_activity_since_last_tick(&self) -> bool {
        self.last_msg.is_some() || !self.stats.is_zero()
    }

    /// Snapshot the current stats for a tick flush, then zero the
    /// counters and clear the activity marker (spec §4.4 periodic tick).
    pub fn flush_tick(&mut self) -> SessionStats {
        let snapshot = self.stats.clone();
        self.stats.reset();
        self.last_msg = None;
        snapshot
    }

    /// Handle one decoded inbound command, producing zero or more
    /// actions for the gateway to carry out. Deploy opcodes are routed
    /// into `deploy::on_device_ack`; everything else is handled here
    /// directly (spec §4.4 inbound table).
    pub fn handle_inbound(
        &mut self,
        cmd: InboundCmd,
        retry: &mut DeployRetryState,
        now: Instant,
        deploy_chunk_size: usize,
    ) -> (Vec<DeviceAction>, Option<DeployOutcome>) {
        self.record_activity(now);
        match cmd {
            InboundCmd::Upload { label, values } => {
                self.stats.d2c += 1;
                (vec![DeviceAction::PublishBackend(BackendEvent::JacsUpload { label, values })], None)
            }
            InboundCmd::UploadBin { payload } => {
                self.stats.d2c += 1;
                (
                    vec![DeviceAction::PublishBackend(BackendEvent::UploadBin { payload64: STANDARD.encode(payload) })],
                    None,
                )
            }
            InboundCmd::AckCloudCommand { rid, status_code, result } => {
                self.stats.c2d_resp += 1;
                (vec![DeviceAction::PublishBackend(BackendEvent::MethodRes { rid, status_code, result })], None)
            }
            InboundCmd::Pong { payload } => {
                (vec![DeviceAction::PublishBackend(BackendEvent::Pong { payload64: STANDARD.encode(payload) })], None)
            }
            InboundCmd::KeepAlive { payload } => {
                (vec![DeviceAction::SendToDevice(build_command_frame(OP_PING, &payload))], None)
            }
            InboundCmd::Deploy { opcode, payload } => {
                let device_hash = if opcode == OP_DEPLOY_REQUEST_HASH && payload.len() >= 32 {
                    let mut h = [0u8; 32];
                    h.copy_from_slice(&payload[0..32]);
                    Some(h)
                } else {
                    None
                };
                match deploy::on_device_ack(&mut self.deploy, retry, now, opcode, device_hash, deploy_chunk_size) {
                    // A confirmed hash match (the device is idle again and
                    // `deployed_hash` now agrees) is the only real success
                    // verdict; begin-upload/chunk/finalize are progress,
                    // not verdicts.
                    Ok(DeployAction::None) => (vec![], Some(DeployOutcome::Success)),
                    Ok(action) => (deploy_action_to_frame(&action).map(DeviceAction::SendToDevice).into_iter().collect(), None),
                    Err(e) => (
                        vec![DeviceAction::PublishBackend(BackendEvent::Warning { message: e.to_string() })],
                        Some(DeployOutcome::Failure),
                    ),
                }
            }
            InboundCmd::Unknown { opcode } => {
                (vec![DeviceAction::PublishBackend(BackendEvent::Warning { message: format!("unknown cmd: {opcode:#x}") })], None)
            }
        }
    }

    /// Handle a wire (jacdac) frame: forwarded verbatim as a base64
    /// `frame` event (spec §4.4).
    pub fn handle_wire_frame(&mut self, bytes: &[u8], now: Instant) -> DeviceAction {
        self.record_activity(now);
        DeviceAction::PublishBackend(BackendEvent::Frame { frame64: STANDARD.encode(bytes) })
    }

    /// Handle a backend-originated command (spec §4.4 outbound table).
    /// `update` is special-cased by the caller (it needs the storage
    /// collaborator to load a new program), so this returns `None` for
    /// it and expects the caller to subsequently call
    /// `deploy::load_program` + `deploy::ensure_deployed`.
    pub fn handle_outbound(&mut self, cmd: &OutboundCmd) -> Result<Option<DeviceAction>, ProtocolError> {
        match cmd {
            OutboundCmd::Method { rid, method, args } => {
                self.stats.c2d += 1;
                let mut payload = Vec::with_capacity(4 + method.len() + 1 + args.len() * 8);
                payload.extend_from_slice(&rid.to_le_bytes());
                payload.extend_from_slice(method.as_bytes());
                payload.push(0);
                for v in args {
                    payload.extend_from_slice(&v.to_le_bytes());
                }
                Ok(Some(DeviceAction::SendToDevice(build_command_frame(OP_ACK_CLOUD_COMMAND, &payload))))
            }
            OutboundCmd::FrameTo { payload64 } => {
                let raw = STANDARD.decode(payload64).map_err(|_| ProtocolError::MalformedPayload)?;
                Ok(Some(DeviceAction::SendToDevice(raw)))
            }
            OutboundCmd::SetFwd { enabled } => {
                Ok(Some(DeviceAction::SendToDevice(build_command_frame(OP_SET_FWD, &[*enabled as u8]))))
            }
            OutboundCmd::Ping { payload64 } => {
                let raw = STANDARD.decode(payload64).map_err(|_| ProtocolError::MalformedPayload)?;
                Ok(Some(DeviceAction::SendToDevice(build_command_frame(OP_PONG, &raw))))
            }
            OutboundCmd::Update { .. } => Ok(None),
        }
    }
}
