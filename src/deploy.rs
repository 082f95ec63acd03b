//! Deploy engine: hash-verified program install state machine with
//! retry, backoff and re-verification. Clock is passed explicitly
//! (`now: Instant`) so backoff is testable without sleeping.

use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::collab::{DeviceStore, StoreError};
use crate::device::DevicePath;

pub const BYTECODE_MAX_PKT: usize = 192;
const PROGRAM_MAGIC: [u8; 8] = [0x4A, 0x61, 0x63, 0x53, 0x0A, 0x7E, 0x6A, 0x9A];
const MIN_PROGRAM_LEN: usize = 128;

/// Device-visible opcodes driving the deploy state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum DeployCmd {
    Idle = 0,
    RequestHash = 0x93,
    BeginUpload = 0x94,
    Chunk = 0x95,
    Finalize = 0x96,
}

impl DeployCmd {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0 => Some(DeployCmd::Idle),
            0x93 => Some(DeployCmd::RequestHash),
            0x94 => Some(DeployCmd::BeginUpload),
            0x95 => Some(DeployCmd::Chunk),
            0x96 => Some(DeployCmd::Finalize),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeployError {
    #[error("program too short or bad magic")]
    InvalidProgram,
    #[error("device rejected deploy (0xFF)")]
    DeviceReject,
    #[error("unexpected device ack: expected {expected:?}, got {got:?}")]
    UnexpectedAck { expected: u16, got: u16 },
    #[error("hash mismatch on re-verification")]
    ReverifyMismatch,
    #[error("backoff window still active")]
    Backoff,
}

/// Per-connection deploy state.
#[derive(Debug, Clone, Default)]
pub struct DeployState {
    pub deploy_buffer: Vec<u8>,
    pub deploy_hash: [u8; 32],
    pub deployed_hash: Option<[u8; 32]>,
    pub deploy_ptr: usize,
    pub deploy_cmd: u16,
    pub deploy_id: String,
    pub deploy_version: u32,
    /// Whether `deployed_hash` was set to `deploy_hash` by a prior
    /// successful `0x96` cycle — tracks "second try" detection
    /// explicitly instead of relying on pointer/reference equality.
    pub verified_once: bool,
}

impl DeployState {
    pub fn is_idle(&self) -> bool {
        self.deploy_cmd == DeployCmd::Idle as u16
    }
}

/// Cross-session retry bookkeeping, keyed by device path and surviving
/// disconnects.
#[derive(Debug, Clone, Default)]
pub struct DeployRetryState {
    pub deploy_timeout: Option<Instant>,
    pub deploy_num_fail: u32,
}

impl DeployRetryState {
    fn record_failure(&mut self, now: Instant) {
        self.deploy_num_fail += 1;
        let backoff_secs = (2 + self.deploy_num_fail.min(20)) * 10;
        self.deploy_timeout = Some(now + Duration::from_secs(backoff_secs as u64));
    }

    fn record_success(&mut self) {
        self.deploy_num_fail = 0;
        self.deploy_timeout = None;
    }

    fn is_backed_off(&self, now: Instant) -> bool {
        matches!(self.deploy_timeout, Some(t) if now < t)
    }
}

/// What the caller should send to the device as a result of a state
/// transition, if anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployAction {
    None,
    RequestHash,
    BeginUpload { length: u32 },
    Chunk { data: Vec<u8> },
    Finalize,
}

fn validate_program(buf: &[u8]) -> Result<(), DeployError> {
    if buf.len() < MIN_PROGRAM_LEN || buf[0..8] != PROGRAM_MAGIC {
        return Err(DeployError::InvalidProgram);
    }
    Ok(())
}

/// Load a new program from storage for `(script_id, script_version)`,
/// clearing any previous buffer/hash first.
pub async fn load_program(
    state: &mut DeployState,
    store: &dyn DeviceStore,
    script_id: &str,
    script_version: u32,
) -> Result<(), DeployError> {
    state.deploy_buffer.clear();
    state.deploy_hash = [0u8; 32];
    // A new (scriptId, scriptVersion) invalidates any prior "already
    // re-verified" status: the next 0x93 mismatch against this fresh
    // deploy_hash must start a normal upload, not be treated as a
    // second-try failure (spec §9: deployedHash==deployHash reference
    // identity breaks once deployHash is reassigned to a new value).
    state.verified_once = false;

    let body = store
        .get_script_body(script_id, script_version)
        .await
        .map_err(|_: StoreError| DeployError::InvalidProgram)?;

    validate_program(&body.binary)?;

    let mut hasher = Sha256::new();
    hasher.update(&body.binary);
    let hash: [u8; 32] = hasher.finalize().into();

    state.deploy_buffer = body.binary;
    state.deploy_hash = hash;
    state.deploy_id = script_id.to_string();
    state.deploy_version = script_version;
    Ok(())
}

/// `syncScript`: ensure the loaded program is installed on the device,
/// kicking off a hash request if needed. Only does work if the device
/// isn't already known to be running `deploy_hash`, and if the
/// cross-session backoff window has elapsed.
pub fn ensure_deployed(
    state: &mut DeployState,
    retry: &mut DeployRetryState,
    now: Instant,
) -> Result<DeployAction, DeployError> {
    if !state.is_idle() {
        return Ok(DeployAction::None);
    }

    if let Some(deployed) = state.deployed_hash {
        if deployed == state.deploy_hash {
            return Ok(DeployAction::None);
        }
    }

    if retry.is_backed_off(now) {
        return Err(DeployError::Backoff);
    }

    state.deploy_cmd = DeployCmd::RequestHash as u16;
    Ok(DeployAction::RequestHash)
}

/// Feed one device-reported deploy opcode/payload into the state
/// machine. `device_path` is used only for the retry-state callers
/// that key by it outside this function. `chunk_size` is the
/// configured upload chunk size (`ServerConfig::deploy_chunk_size`),
/// clamped to the protocol hard maximum `BYTECODE_MAX_PKT`.
pub fn on_device_ack(
    state: &mut DeployState,
    retry: &mut DeployRetryState,
    now: Instant,
    opcode: u16,
    device_hash: Option<[u8; 32]>,
    chunk_size: usize,
) -> Result<DeployAction, DeployError> {
    if opcode == 0xFF {
        state.deploy_cmd = DeployCmd::Idle as u16;
        retry.record_failure(now);
        return Err(DeployError::DeviceReject);
    }

    if opcode != state.deploy_cmd {
        state.deploy_cmd = DeployCmd::Idle as u16;
        retry.record_failure(now);
        return Err(DeployError::UnexpectedAck { expected: state.deploy_cmd, got: opcode });
    }

    match DeployCmd::from_u16(opcode) {
        Some(DeployCmd::RequestHash) => {
            let reported = device_hash.unwrap_or([0u8; 32]);
            if reported == state.deploy_hash {
                state.deploy_cmd = DeployCmd::Idle as u16;
                state.deployed_hash = Some(state.deploy_hash);
                retry.record_success();
                Ok(DeployAction::None)
            } else if !state.verified_once {
                state.deploy_ptr = 0;
                state.deploy_cmd = DeployCmd::BeginUpload as u16;
                Ok(DeployAction::BeginUpload { length: state.deploy_buffer.len() as u32 })
            } else {
                state.deploy_cmd = DeployCmd::Idle as u16;
                retry.record_failure(now);
                Err(DeployError::ReverifyMismatch)
            }
        }
        Some(DeployCmd::BeginUpload) | Some(DeployCmd::Chunk) => {
            if state.deploy_ptr < state.deploy_buffer.len() {
                let step = chunk_size.clamp(1, BYTECODE_MAX_PKT);
                let end = (state.deploy_ptr + step).min(state.deploy_buffer.len());
                let chunk = state.deploy_buffer[state.deploy_ptr..end].to_vec();
                state.deploy_ptr = end;
                state.deploy_cmd = DeployCmd::Chunk as u16;
                Ok(DeployAction::Chunk { data: chunk })
            } else {
                state.deploy_cmd = DeployCmd::Finalize as u16;
                Ok(DeployAction::Finalize)
            }
        }
        Some(DeployCmd::Finalize) => {
            state.deployed_hash = Some(state.deploy_hash);
            state.verified_once = true;
            state.deploy_cmd = DeployCmd::Idle as u16;
            // Re-run ensure_deployed as the second-try hash check:
            // deployed_hash now equals deploy_hash so the idle-branch
            // early-return above won't fire until the device's own
            // 0x93 reply confirms it — the caller is expected to
            // immediately request the hash again.
            state.deploy_cmd = DeployCmd::RequestHash as u16;
            Ok(DeployAction::RequestHash)
        }
        Some(DeployCmd::Idle) | None => {
            state.deploy_cmd = DeployCmd::Idle as u16;
            retry.record_failure(now);
            Err(DeployError::UnexpectedAck { expected: state.deploy_cmd, got: opcode })
        }
    }
}

/// Placeholder identifying which cross-session map entry a given
/// device path should index into. Kept here rather than in `device`
/// to avoid a dependency cycle; `gateway` owns the actual `DashMap`.
pub type RetryKey = DevicePath;

#[cfg(test)]
mod tests {
    use super::*;

    fn program(len: usize) -> Vec<u8> {
        let mut v = PROGRAM_MAGIC.to_vec();
        v.resize(len, 0xAB);
        v
    }

    #[test]
    fn deploy_start_on_mismatch_sends_begin_upload_with_length() {
        let mut state = DeployState::default();
        state.deploy_buffer = program(2048);
        let mut hasher = Sha256::new();
        hasher.update(&state.deploy_buffer);
        state.deploy_hash = hasher.finalize().into();
        state.deploy_cmd = DeployCmd::RequestHash as u16;

        let mut retry = DeployRetryState::default();
        let now = Instant::now();

        let action = on_device_ack(&mut state, &mut retry, now, 0x93, Some([0u8; 32]), BYTECODE_MAX_PKT).unwrap();
        assert_eq!(action, DeployAction::BeginUpload { length: 2048 });
        assert_eq!(2048u32.to_le_bytes(), [0x00, 0x08, 0x00, 0x00]);
    }

    #[test]
    fn deploy_completion_sets_deployed_hash_and_reverifies() {
        let mut state = DeployState::default();
        state.deploy_buffer = program(400);
        let mut hasher = Sha256::new();
        hasher.update(&state.deploy_buffer);
        state.deploy_hash = hasher.finalize().into();
        state.deploy_cmd = DeployCmd::Finalize as u16;

        let mut retry = DeployRetryState::default();
        let now = Instant::now();

        let action = on_device_ack(&mut state, &mut retry, now, 0x96, None, BYTECODE_MAX_PKT).unwrap();
        assert_eq!(state.deployed_hash, Some(state.deploy_hash));
        assert!(state.verified_once);
        assert_eq!(action, DeployAction::RequestHash);
        assert_eq!(state.deploy_cmd, DeployCmd::RequestHash as u16);
    }

    #[test]
    fn second_try_mismatch_fails_instead_of_reuploading() {
        let mut state = DeployState::default();
        state.deploy_buffer = program(200);
        let mut hasher = Sha256::new();
        hasher.update(&state.deploy_buffer);
        state.deploy_hash = hasher.finalize().into();
        state.deployed_hash = Some(state.deploy_hash);
        state.verified_once = true;
        state.deploy_cmd = DeployCmd::RequestHash as u16;

        let mut retry = DeployRetryState::default();
        let now = Instant::now();

        let err = on_device_ack(&mut state, &mut retry, now, 0x93, Some([0xEE; 32]), BYTECODE_MAX_PKT).unwrap_err();
        assert_eq!(err, DeployError::ReverifyMismatch);
        assert_eq!(retry.deploy_num_fail, 1);
    }

    #[test]
    fn backoff_blocks_until_elapsed() {
        let mut retry = DeployRetryState::default();
        let now = Instant::now();
        retry.record_failure(now);
        assert_eq!(retry.deploy_num_fail, 1);
        assert!(retry.is_backed_off(now));

        let past_window = now + Duration::from_secs((2 + 1) * 10 + 1);
        assert!(!retry.is_backed_off(past_window));
    }

    #[test]
    fn backoff_caps_failure_multiplier_at_20() {
        let mut retry = DeployRetryState::default();
        let now = Instant::now();
        for _ in 0..30 {
            retry.record_failure(now);
        }
        assert_eq!(retry.deploy_num_fail, 30);
        let expected = now + Duration::from_secs((2 + 20) * 10);
        assert_eq!(retry.deploy_timeout, Some(expected));
    }

    #[test]
    fn deploy_idempotence_no_traffic_when_already_installed() {
        let mut state = DeployState::default();
        state.deploy_buffer = program(128);
        let mut hasher = Sha256::new();
        hasher.update(&state.deploy_buffer);
        state.deploy_hash = hasher.finalize().into();
        state.deployed_hash = Some(state.deploy_hash);

        let mut retry = DeployRetryState::default();
        let now = Instant::now();

        let action = ensure_deployed(&mut state, &mut retry, now).unwrap();
        assert_eq!(action, DeployAction::None);
    }

    #[test]
    fn unexpected_ack_mismatch_warns_and_backs_off() {
        let mut state = DeployState::default();
        state.deploy_cmd = DeployCmd::Chunk as u16;
        let mut retry = DeployRetryState::default();
        let now = Instant::now();

        let err = on_device_ack(&mut state, &mut retry, now, 0x93, None, BYTECODE_MAX_PKT).unwrap_err();
        assert!(matches!(err, DeployError::UnexpectedAck { .. }));
        assert_eq!(state.deploy_cmd, DeployCmd::Idle as u16);
        assert_eq!(retry.deploy_num_fail, 1);
    }

    #[test]
    fn chunk_upload_respects_configured_chunk_size() {
        let mut state = DeployState::default();
        state.deploy_buffer = program(300);
        state.deploy_cmd = DeployCmd::BeginUpload as u16;

        let mut retry = DeployRetryState::default();
        let now = Instant::now();

        let action = on_device_ack(&mut state, &mut retry, now, 0x94, None, 64).unwrap();
        match action {
            DeployAction::Chunk { data } => assert_eq!(data.len(), 64),
            other => panic!("expected Chunk, got {other:?}"),
        }
        assert_eq!(state.deploy_ptr, 64);
    }

    #[test]
    fn chunk_size_above_protocol_max_is_clamped() {
        let mut state = DeployState::default();
        state.deploy_buffer = program(300);
        state.deploy_cmd = DeployCmd::BeginUpload as u16;

        let mut retry = DeployRetryState::default();
        let now = Instant::now();

        let action = on_device_ack(&mut state, &mut retry, now, 0x94, None, 10_000).unwrap();
        match action {
            DeployAction::Chunk { data } => assert_eq!(data.len(), BYTECODE_MAX_PKT),
            other => panic!("expected Chunk, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn load_program_resets_verified_once_for_a_new_version() {
        use crate::collab::{DeviceStore, InMemoryStore, ScriptBody};

        let old_program = program(128);
        let new_program = program(256);

        let store = InMemoryStore::default();
        store.scripts.lock().unwrap().insert(("main".to_string(), 1), ScriptBody { binary: old_program });
        store.scripts.lock().unwrap().insert(("main".to_string(), 2), ScriptBody { binary: new_program });

        let mut state = DeployState::default();
        load_program(&mut state, &store, "main", 1).await.unwrap();
        // Simulate a completed deploy of version 1: a 0x96 ack marks
        // deployed_hash and sets verified_once.
        state.deploy_cmd = DeployCmd::Finalize as u16;
        let mut retry = DeployRetryState::default();
        on_device_ack(&mut state, &mut retry, Instant::now(), 0x96, None, BYTECODE_MAX_PKT).unwrap();
        assert!(state.verified_once);

        // Loading a new version must clear verified_once so a hash
        // mismatch against the new deploy_hash starts a normal upload
        // instead of failing as a stale "second try".
        load_program(&mut state, &store, "main", 2).await.unwrap();
        assert!(!state.verified_once);

        state.deploy_cmd = DeployCmd::RequestHash as u16;
        let action = on_device_ack(&mut state, &mut retry, Instant::now(), 0x93, Some([0xAAu8; 32]), BYTECODE_MAX_PKT).unwrap();
        assert!(matches!(action, DeployAction::BeginUpload { .. }), "expected a fresh upload, got {action:?}");
    }
}
