//! Shared wire-level constants and helpers used by `session` and
//! `device`. Kept as one small module so the opcode table and packing
//! helpers aren't duplicated across the two.

/// Labelled tuple upload from the device: zero-terminated UTF-8 label,
/// then packed little-endian f64 values.
pub const OP_UPLOAD: u16 = 0x80;
/// Binary telemetry record, parsed by the external binfmt collaborator.
pub const OP_UPLOAD_BIN: u16 = 0x81;
/// Forward-enable toggle sent to the device.
pub const OP_SET_FWD: u16 = 0x90;
/// Pong echo from the device.
pub const OP_PONG: u16 = 0x91;
/// Keepalive echo request/response.
pub const OP_PING: u16 = 0x92;
/// Deploy: request current installed hash.
pub const OP_DEPLOY_REQUEST_HASH: u16 = 0x93;
/// Deploy: begin upload (payload: program length as u32-LE).
pub const OP_DEPLOY_BEGIN_UPLOAD: u16 = 0x94;
/// Deploy: chunk (payload: up to `BYTECODE_MAX_PKT` bytes).
pub const OP_DEPLOY_CHUNK: u16 = 0x95;
/// Deploy: finalize.
pub const OP_DEPLOY_FINALIZE: u16 = 0x96;
/// Acknowledge a cloud-originated method call.
pub const OP_ACK_CLOUD_COMMAND: u16 = 0x83;
/// Device-side explicit deploy reject.
pub const OP_DEPLOY_REJECT: u16 = 0xFF;

/// Parse a zero-terminated UTF-8 label followed by packed little-endian
/// f64 values (the `0x80 Upload` frame body).
pub fn parse_labelled_f64s(payload: &[u8]) -> Option<(String, Vec<f64>)> {
    let nul = payload.iter().position(|&b| b == 0)?;
    let label = std::str::from_utf8(&payload[..nul]).ok()?.to_string();
    let rest = &payload[nul + 1..];
    if rest.len() % 8 != 0 {
        return None;
    }
    let values = rest
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes(c.try_into().expect("chunks_exact(8)")))
        .collect();
    Some((label, values))
}

/// Encode a label + f64 values back into the wire shape, used by tests
/// and by any future device-simulation tooling.
pub fn encode_labelled_f64s(label: &str, values: &[f64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(label.len() + 1 + values.len() * 8);
    out.extend_from_slice(label.as_bytes());
    out.push(0);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_label_and_values() {
        let encoded = encode_labelled_f64s("hi", &[3.14]);
        let (label, values) = parse_labelled_f64s(&encoded).unwrap();
        assert_eq!(label, "hi");
        assert_eq!(values, vec![3.14]);
    }
}
