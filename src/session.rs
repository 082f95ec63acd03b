//! Session layer: handshake and framed encrypted record I/O. Each
//! direction keeps its own monotonic nonce counter with a fixed
//! leading byte so client and server records never collide.

use async_trait::async_trait;
use getrandom::getrandom;
use thiserror::Error;

use crate::crypto::{aes_block, aes_ccm_decrypt, aes_ccm_encrypt, hkdf_sha256, CryptoError};

const SERVER_HELLO_MAGIC: u32 = 0xCEE428CA;

/// Protocol version selected by the device at handshake time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    /// `jacdac-key-...`: AES single-block key derivation.
    V1 = 1,
    /// `devs-key-...`: HKDF-SHA256 key derivation.
    V2 = 2,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("no proto-key")]
    NoProtoKey,
    #[error("wrong proto-key size")]
    WrongProtoKeySize,
    #[error("bad auth")]
    BadAuth,
    #[error("nonce exhausted")]
    NonceExhausted,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// A transport that delivers one record per message, in arrival order.
/// The WebSocket binding (`crate::ws`) is the production implementation;
/// this trait is what lets `session`/`gateway` stay transport-agnostic.
#[async_trait]
pub trait RecordTransport: Send {
    async fn recv(&mut self) -> Result<Vec<u8>, String>;
    async fn send(&mut self, data: &[u8]) -> Result<(), String>;
    /// The protocol selector string negotiated at connect time
    /// (e.g. a WebSocket subprotocol), in the form
    /// `(devs|jacdac)-key-<32 hex>`.
    fn selector(&self) -> &str;
    async fn close(&mut self, reason: &str);
}

/// A 13-byte nonce: `n[0]` is the fixed direction byte (never allowed
/// to move), `n[1..13]` is a 12-byte big-endian counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nonce13(pub [u8; 13]);

impl Nonce13 {
    pub fn client_initial() -> Self {
        let mut n = [0u8; 13];
        n[0] = 1;
        Nonce13(n)
    }

    pub fn server_initial() -> Self {
        let mut n = [0u8; 13];
        n[0] = 2;
        Nonce13(n)
    }

    /// Increment the low 12 bytes as a big-endian counter. Returns
    /// `Err` instead of wrapping into the leading direction byte —
    /// the session is terminated rather than silently overflowing
    /// into reserved territory.
    pub fn increment(&mut self) -> Result<(), HandshakeError> {
        for i in (1..13).rev() {
            if self.0[i] == 0xFF {
                self.0[i] = 0;
            } else {
                self.0[i] += 1;
                return Ok(());
            }
        }
        Err(HandshakeError::NonceExhausted)
    }
}

/// 32-byte symmetric session key derived per connection.
pub struct SessionKeys {
    pub key: [u8; 32],
    pub client_nonce: Nonce13,
    pub server_nonce: Nonce13,
}

impl SessionKeys {
    fn derive_v1(devkey: &[u8; 32], client_random: &[u8; 16], server_random: &[u8; 16]) -> [u8; 32] {
        let mut block0 = [0u8; 16];
        block0[0..8].copy_from_slice(&client_random[0..8]);
        block0[8..16].copy_from_slice(&server_random[0..8]);
        let mut block1 = [0u8; 16];
        block1[0..8].copy_from_slice(&client_random[8..16]);
        block1[8..16].copy_from_slice(&server_random[8..16]);

        let half0 = aes_block(devkey, &block0);
        let half1 = aes_block(devkey, &block1);

        let mut key = [0u8; 32];
        key[0..16].copy_from_slice(&half0);
        key[16..32].copy_from_slice(&half1);
        key
    }

    fn derive_v2(devkey: &[u8; 32], client_random: &[u8; 16], server_random: &[u8; 16]) -> [u8; 32] {
        let mut info = [0u8; 32];
        info[0..16].copy_from_slice(client_random);
        info[16..32].copy_from_slice(server_random);
        let mut key = [0u8; 32];
        hkdf_sha256(devkey, &info, &mut key);
        key
    }

    pub fn derive(
        version: ProtocolVersion,
        devkey: &[u8; 32],
        client_random: &[u8; 16],
        server_random: &[u8; 16],
    ) -> Self {
        let key = match version {
            ProtocolVersion::V1 => Self::derive_v1(devkey, client_random, server_random),
            ProtocolVersion::V2 => Self::derive_v2(devkey, client_random, server_random),
        };
        SessionKeys {
            key,
            client_nonce: Nonce13::client_initial(),
            server_nonce: Nonce13::server_initial(),
        }
    }
}

/// An authenticated device session: handshake keys plus the live
/// per-direction nonce counters.
pub struct Session {
    keys: SessionKeys,
}

impl Session {
    /// Decrypt an inbound record. The client nonce is incremented
    /// exactly once regardless of success, before the caller sees
    /// the result.
    pub fn decrypt_inbound(&mut self, record: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let nonce = self.keys.client_nonce.0;
        let result = aes_ccm_decrypt(&self.keys.key, &nonce, record);
        self.keys.client_nonce.increment()?;
        result.map_err(HandshakeError::from)
    }

    /// Encrypt and return an outbound record, incrementing the server
    /// nonce unconditionally once the ciphertext has been sealed.
    pub fn encrypt_outbound(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let nonce = self.keys.server_nonce.0;
        let record = aes_ccm_encrypt(&self.keys.key, &nonce, plaintext);
        self.keys.server_nonce.increment()?;
        Ok(record)
    }
}

fn parse_selector(selector: &str) -> Result<(ProtocolVersion, [u8; 16]), HandshakeError> {
    let (version, rest) = if let Some(rest) = selector.strip_prefix("devs-key-") {
        (ProtocolVersion::V2, rest)
    } else if let Some(rest) = selector.strip_prefix("jacdac-key-") {
        (ProtocolVersion::V1, rest)
    } else {
        return Err(HandshakeError::NoProtoKey);
    };

    if rest.len() != 32 {
        return Err(HandshakeError::WrongProtoKeySize);
    }

    let mut client_random = [0u8; 16];
    hex::decode_to_slice(rest, &mut client_random).map_err(|_| HandshakeError::WrongProtoKeySize)?;
    Ok((version, client_random))
}

/// Run the server-initiated handshake: send the cleartext hello and
/// an auth record, then require the first client record to be 32
/// zero bytes before accepting the session.
pub async fn perform_handshake<T: RecordTransport>(
    transport: &mut T,
    devkey: &[u8; 32],
) -> Result<Session, HandshakeError> {
    let (version, client_random) = parse_selector(transport.selector())?;

    let mut server_random = [0u8; 16];
    getrandom(&mut server_random).map_err(|_| HandshakeError::BadAuth)?;

    let mut keys = SessionKeys::derive(version, devkey, &client_random, &server_random);

    let mut hello = Vec::with_capacity(24);
    hello.extend_from_slice(&SERVER_HELLO_MAGIC.to_le_bytes());
    hello.extend_from_slice(&(version as u32).to_le_bytes());
    hello.extend_from_slice(&server_random);
    transport.send(&hello).await.map_err(|_| HandshakeError::BadAuth)?;

    let auth_plaintext = [0u8; 32];
    let nonce = keys.server_nonce.0;
    let auth_record = aes_ccm_encrypt(&keys.key, &nonce, &auth_plaintext);
    keys.server_nonce.increment()?;
    transport.send(&auth_record).await.map_err(|_| HandshakeError::BadAuth)?;

    let first_record = transport.recv().await.map_err(|_| HandshakeError::BadAuth)?;
    let nonce = keys.client_nonce.0;
    let plaintext = aes_ccm_decrypt(&keys.key, &nonce, &first_record);
    keys.client_nonce.increment()?;
    let plaintext = plaintext.map_err(|_| HandshakeError::BadAuth)?;

    if plaintext.len() < 32 || plaintext[0..16].iter().any(|&b| b != 0) {
        return Err(HandshakeError::BadAuth);
    }

    Ok(Session { keys })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v2_key_derivation_matches_hkdf_directly() {
        let devkey = [0x01u8; 32];
        let client_random = [0x02u8; 16];
        let server_random = [0x03u8; 16];

        let keys = SessionKeys::derive(ProtocolVersion::V2, &devkey, &client_random, &server_random);

        let mut info = [0u8; 32];
        info[0..16].copy_from_slice(&client_random);
        info[16..32].copy_from_slice(&server_random);
        let mut expected = [0u8; 32];
        hkdf_sha256(&devkey, &info, &mut expected);

        assert_eq!(keys.key, expected);
    }

    #[test]
    fn v1_and_v2_are_deterministic_and_differ() {
        let devkey = [0x05u8; 32];
        let cr = [0x06u8; 16];
        let sr = [0x07u8; 16];

        let k1a = SessionKeys::derive(ProtocolVersion::V1, &devkey, &cr, &sr);
        let k1b = SessionKeys::derive(ProtocolVersion::V1, &devkey, &cr, &sr);
        assert_eq!(k1a.key, k1b.key);

        let k2 = SessionKeys::derive(ProtocolVersion::V2, &devkey, &cr, &sr);
        assert_ne!(k1a.key, k2.key);
    }

    #[test]
    fn server_hello_bytes_are_magic_version_and_server_random() {
        let server_random = [0x03u8; 16];
        let mut hello = Vec::with_capacity(24);
        hello.extend_from_slice(&SERVER_HELLO_MAGIC.to_le_bytes());
        hello.extend_from_slice(&(ProtocolVersion::V2 as u32).to_le_bytes());
        hello.extend_from_slice(&server_random);

        let mut expected = vec![0xCA, 0x28, 0xE4, 0xCE, 0x02, 0x00, 0x00, 0x00];
        expected.extend_from_slice(&[0x03u8; 16]);

        assert_eq!(hello.len(), 24);
        assert_eq!(hello, expected);
    }

    #[test]
    fn selector_parses_v1_and_v2() {
        let hex32 = "00112233445566778899aabbccddeeff";
        let (v, _) = parse_selector(&format!("devs-key-{hex32}")).unwrap();
        assert_eq!(v, ProtocolVersion::V2);
        let (v, _) = parse_selector(&format!("jacdac-key-{hex32}")).unwrap();
        assert_eq!(v, ProtocolVersion::V1);
    }

    #[test]
    fn selector_rejects_bad_format() {
        assert_eq!(parse_selector("bogus"), Err(HandshakeError::NoProtoKey));
        assert_eq!(
            parse_selector("devs-key-00112233"),
            Err(HandshakeError::WrongProtoKeySize)
        );
    }

    #[test]
    fn nonce_increment_is_monotonic_for_n_records() {
        let mut nonce = Nonce13::client_initial();
        for expected in 1u32..=5 {
            nonce.increment().unwrap();
            let mut want = [0u8; 13];
            want[0] = 1;
            want[12] = expected as u8;
            assert_eq!(nonce.0, want);
        }
    }

    #[test]
    fn nonce_overflow_into_leading_byte_is_terminal() {
        let mut nonce = Nonce13([0xFFu8; 13]);
        nonce.0[0] = 1;
        assert_eq!(nonce.increment(), Err(HandshakeError::NonceExhausted));
    }

    #[test]
    fn auth_failure_opacity_truncated_vs_tampered() {
        let key = [0x09u8; 32];
        let nonce = [0x01u8; 13];
        let ct = aes_ccm_encrypt(&key, &nonce, &[0u8; 32]);

        let mut tampered_tag = ct.clone();
        let last = tampered_tag.len() - 1;
        tampered_tag[last] ^= 1;

        let mut tampered_body = ct.clone();
        tampered_body[0] ^= 1;

        let truncated = &ct[0..2];

        assert_eq!(aes_ccm_decrypt(&key, &nonce, &tampered_tag), Err(CryptoError::AuthFail));
        assert_eq!(aes_ccm_decrypt(&key, &nonce, &tampered_body), Err(CryptoError::AuthFail));
        assert_eq!(aes_ccm_decrypt(&key, &nonce, truncated), Err(CryptoError::AuthFail));
    }
}
