//! Crypto primitives (spec component C1).
//!
//! Single-block AES-256, AES-256-CCM AEAD with a 4-byte tag, a 13-byte
//! nonce and L=2 length field, and HKDF-SHA256 with an empty salt.
//! Grounded on `zrc-crypto::session_crypto` for the AEAD `seal`/`open`
//! shape and on the RustCrypto `aes`/`hkdf` crates the wider pack uses
//! for block ciphers and key derivation.

use aes::cipher::{BlockEncrypt, KeyInit as BlockKeyInit};
use aes::Aes256;
use ccm::aead::{Aead, KeyInit, Payload};
use ccm::consts::{U13, U4};
use ccm::Ccm;
use hkdf::Hkdf;
use sha2::Sha256;

type AesCcm = Ccm<Aes256, U4, U13>;

/// A single error type for every crypto failure. CCM authentication
/// failure and truncated-payload both collapse into `AuthFail` so
/// callers outside the session layer cannot distinguish them by kind
/// (spec §4.1, tested by §8 property 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("authentication failed")]
    AuthFail,
}

/// Single-block AES-256 encryption. Used only during v1 (`jacdac`) key
/// derivation; never used for bulk data.
pub fn aes_block(key: &[u8; 32], block: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes256::new_from_slice(key).expect("32-byte key");
    let mut b = (*block).into();
    cipher.encrypt_block(&mut b);
    b.into()
}

/// AES-256-CCM encrypt. Returns `ciphertext || tag[4]`.
pub fn aes_ccm_encrypt(key: &[u8; 32], nonce: &[u8; 13], plaintext: &[u8]) -> Vec<u8> {
    let cipher = AesCcm::new_from_slice(key).expect("32-byte key");
    cipher
        .encrypt(nonce.into(), Payload { msg: plaintext, aad: &[] })
        .expect("CCM encryption with valid parameters cannot fail")
}

/// AES-256-CCM decrypt. A payload shorter than the 4-byte tag, and any
/// tag mismatch, both yield `CryptoError::AuthFail` — indistinguishable
/// to the caller, per spec §4.1.
pub fn aes_ccm_decrypt(key: &[u8; 32], nonce: &[u8; 13], payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if payload.len() < 4 {
        return Err(CryptoError::AuthFail);
    }
    let cipher = AesCcm::new_from_slice(key).expect("32-byte key");
    cipher
        .decrypt(nonce.into(), Payload { msg: payload, aad: &[] })
        .map_err(|_| CryptoError::AuthFail)
}

/// HKDF-SHA256 with an explicit empty salt, output length `L`.
pub fn hkdf_sha256(ikm: &[u8], info: &[u8], out: &mut [u8]) {
    let hk = Hkdf::<Sha256>::new(Some(&[]), ikm);
    hk.expand(info, out).expect("requested output length is valid for SHA-256 HKDF");
}

/// Big-endian +1 over all 13 bytes, carrying upward without limit.
/// Used for the raw counter arithmetic; direction-byte overflow
/// protection lives in `session::Nonce13::increment`.
pub fn inc_nonce(n: &mut [u8; 13]) {
    for byte in n.iter_mut().rev() {
        if *byte == 0xFF {
            *byte = 0;
        } else {
            *byte += 1;
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ccm_round_trip() {
        let key = [0x11u8; 32];
        let nonce = [0x01u8; 13];
        let pt = b"hello device gateway";
        let ct = aes_ccm_encrypt(&key, &nonce, pt);
        assert_eq!(ct.len(), pt.len() + 4);
        let back = aes_ccm_decrypt(&key, &nonce, &ct).unwrap();
        assert_eq!(back, pt);
    }

    #[test]
    fn ccm_flipped_ciphertext_byte_fails() {
        let key = [0x22u8; 32];
        let nonce = [0x02u8; 13];
        let mut ct = aes_ccm_encrypt(&key, &nonce, b"some plaintext data");
        ct[0] ^= 0xFF;
        assert_eq!(aes_ccm_decrypt(&key, &nonce, &ct), Err(CryptoError::AuthFail));
    }

    #[test]
    fn ccm_flipped_tag_byte_fails() {
        let key = [0x33u8; 32];
        let nonce = [0x03u8; 13];
        let mut ct = aes_ccm_encrypt(&key, &nonce, b"some plaintext data");
        let last = ct.len() - 1;
        ct[last] ^= 0xFF;
        assert_eq!(aes_ccm_decrypt(&key, &nonce, &ct), Err(CryptoError::AuthFail));
    }

    #[test]
    fn ccm_truncated_payload_fails() {
        let key = [0x44u8; 32];
        let nonce = [0x04u8; 13];
        assert_eq!(aes_ccm_decrypt(&key, &nonce, &[1, 2, 3]), Err(CryptoError::AuthFail));
    }

    #[test]
    fn hkdf_is_deterministic() {
        let ikm = [0x01u8; 32];
        let info = [0x02u8; 32];
        let mut out1 = [0u8; 32];
        let mut out2 = [0u8; 32];
        hkdf_sha256(&ikm, &info, &mut out1);
        hkdf_sha256(&ikm, &info, &mut out2);
        assert_eq!(out1, out2);
    }

    #[test]
    fn inc_nonce_wraps_and_carries() {
        let mut n = [0u8; 13];
        n[12] = 0xFF;
        inc_nonce(&mut n);
        assert_eq!(n[12], 0);
        assert_eq!(n[11], 1);
    }

    #[test]
    fn inc_nonce_simple_increment() {
        let mut n = [0u8; 13];
        n[12] = 5;
        inc_nonce(&mut n);
        assert_eq!(n[12], 6);
    }
}
