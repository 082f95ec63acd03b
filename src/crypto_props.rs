//! Property-based tests for the crypto/session primitives (spec §8
//! universal invariants 2-4).
//!
//! Grounded on `zrc-rendezvous::mailbox_props` (a sibling `proptest!`
//! module kept alongside the module it exercises), generalized here
//! from mailbox queue-ordering properties to AEAD round-trip, tamper
//! detection and nonce monotonicity.

use proptest::prelude::*;

use crate::crypto::{aes_ccm_decrypt, aes_ccm_encrypt};
use crate::session::Nonce13;

proptest! {
    /// §8 property 2 (partial): CCM round-trips arbitrary plaintext
    /// under any key/nonce pair.
    #[test]
    fn ccm_round_trips_arbitrary_plaintext(
        key in prop::array::uniform32(any::<u8>()),
        nonce in prop::array::uniform13(any::<u8>()),
        plaintext in prop::collection::vec(any::<u8>(), 0..512),
    ) {
        let ct = aes_ccm_encrypt(&key, &nonce, &plaintext);
        prop_assert_eq!(ct.len(), plaintext.len() + 4);
        let pt = aes_ccm_decrypt(&key, &nonce, &ct).unwrap();
        prop_assert_eq!(pt, plaintext);
    }

    /// §8 property 4: a single flipped byte anywhere in the record
    /// (ciphertext or tag) always yields `AuthFail`, never a different
    /// error kind and never a silent wrong-plaintext success.
    #[test]
    fn any_single_bit_flip_is_rejected(
        key in prop::array::uniform32(any::<u8>()),
        nonce in prop::array::uniform13(any::<u8>()),
        plaintext in prop::collection::vec(any::<u8>(), 1..128),
        flip_index in 0usize..1000,
        flip_bit in 0u8..8,
    ) {
        let ct = aes_ccm_encrypt(&key, &nonce, &plaintext);
        let idx = flip_index % ct.len();
        let mut tampered = ct.clone();
        tampered[idx] ^= 1 << flip_bit;
        prop_assert!(aes_ccm_decrypt(&key, &nonce, &tampered).is_err());
    }

    /// §8 property 3: incrementing a nonce `n` times never reuses a
    /// prior value and always moves only the low 12 bytes.
    #[test]
    fn nonce_increments_never_repeat(steps in 1usize..300) {
        let mut nonce = Nonce13::client_initial();
        let mut seen = std::collections::HashSet::new();
        seen.insert(nonce.0);
        for _ in 0..steps {
            nonce.increment().expect("steps bounded well below 2^96 - 1");
            prop_assert!(seen.insert(nonce.0), "nonce value reused");
            prop_assert_eq!(nonce.0[0], 1, "leading direction byte must never move");
        }
    }
}
