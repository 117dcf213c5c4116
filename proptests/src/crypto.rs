//! Property-based tests for the streaming cipher.
//!
//! Tests the following invariants:
//! - C-1: Round-trip integrity: decrypt(key, encrypt(key, data)) == data
//! - C-2: Ciphertext length = plaintext length + 16 (the IV prefix)
//! - C-3: Ciphertext never equals plaintext (for inputs ≥ 32 bytes)
//! - C-4: Every encryption draws a fresh IV
//! - C-5: A different key does not recover the plaintext

#![allow(unused_imports)]
use crate::block_on;
use crate::strategies::*;
use common::crypto::{copy_decrypt, copy_encrypt, generate_key, IV_SIZE};
use proptest::prelude::*;
use std::io::Cursor;

async fn encrypt(key: &[u8], plaintext: &[u8]) -> Vec<u8> {
    let mut src = plaintext;
    let mut dst = Cursor::new(Vec::new());
    copy_encrypt(key, &mut src, &mut dst)
        .await
        .expect("encryption should succeed");
    dst.into_inner()
}

async fn decrypt(key: &[u8], ciphertext: &[u8]) -> Vec<u8> {
    let mut src = ciphertext;
    let mut dst = Cursor::new(Vec::new());
    copy_decrypt(key, &mut src, &mut dst)
        .await
        .expect("decryption should succeed");
    dst.into_inner()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// C-1 and C-2: round trip recovers the input; ciphertext carries
    /// exactly a 16-byte overhead.
    #[test]
    fn prop_roundtrip_and_length(data in payload()) {
        let key = generate_key();
        let (ciphertext, decrypted) = block_on(async {
            let ciphertext = encrypt(&key, &data).await;
            let decrypted = decrypt(&key, &ciphertext).await;
            (ciphertext, decrypted)
        });

        prop_assert_eq!(ciphertext.len(), data.len() + IV_SIZE);
        prop_assert_eq!(decrypted, data);
    }

    /// C-3: the ciphertext body must not be the plaintext.
    #[test]
    fn prop_ciphertext_differs_from_plaintext(data in long_payload()) {
        let key = generate_key();
        let ciphertext = block_on(encrypt(&key, &data));
        prop_assert_ne!(&ciphertext[IV_SIZE..], &data[..]);
    }

    /// C-4: encrypting the same input twice produces distinct IVs and
    /// distinct ciphertexts.
    #[test]
    fn prop_fresh_iv_every_time(data in payload()) {
        let key = generate_key();
        let (first, second) = block_on(async {
            (encrypt(&key, &data).await, encrypt(&key, &data).await)
        });
        prop_assert_ne!(&first[..IV_SIZE], &second[..IV_SIZE]);
    }

    /// C-5: decrypting under a different key yields garbage, silently — CTR
    /// is unauthenticated by design here.
    #[test]
    fn prop_wrong_key_does_not_recover(data in long_payload()) {
        let (ciphertext, garbage) = block_on(async {
            let ciphertext = encrypt(&generate_key(), &data).await;
            let garbage = decrypt(&generate_key(), &ciphertext).await;
            (ciphertext, garbage)
        });
        prop_assert_eq!(garbage.len() + IV_SIZE, ciphertext.len());
        prop_assert_ne!(garbage, data);
    }
}
