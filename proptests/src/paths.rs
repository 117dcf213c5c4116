//! Property-based tests for key hashing and CAS path derivation.
//!
//! Tests the following invariants:
//! - P-1: The path directory is 8 segments of 5 hex characters whose
//!   concatenation is the file name
//! - P-2: The file name is the 40-character lowercase hex SHA-1 digest
//! - P-3: Derivation is deterministic
//! - P-4: The wire identifier is 32 lowercase hex characters

#![allow(unused_imports)]
use crate::strategies::*;
use common::crypto::{cas_path, hash_key};
use proptest::prelude::*;

fn is_lower_hex(s: &str) -> bool {
    s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    /// P-1: segment shape.
    #[test]
    fn prop_path_segments(key in logical_key()) {
        let path = cas_path(&key);
        let segments: Vec<&str> = path.dir.split('/').collect();
        prop_assert_eq!(segments.len(), 8);
        for segment in &segments {
            prop_assert_eq!(segment.len(), 5);
        }
        prop_assert_eq!(path.dir.replace('/', ""), path.filename.clone());
        prop_assert_eq!(path.relative(), format!("{}/{}", path.dir, path.filename));
    }

    /// P-2: digest shape.
    #[test]
    fn prop_filename_is_sha1_hex(key in logical_key()) {
        let path = cas_path(&key);
        prop_assert_eq!(path.filename.len(), 40);
        prop_assert!(is_lower_hex(&path.filename));
    }

    /// P-3: determinism.
    #[test]
    fn prop_derivation_is_deterministic(key in logical_key()) {
        prop_assert_eq!(cas_path(&key), cas_path(&key));
        prop_assert_eq!(hash_key(&key), hash_key(&key));
    }

    /// P-4: wire identifier shape.
    #[test]
    fn prop_wire_identifier_is_md5_hex(key in logical_key()) {
        let id = hash_key(&key);
        prop_assert_eq!(id.len(), 32);
        prop_assert!(is_lower_hex(&id));
    }
}
