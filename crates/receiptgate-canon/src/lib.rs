// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "Deterministic canonicalization and SHA-256 hashing of receipts."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Produces the `canonical_hash` that spec §4.2 defines as the receipt's
//! idempotency key: `SHA-256(canonical_bytes(receipt))`, where
//! `canonical_bytes` is JSON with keys sorted lexicographically at every
//! object level, no insignificant whitespace, and `canonical_hash`,
//! `uuid`, `created_at`, `tenant_id` excluded from the preimage.
//!
//! `serde_json::Map` is backed by a `BTreeMap` (this workspace does not
//! enable the `preserve_order` feature anywhere), so any object produced
//! through `serde_json::to_value` already serializes with sorted keys at
//! every nesting level; canonicalization here only needs to strip the
//! excluded fields before serializing compactly.

use receiptgate_core::Receipt;
use sha2::{Digest, Sha256};

/// Fields excluded from the canonical hash preimage (spec §4.2).
const EXCLUDED_FIELDS: &[&str] = &["canonical_hash", "uuid", "created_at", "tenant_id"];

/// Produce the canonical JSON representation of a receipt.
///
/// # Errors
///
/// Returns a [`serde_json::Error`] if the receipt cannot be serialized.
pub fn canonicalize(receipt: &Receipt) -> Result<String, serde_json::Error> {
    let mut value = serde_json::to_value(receipt)?;
    if let serde_json::Value::Object(map) = &mut value {
        for field in EXCLUDED_FIELDS {
            map.remove(*field);
        }
    }
    serde_json::to_string(&value)
}

/// Compute the hex-encoded SHA-256 hash of the canonical receipt form.
///
/// # Errors
///
/// Returns a [`serde_json::Error`] if the receipt cannot be serialized.
pub fn compute_hash(receipt: &Receipt) -> Result<String, serde_json::Error> {
    let bytes = canonicalize(receipt)?;
    let mut hasher = Sha256::new();
    hasher.update(bytes.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// Verify that a receipt's stored `canonical_hash` matches the recomputed
/// hash. Returns `true` if there is no stored hash to check against.
#[must_use]
pub fn verify_hash(receipt: &Receipt) -> bool {
    match &receipt.canonical_hash {
        None => true,
        Some(stored) => match compute_hash(receipt) {
            Ok(recomputed) => *stored == recomputed,
            Err(_) => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use receiptgate_core::{ObligationId, Phase, PrincipalId, ReceiptId};
    use uuid::Uuid;

    fn sample() -> Receipt {
        Receipt {
            uuid: Uuid::new_v4(),
            receipt_id: ReceiptId::new("r1").unwrap(),
            canonical_hash: None,
            phase: Phase::Accepted,
            obligation_id: ObligationId::new("o1").unwrap(),
            task_id: None,
            caused_by_receipt_id: None,
            created_by: PrincipalId::new("alice").unwrap(),
            recipient_ai: PrincipalId::new("bob").unwrap(),
            escalation_to: None,
            artifact_refs: vec![],
            body: serde_json::json!({"b": 2, "a": 1}),
            created_at: Some(Utc::now()),
            tenant_id: Some("default".into()),
        }
    }

    #[test]
    fn excludes_volatile_fields() {
        let bytes = canonicalize(&sample()).unwrap();
        assert!(!bytes.contains("canonical_hash"));
        assert!(!bytes.contains("\"uuid\""));
        assert!(!bytes.contains("created_at"));
        assert!(!bytes.contains("tenant_id"));
    }

    #[test]
    fn nested_keys_are_sorted() {
        let bytes = canonicalize(&sample()).unwrap();
        let a_pos = bytes.find("\"a\":1").unwrap();
        let b_pos = bytes.find("\"b\":2").unwrap();
        assert!(a_pos < b_pos);
    }

    #[test]
    fn identical_content_hashes_identically() {
        let mut r1 = sample();
        let mut r2 = sample();
        // uuid/created_at differ but are excluded from the preimage.
        r1.uuid = Uuid::new_v4();
        r2.uuid = Uuid::new_v4();
        r1.created_at = Some(Utc::now());
        r2.created_at = None;
        assert_eq!(compute_hash(&r1).unwrap(), compute_hash(&r2).unwrap());
    }

    #[test]
    fn differing_content_hashes_differently() {
        let mut r2 = sample();
        r2.body = serde_json::json!({"a": 1, "b": 3});
        assert_ne!(compute_hash(&sample()).unwrap(), compute_hash(&r2).unwrap());
    }

    #[test]
    fn hash_is_64_char_hex() {
        let h = compute_hash(&sample()).unwrap();
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn verify_hash_detects_tamper() {
        let mut r = sample();
        r.canonical_hash = Some(compute_hash(&r).unwrap());
        assert!(verify_hash(&r));
        r.canonical_hash = Some("0".repeat(64));
        assert!(!verify_hash(&r));
    }

    #[test]
    fn canonicalize_round_trip_is_stable() {
        let r = sample();
        let once = canonicalize(&r).unwrap();
        let twice = canonicalize(&r).unwrap();
        assert_eq!(once, twice);
    }

    proptest::proptest! {
        #[test]
        fn hash_never_panics_on_arbitrary_body(s in "\\PC*") {
            let mut r = sample();
            r.body = serde_json::json!({"note": s});
            let _ = compute_hash(&r);
        }
    }
}
