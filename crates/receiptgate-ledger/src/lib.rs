// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "Coordinates validation, canonicalization, and persistence of an incoming receipt."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! [`append`] is the single entry point `receiptgate-rpc`'s `receiptgate.append`
//! handler calls. It runs validation and hashing here, then hands the
//! result to [`receiptgate_store::Store::append_receipt`], which owns the
//! transactional parent/terminal checks and insert because those need a
//! live connection to the backend (spec §4.4).

use receiptgate_core::Receipt;
use receiptgate_error::ReceiptGateError;
use receiptgate_store::Store;
use receiptgate_validate::DEFAULT_BODY_MAX_BYTES;

/// Validate, canonicalize, and persist a raw receipt.
///
/// # Errors
///
/// Returns [`ReceiptGateError`] with [`ErrorKind::ValidationFailed`] for a
/// malformed request, or whichever kind [`Store::append_receipt`] raised for
/// a conflict, missing parent, wrong parent phase, or already-terminated
/// obligation.
///
/// [`ErrorKind::ValidationFailed`]: receiptgate_error::ErrorKind::ValidationFailed
pub async fn append(
    store: &Store,
    raw: &serde_json::Value,
    body_max_bytes: Option<usize>,
    write_edges: bool,
) -> Result<Receipt, ReceiptGateError> {
    let receipt = receiptgate_validate::validate_receipt(
        raw,
        body_max_bytes.unwrap_or(DEFAULT_BODY_MAX_BYTES),
    )?;
    let hash = receiptgate_canon::compute_hash(&receipt).map_err(|e| {
        ReceiptGateError::new(receiptgate_error::ErrorKind::Internal, "canonicalize receipt")
            .with_source(e)
    })?;
    let stored = store.append_receipt(receipt, hash, write_edges).await?;
    tracing::info!(
        receipt_id = %stored.receipt_id,
        obligation_id = %stored.obligation_id,
        phase = %stored.phase,
        "receipt appended"
    );
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn sqlite_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let store = Store::connect(&url, true).await.unwrap();
        (store, dir)
    }

    fn accepted(receipt_id: &str, obligation_id: &str) -> serde_json::Value {
        json!({
            "receipt_id": receipt_id,
            "phase": "accepted",
            "obligation_id": obligation_id,
            "created_by": "alice",
            "recipient_ai": "bob",
            "body": {"note": "hi"},
        })
    }

    #[tokio::test]
    async fn appends_and_assigns_server_fields() {
        let (store, _dir) = sqlite_store().await;
        let receipt = append(&store, &accepted("r1", "o1"), None, true).await.unwrap();
        assert!(!receipt.uuid.is_nil());
        assert!(receipt.created_at.is_some());
        assert!(receipt.canonical_hash.is_some());
    }

    #[tokio::test]
    async fn replaying_identical_receipt_is_idempotent() {
        let (store, _dir) = sqlite_store().await;
        let first = append(&store, &accepted("r1", "o1"), None, true).await.unwrap();
        let second = append(&store, &accepted("r1", "o1"), None, true).await.unwrap();
        assert_eq!(first.uuid, second.uuid);
    }

    #[tokio::test]
    async fn conflicting_replay_is_rejected() {
        let (store, _dir) = sqlite_store().await;
        append(&store, &accepted("r1", "o1"), None, true).await.unwrap();
        let mut conflicting = accepted("r1", "o1");
        conflicting["body"] = json!({"note": "different"});
        let err = append(&store, &conflicting, None, true).await.unwrap_err();
        assert_eq!(err.kind, receiptgate_error::ErrorKind::ReceiptConflict);
    }

    #[tokio::test]
    async fn complete_without_existing_parent_is_rejected() {
        let (store, _dir) = sqlite_store().await;
        let mut complete = accepted("r2", "o1");
        complete["phase"] = json!("complete");
        complete["caused_by_receipt_id"] = json!("missing-parent");
        let err = append(&store, &complete, None, true).await.unwrap_err();
        assert_eq!(err.kind, receiptgate_error::ErrorKind::ParentMissing);
    }

    #[tokio::test]
    async fn second_terminal_receipt_on_same_obligation_is_rejected() {
        let (store, _dir) = sqlite_store().await;
        append(&store, &accepted("r1", "o1"), None, true).await.unwrap();
        let mut complete = accepted("r2", "o1");
        complete["phase"] = json!("complete");
        complete["caused_by_receipt_id"] = json!("r1");
        append(&store, &complete, None, true).await.unwrap();

        let mut escalate = accepted("r3", "o1");
        escalate["phase"] = json!("escalate");
        escalate["caused_by_receipt_id"] = json!("r1");
        escalate["escalation_to"] = json!("bob");
        let err = append(&store, &escalate, None, true).await.unwrap_err();
        assert_eq!(err.kind, receiptgate_error::ErrorKind::AlreadyTerminated);
    }
}
