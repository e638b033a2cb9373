// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "Structural and phase-conditional validation of incoming receipts."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Implements the five ordered checks of spec §4.3: structural, enum,
//! body size, phase-conditional, identifier shape. Each check runs in
//! order and the first one to fail short-circuits the rest, so a caller
//! only ever sees one class of problem at a time — but every offending
//! field within that class is reported together, following the teacher's
//! `RequestValidator::validate_work_order` convention of accumulating all
//! violations found at a given level rather than stopping at the first.
//!
//! This module never touches the database: parent existence and
//! terminality checks belong to the ledger core (spec §4.4), which is the
//! only component allowed to see committed rows.

use receiptgate_core::{ArtifactRef, ObligationId, Phase, PrincipalId, Receipt, ReceiptId, TaskId};
use receiptgate_error::{ErrorKind, ReceiptGateError};
use serde_json::Value;
use uuid::Uuid;

/// Default cap on a receipt's serialized body size (256 KiB), per spec §3.1
/// invariant 7 and §6.4 `RECEIPTGATE_RECEIPT_BODY_MAX_BYTES`.
pub const DEFAULT_BODY_MAX_BYTES: usize = 262_144;

const TOP_LEVEL_FIELDS: &[&str] = &[
    "uuid",
    "receipt_id",
    "phase",
    "obligation_id",
    "task_id",
    "caused_by_receipt_id",
    "created_by",
    "recipient_ai",
    "escalation_to",
    "artifact_refs",
    "body",
];

/// Validate a raw JSON-RPC `receipt` parameter and produce a [`Receipt`]
/// ready for canonicalization and append.
///
/// The returned receipt has no `uuid` assigned unless the caller supplied
/// one, and no `canonical_hash`, `created_at`, or `tenant_id` — those are
/// filled in by the ledger core on commit (spec §4.4 steps 1 and 6).
///
/// # Errors
///
/// Returns [`ErrorKind::ValidationFailed`] for the first failing check
/// category, with every offending field for that category in
/// `error.context["errors"]`.
pub fn validate_receipt(raw: &Value, max_body_bytes: usize) -> Result<Receipt, ReceiptGateError> {
    let obj = check_structural(raw)?;
    let phase = check_enumeration(obj)?;
    check_body_size(obj, max_body_bytes)?;
    check_phase_conditional(obj, phase)?;
    let receipt = check_identifier_shapes(obj, phase)?;
    Ok(receipt)
}

fn validation_failed(errors: Vec<String>) -> ReceiptGateError {
    ReceiptGateError::new(ErrorKind::ValidationFailed, errors.join("; ")).with_context("errors", errors)
}

// -- 1. Structural ----------------------------------------------------------

fn check_structural(raw: &Value) -> Result<&serde_json::Map<String, Value>, ReceiptGateError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| validation_failed(vec!["receipt must be a JSON object".into()]))?;

    let mut errors = Vec::new();

    for required in ["receipt_id", "phase", "obligation_id", "created_by", "recipient_ai", "body"] {
        if !obj.contains_key(required) {
            errors.push(format!("missing required field '{required}'"));
        }
    }

    for key in obj.keys() {
        if !TOP_LEVEL_FIELDS.contains(&key.as_str()) {
            errors.push(format!("unknown field '{key}'"));
        }
    }

    for (field, check) in [
        ("receipt_id", &is_string as &dyn Fn(&Value) -> bool),
        ("phase", &is_string),
        ("obligation_id", &is_string),
        ("created_by", &is_string),
        ("recipient_ai", &is_string),
    ] {
        if let Some(v) = obj.get(field)
            && !check(v)
        {
            errors.push(format!("field '{field}' must be a string"));
        }
    }
    if let Some(v) = obj.get("task_id")
        && !v.is_null()
        && !is_string(v)
    {
        errors.push("field 'task_id' must be a string".into());
    }
    if let Some(v) = obj.get("caused_by_receipt_id")
        && !v.is_null()
        && !is_string(v)
    {
        errors.push("field 'caused_by_receipt_id' must be a string".into());
    }
    if let Some(v) = obj.get("escalation_to")
        && !v.is_null()
        && !is_string(v)
    {
        errors.push("field 'escalation_to' must be a string".into());
    }
    if let Some(v) = obj.get("artifact_refs")
        && !v.is_array()
    {
        errors.push("field 'artifact_refs' must be an array".into());
    }
    if let Some(v) = obj.get("uuid")
        && !v.is_null()
        && (!is_string(v) || v.as_str().and_then(|s| s.parse::<Uuid>().ok()).is_none())
    {
        errors.push("field 'uuid' must be a valid UUID string".into());
    }

    if errors.is_empty() {
        Ok(obj)
    } else {
        Err(validation_failed(errors))
    }
}

fn is_string(v: &Value) -> bool {
    v.is_string()
}

// -- 2. Enumeration -----------------------------------------------------------

fn check_enumeration(obj: &serde_json::Map<String, Value>) -> Result<Phase, ReceiptGateError> {
    let raw = obj.get("phase").and_then(Value::as_str).unwrap_or_default();
    match raw {
        "accepted" => Ok(Phase::Accepted),
        "complete" => Ok(Phase::Complete),
        "escalate" => Ok(Phase::Escalate),
        other => Err(validation_failed(vec![format!(
            "phase '{other}' is not one of accepted, complete, escalate"
        )])),
    }
}

// -- 3. Body size --------------------------------------------------------------

fn check_body_size(
    obj: &serde_json::Map<String, Value>,
    max_body_bytes: usize,
) -> Result<(), ReceiptGateError> {
    let body = obj.get("body").cloned().unwrap_or(Value::Null);
    let size = serde_json::to_vec(&body)
        .map(|b| b.len())
        .unwrap_or(usize::MAX);
    if size > max_body_bytes {
        Err(validation_failed(vec![format!(
            "body size {size} exceeds maximum of {max_body_bytes} bytes"
        )]))
    } else {
        Ok(())
    }
}

// -- 4. Phase-conditional ------------------------------------------------------

fn check_phase_conditional(
    obj: &serde_json::Map<String, Value>,
    phase: Phase,
) -> Result<(), ReceiptGateError> {
    let has_caused_by = obj.get("caused_by_receipt_id").is_some_and(|v| !v.is_null());
    let has_escalation_to = obj.get("escalation_to").is_some_and(|v| !v.is_null());

    let mut errors = Vec::new();
    match phase {
        Phase::Accepted => {
            if has_caused_by {
                errors.push("caused_by_receipt_id is forbidden for phase 'accepted'".into());
            }
        }
        Phase::Complete => {
            if !has_caused_by {
                errors.push("caused_by_receipt_id is required for phase 'complete'".into());
            }
            if has_escalation_to {
                errors.push("escalation_to is forbidden for phase 'complete'".into());
            }
        }
        Phase::Escalate => {
            if !has_caused_by {
                errors.push("caused_by_receipt_id is required for phase 'escalate'".into());
            }
            if !has_escalation_to {
                errors.push("escalation_to is required for phase 'escalate'".into());
            } else if obj.get("recipient_ai").and_then(Value::as_str)
                != obj.get("escalation_to").and_then(Value::as_str)
            {
                errors.push("recipient_ai must equal escalation_to for phase 'escalate'".into());
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(validation_failed(errors))
    }
}

// -- 5. Identifier shape --------------------------------------------------------

fn check_identifier_shapes(
    obj: &serde_json::Map<String, Value>,
    phase: Phase,
) -> Result<Receipt, ReceiptGateError> {
    let mut errors = Vec::new();

    let receipt_id = field_identifier(obj, "receipt_id", &mut errors, ReceiptId::new);
    let obligation_id = field_identifier(obj, "obligation_id", &mut errors, ObligationId::new);
    let created_by = field_identifier(obj, "created_by", &mut errors, PrincipalId::new);
    let recipient_ai = field_identifier(obj, "recipient_ai", &mut errors, PrincipalId::new);
    let task_id = optional_field_identifier(obj, "task_id", &mut errors, TaskId::new);
    let caused_by_receipt_id =
        optional_field_identifier(obj, "caused_by_receipt_id", &mut errors, ReceiptId::new);
    let escalation_to =
        optional_field_identifier(obj, "escalation_to", &mut errors, PrincipalId::new);

    if !errors.is_empty() {
        return Err(validation_failed(errors));
    }

    let uuid = obj
        .get("uuid")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<Uuid>().ok());

    let artifact_refs = obj
        .get("artifact_refs")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|v| serde_json::from_value::<ArtifactRef>(v.clone()).ok())
                .collect()
        })
        .unwrap_or_default();

    Ok(Receipt {
        uuid: uuid.unwrap_or_else(Uuid::nil),
        receipt_id: receipt_id.expect("checked above"),
        canonical_hash: None,
        phase,
        obligation_id: obligation_id.expect("checked above"),
        task_id,
        caused_by_receipt_id,
        created_by: created_by.expect("checked above"),
        recipient_ai: recipient_ai.expect("checked above"),
        escalation_to,
        artifact_refs,
        body: obj.get("body").cloned().unwrap_or(Value::Null),
        created_at: None,
        tenant_id: None,
    })
}

fn field_identifier<T, E: std::fmt::Display>(
    obj: &serde_json::Map<String, Value>,
    field: &str,
    errors: &mut Vec<String>,
    ctor: impl Fn(String) -> Result<T, E>,
) -> Option<T> {
    let raw = obj.get(field).and_then(Value::as_str).unwrap_or_default();
    match ctor(raw.to_string()) {
        Ok(v) => Some(v),
        Err(e) => {
            errors.push(format!("field '{field}': {e}"));
            None
        }
    }
}

fn optional_field_identifier<T, E: std::fmt::Display>(
    obj: &serde_json::Map<String, Value>,
    field: &str,
    errors: &mut Vec<String>,
    ctor: impl Fn(String) -> Result<T, E>,
) -> Option<T> {
    let raw = obj.get(field).and_then(Value::as_str)?;
    match ctor(raw.to_string()) {
        Ok(v) => Some(v),
        Err(e) => {
            errors.push(format!("field '{field}': {e}"));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn accepted() -> Value {
        json!({
            "receipt_id": "r1",
            "phase": "accepted",
            "obligation_id": "o1",
            "created_by": "alice",
            "recipient_ai": "bob",
            "body": {"note": "hi"},
        })
    }

    #[test]
    fn accepts_minimal_valid_receipt() {
        let r = validate_receipt(&accepted(), DEFAULT_BODY_MAX_BYTES).unwrap();
        assert_eq!(r.phase, Phase::Accepted);
        assert_eq!(r.receipt_id.as_str(), "r1");
    }

    #[test]
    fn rejects_non_object() {
        let err = validate_receipt(&json!("not an object"), DEFAULT_BODY_MAX_BYTES).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValidationFailed);
    }

    #[test]
    fn rejects_missing_required_field() {
        let mut v = accepted();
        v.as_object_mut().unwrap().remove("created_by");
        let err = validate_receipt(&v, DEFAULT_BODY_MAX_BYTES).unwrap_err();
        assert!(err.message.contains("created_by"));
    }

    #[test]
    fn rejects_unknown_top_level_field() {
        let mut v = accepted();
        v.as_object_mut().unwrap().insert("bogus".into(), json!(1));
        let err = validate_receipt(&v, DEFAULT_BODY_MAX_BYTES).unwrap_err();
        assert!(err.message.contains("unknown field"));
    }

    #[test]
    fn rejects_bad_phase_enum() {
        let mut v = accepted();
        v["phase"] = json!("cancel");
        let err = validate_receipt(&v, DEFAULT_BODY_MAX_BYTES).unwrap_err();
        assert!(err.message.contains("not one of"));
    }

    #[test]
    fn rejects_oversized_body() {
        let mut v = accepted();
        v["body"] = json!({"blob": "x".repeat(100)});
        let err = validate_receipt(&v, 10).unwrap_err();
        assert!(err.message.contains("exceeds maximum"));
    }

    #[test]
    fn accepted_forbids_caused_by() {
        let mut v = accepted();
        v["caused_by_receipt_id"] = json!("r0");
        let err = validate_receipt(&v, DEFAULT_BODY_MAX_BYTES).unwrap_err();
        assert!(err.message.contains("forbidden"));
    }

    #[test]
    fn complete_requires_caused_by() {
        let mut v = accepted();
        v["phase"] = json!("complete");
        let err = validate_receipt(&v, DEFAULT_BODY_MAX_BYTES).unwrap_err();
        assert!(err.message.contains("required"));
    }

    #[test]
    fn complete_forbids_escalation_to() {
        let mut v = accepted();
        v["phase"] = json!("complete");
        v["caused_by_receipt_id"] = json!("r0");
        v["escalation_to"] = json!("carol");
        let err = validate_receipt(&v, DEFAULT_BODY_MAX_BYTES).unwrap_err();
        assert!(err.message.contains("forbidden"));
    }

    #[test]
    fn escalate_requires_matching_recipient() {
        let mut v = accepted();
        v["phase"] = json!("escalate");
        v["caused_by_receipt_id"] = json!("r0");
        v["escalation_to"] = json!("carol");
        let err = validate_receipt(&v, DEFAULT_BODY_MAX_BYTES).unwrap_err();
        assert!(err.message.contains("must equal"));
    }

    #[test]
    fn escalate_accepted_when_routing_matches() {
        let mut v = accepted();
        v["phase"] = json!("escalate");
        v["caused_by_receipt_id"] = json!("r0");
        v["recipient_ai"] = json!("carol");
        v["escalation_to"] = json!("carol");
        let r = validate_receipt(&v, DEFAULT_BODY_MAX_BYTES).unwrap();
        assert_eq!(r.phase, Phase::Escalate);
        assert!(r.routing_invariant_holds());
    }

    #[test]
    fn rejects_bad_identifier_shape() {
        let mut v = accepted();
        v["obligation_id"] = json!("not a valid id!");
        let err = validate_receipt(&v, DEFAULT_BODY_MAX_BYTES).unwrap_err();
        assert!(err.message.contains("obligation_id"));
    }

    #[test]
    fn accepts_explicit_uuid() {
        let mut v = accepted();
        let id = Uuid::new_v4();
        v["uuid"] = json!(id.to_string());
        let r = validate_receipt(&v, DEFAULT_BODY_MAX_BYTES).unwrap();
        assert_eq!(r.uuid, id);
    }
}
