// SPDX-License-Identifier: MIT OR Apache-2.0
//! Row shapes for each backend dialect, and their conversion to the
//! domain [`Receipt`] type.
//!
//! SQLite stores identifiers and the hash as `TEXT` and both JSON columns
//! as serialized `TEXT`; Postgres stores them as native `UUID`/`JSONB`. The
//! two backends therefore get distinct `FromRow` shapes rather than one
//! struct forced to satisfy `sqlx::Type` for both dialects.

use chrono::{DateTime, Utc};
use receiptgate_core::{ArtifactRef, ObligationId, Phase, PrincipalId, Receipt, ReceiptId, TaskId};
use receiptgate_error::{ErrorKind, ReceiptGateError};
use uuid::Uuid;

fn parse_phase(raw: &str) -> Result<Phase, ReceiptGateError> {
    match raw {
        "accepted" => Ok(Phase::Accepted),
        "complete" => Ok(Phase::Complete),
        "escalate" => Ok(Phase::Escalate),
        other => Err(ReceiptGateError::new(
            ErrorKind::Internal,
            format!("stored receipt has unrecognised phase {other:?}"),
        )),
    }
}

/// Row shape returned by SQLite queries against the `receipts` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SqliteReceiptRow {
    pub uuid: String,
    pub receipt_id: String,
    pub canonical_hash: String,
    pub phase: String,
    pub obligation_id: String,
    pub task_id: Option<String>,
    pub caused_by_receipt_id: Option<String>,
    pub created_by: String,
    pub recipient_ai: String,
    pub escalation_to: Option<String>,
    pub artifact_refs: String,
    pub body: String,
    pub created_at: String,
    pub tenant_id: String,
}

impl TryFrom<SqliteReceiptRow> for Receipt {
    type Error = ReceiptGateError;

    fn try_from(row: SqliteReceiptRow) -> Result<Self, Self::Error> {
        let internal = |e: impl std::fmt::Display| {
            ReceiptGateError::new(ErrorKind::Internal, format!("corrupt stored receipt: {e}"))
        };
        Ok(Receipt {
            uuid: row.uuid.parse::<Uuid>().map_err(internal)?,
            receipt_id: ReceiptId::new(row.receipt_id).map_err(internal)?,
            canonical_hash: Some(row.canonical_hash),
            phase: parse_phase(&row.phase)?,
            obligation_id: ObligationId::new(row.obligation_id).map_err(internal)?,
            task_id: row.task_id.map(TaskId::new).transpose().map_err(internal)?,
            caused_by_receipt_id: row
                .caused_by_receipt_id
                .map(ReceiptId::new)
                .transpose()
                .map_err(internal)?,
            created_by: PrincipalId::new(row.created_by).map_err(internal)?,
            recipient_ai: PrincipalId::new(row.recipient_ai).map_err(internal)?,
            escalation_to: row
                .escalation_to
                .map(PrincipalId::new)
                .transpose()
                .map_err(internal)?,
            artifact_refs: serde_json::from_str::<Vec<ArtifactRef>>(&row.artifact_refs)
                .map_err(internal)?,
            body: serde_json::from_str(&row.body).map_err(internal)?,
            created_at: Some(row.created_at.parse::<DateTime<Utc>>().map_err(internal)?),
            tenant_id: Some(row.tenant_id),
        })
    }
}

/// Row shape returned by Postgres queries against the `receipts` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PgReceiptRow {
    pub uuid: Uuid,
    pub receipt_id: String,
    pub canonical_hash: String,
    pub phase: String,
    pub obligation_id: String,
    pub task_id: Option<String>,
    pub caused_by_receipt_id: Option<String>,
    pub created_by: String,
    pub recipient_ai: String,
    pub escalation_to: Option<String>,
    pub artifact_refs: serde_json::Value,
    pub body: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub tenant_id: String,
}

impl TryFrom<PgReceiptRow> for Receipt {
    type Error = ReceiptGateError;

    fn try_from(row: PgReceiptRow) -> Result<Self, Self::Error> {
        let internal = |e: impl std::fmt::Display| {
            ReceiptGateError::new(ErrorKind::Internal, format!("corrupt stored receipt: {e}"))
        };
        Ok(Receipt {
            uuid: row.uuid,
            receipt_id: ReceiptId::new(row.receipt_id).map_err(internal)?,
            canonical_hash: Some(row.canonical_hash),
            phase: parse_phase(&row.phase)?,
            obligation_id: ObligationId::new(row.obligation_id).map_err(internal)?,
            task_id: row.task_id.map(TaskId::new).transpose().map_err(internal)?,
            caused_by_receipt_id: row
                .caused_by_receipt_id
                .map(ReceiptId::new)
                .transpose()
                .map_err(internal)?,
            created_by: PrincipalId::new(row.created_by).map_err(internal)?,
            recipient_ai: PrincipalId::new(row.recipient_ai).map_err(internal)?,
            escalation_to: row
                .escalation_to
                .map(PrincipalId::new)
                .transpose()
                .map_err(internal)?,
            artifact_refs: serde_json::from_value(row.artifact_refs).map_err(internal)?,
            body: row.body,
            created_at: Some(row.created_at),
            tenant_id: Some(row.tenant_id),
        })
    }
}
