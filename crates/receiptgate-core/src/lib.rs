// SPDX-License-Identifier: MIT OR Apache-2.0
//! Stable contract types for ReceiptGate.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

mod ident;

pub use ident::{IdentifierError, ObligationId, PrincipalId, ReceiptId, TaskId};

/// The only tenant identifier in v1 (spec §9 Open Question: tenant
/// multiplicity is deferred; every receipt belongs to this tenant).
pub const DEFAULT_TENANT: &str = "default";

/// Phases a receipt can carry, used as an idempotency/conflict target *and*
/// as the marker of an obligation's lifecycle stage.
///
/// Deliberately closed: the Open Question in spec §9 about re-introducing a
/// `cancel` phase is resolved by not implementing it in v1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// A principal has taken ownership of the obligation.
    Accepted,
    /// The obligation was fulfilled.
    Complete,
    /// The obligation was handed to another principal for resolution.
    Escalate,
}

impl Phase {
    /// Returns `true` if this phase closes its obligation (spec §3.1
    /// invariant 6, `TERMINAL_PHASES`).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Escalate)
    }

    /// Stable lowercase wire representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Complete => "complete",
            Self::Escalate => "escalate",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An opaque reference to artifact bytes owned by an external artifact
/// vault (spec §1: "ReceiptGate stores only references").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactRef {
    /// Opaque handle understood by the external artifact vault.
    pub handle: String,
    /// Optional hint about the artifact's nature (e.g. `"patch"`, `"log"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// An immutable record of a phase transition in an obligation's lifecycle
/// (spec §3.1).
///
/// `canonical_hash`, `uuid`, `created_at`, and `tenant_id` are
/// server-computed or server-assigned and are excluded from the
/// canonicalizer's hash preimage (spec §4.2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Receipt {
    /// Server-assigned 128-bit identifier, unique across the whole store.
    pub uuid: Uuid,
    /// Stable external identifier, unique per tenant.
    pub receipt_id: ReceiptId,
    /// 64-char hex SHA-256 over the canonical form. `None` until computed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_hash: Option<String>,
    /// Lifecycle phase this receipt records.
    pub phase: Phase,
    /// Stable identifier grouping a receipt chain.
    pub obligation_id: ObligationId,
    /// Reference to an external execution record, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    /// Parent receipt in the same obligation. Required when
    /// `phase ∈ {complete, escalate}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caused_by_receipt_id: Option<ReceiptId>,
    /// Principal identifier of the emitter.
    pub created_by: PrincipalId,
    /// Principal identifier of the new owner.
    pub recipient_ai: PrincipalId,
    /// Principal identifier of the escalation target. Required iff
    /// `phase = escalate`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_to: Option<PrincipalId>,
    /// Ordered list of opaque artifact handles.
    #[serde(default)]
    pub artifact_refs: Vec<ArtifactRef>,
    /// Free-form structured payload.
    pub body: serde_json::Value,
    /// Wall-clock timestamp, server-assigned on commit.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Server-assigned tenant identifier (v1 is single-tenant).
    #[serde(default)]
    pub tenant_id: Option<String>,
}

impl Receipt {
    /// Returns `true` if this receipt's routing invariant holds (spec §3.1
    /// invariant 4): for `phase = escalate`, `recipient_ai == escalation_to`.
    #[must_use]
    pub fn routing_invariant_holds(&self) -> bool {
        match self.phase {
            Phase::Escalate => self.escalation_to.as_ref() == Some(&self.recipient_ai),
            _ => true,
        }
    }
}
