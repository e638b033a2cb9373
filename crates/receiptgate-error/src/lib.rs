// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "Unified error taxonomy with stable error codes for ReceiptGate."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Every ReceiptGate error carries an [`ErrorKind`] (a machine-readable,
//! stable tag matching spec §7's error taxonomy), a human-readable message,
//! an optional cause chain, and arbitrary key-value context. Use the
//! builder returned by [`ReceiptGateError::new`] to construct errors
//! fluently, then convert with [`ReceiptGateError::to_payload`] for
//! transport over JSON-RPC.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Machine-readable, stable error kind (spec §7).
///
/// Each variant serialises to a `SCREAMING_SNAKE_CASE` string that is
/// guaranteed not to change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Schema or phase-conditional validation violation.
    ValidationFailed,
    /// Same `receipt_id`, different canonical hash.
    ReceiptConflict,
    /// `caused_by_receipt_id` does not reference an existing receipt.
    ParentMissing,
    /// The referenced parent exists but is not in the `accepted` phase.
    ParentNotAcceptedPhase,
    /// The obligation already has a terminal receipt.
    AlreadyTerminated,
    /// The requested lookup target does not exist.
    NotFound,
    /// Missing or invalid API key.
    Unauthorized,
    /// The call's deadline was exceeded.
    Timeout,
    /// Underlying database error.
    Backend,
    /// Unclassified internal error.
    Internal,
}

impl ErrorKind {
    /// Stable `&'static str` representation (e.g. `"RECEIPT_CONFLICT"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::ReceiptConflict => "RECEIPT_CONFLICT",
            Self::ParentMissing => "PARENT_MISSING",
            Self::ParentNotAcceptedPhase => "PARENT_NOT_ACCEPTED_PHASE",
            Self::AlreadyTerminated => "ALREADY_TERMINATED",
            Self::NotFound => "NOT_FOUND",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Timeout => "TIMEOUT",
            Self::Backend => "BACKEND",
            Self::Internal => "INTERNAL",
        }
    }

    /// JSON-RPC 2.0 error code. Standard codes (-32700..-32600) are
    /// reserved for envelope-level failures handled in `receiptgate-rpc`;
    /// application errors use the implementation-defined range below
    /// -32000.
    pub fn json_rpc_code(&self) -> i64 {
        match self {
            Self::ValidationFailed => -32602,
            Self::Unauthorized => -32001,
            Self::Timeout => -32002,
            Self::NotFound => -32004,
            Self::ReceiptConflict => -32010,
            Self::ParentMissing => -32011,
            Self::ParentNotAcceptedPhase => -32012,
            Self::AlreadyTerminated => -32013,
            Self::Backend => -32020,
            Self::Internal => -32603,
        }
    }

    /// HTTP status hint (spec §7's "HTTP hint" column); used by `GET
    /// /health` and by callers that bridge to plain HTTP.
    pub fn http_status_hint(&self) -> u16 {
        match self {
            Self::ValidationFailed => 400,
            Self::Unauthorized => 401,
            Self::NotFound | Self::ParentMissing => 404,
            Self::ReceiptConflict | Self::ParentNotAcceptedPhase | Self::AlreadyTerminated => 409,
            Self::Timeout => 504,
            Self::Backend => 502,
            Self::Internal => 500,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified ReceiptGate error.
///
/// Carries a stable [`ErrorKind`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context (e.g.
/// the conflicting hash for [`ErrorKind::ReceiptConflict`]).
pub struct ReceiptGateError {
    /// Machine-readable error kind.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics, surfaced as
    /// `error.data` in the JSON-RPC envelope.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl ReceiptGateError {
    /// Create a new error with the given kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if
    /// serialisation fails, the entry is silently skipped.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Convert to the wire-serialisable [`ErrorPayload`] used by
    /// `receiptgate-rpc`'s JSON-RPC error envelope.
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            kind: self.kind,
            message: self.message.clone(),
            context: self.context.clone(),
        }
    }
}

impl fmt::Debug for ReceiptGateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("ReceiptGateError");
        d.field("kind", &self.kind);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for ReceiptGateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind.as_str(), self.message)?;
        if !self.context.is_empty()
            && let Ok(ctx) = serde_json::to_string(&self.context)
        {
            write!(f, " {ctx}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ReceiptGateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Wire-serialisable snapshot of a [`ReceiptGateError`] (no opaque source).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    /// Stable error kind.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Structured context (e.g. conflicting hash, offending field).
    pub context: BTreeMap<String, serde_json::Value>,
}
