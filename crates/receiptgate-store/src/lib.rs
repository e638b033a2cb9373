// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "sqlx-backed persistence for receipts, across sqlite and postgres."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod row;

pub use backend::Backend;

use chrono::Utc;
use receiptgate_core::{DEFAULT_TENANT, Phase, Receipt};
use receiptgate_error::{ErrorKind, ReceiptGateError};
use row::{PgReceiptRow, SqliteReceiptRow};
use sqlx::Row as _;
use std::future::Future;
use uuid::Uuid;

fn internal(context: &'static str) -> impl Fn(sqlx::Error) -> ReceiptGateError {
    move |e| ReceiptGateError::new(ErrorKind::Backend, context).with_source(e)
}

/// Retry a fallible backend operation once on [`ErrorKind::Backend`] (spec
/// §7: "backend errors retry once at the Store layer"). Every query in
/// this module is read-only or written to tolerate a duplicate attempt
/// (idempotent insert, `ON CONFLICT DO NOTHING`, or upsert), so a blind
/// single retry is safe here even though it would not be for an arbitrary
/// caller.
async fn retry_once<T, F, Fut>(mut op: F) -> Result<T, ReceiptGateError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ReceiptGateError>>,
{
    match op().await {
        Ok(value) => Ok(value),
        Err(err) if err.kind == ErrorKind::Backend => {
            tracing::warn!(error = %err, "backend error, retrying once");
            op().await
        }
        Err(err) => Err(err),
    }
}

/// An opaque pagination position: the `(created_at, receipt_id)` pair of
/// the last row a caller has already seen (spec §4.5). Encoding this as a
/// wire token is the RPC layer's concern; `Store` only needs the typed
/// pair to build the "rows strictly after this one" predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor {
    /// `created_at` of the last row already returned.
    pub created_at: chrono::DateTime<Utc>,
    /// `receipt_id` of the last row already returned, for tie-breaking.
    pub receipt_id: String,
}

/// Optional filter axes for [`Store::search_receipts`] (spec §4.5).
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    /// Restrict to this obligation.
    pub obligation_id: Option<String>,
    /// Restrict to receipts addressed to this principal.
    pub recipient_ai: Option<String>,
    /// Restrict to receipts created by this principal.
    pub created_by: Option<String>,
    /// Restrict to this lifecycle phase.
    pub phase: Option<Phase>,
    /// Restrict to receipts referencing this external task.
    pub task_id: Option<String>,
    /// Restrict to receipts whose `receipt_id` contains this substring.
    pub receipt_id_contains: Option<String>,
    /// Only include receipts created at or after this timestamp.
    pub created_after: Option<chrono::DateTime<Utc>>,
    /// Only include receipts created at or before this timestamp.
    pub created_before: Option<chrono::DateTime<Utc>>,
}

/// A connected, migrated persistence handle.
#[derive(Debug, Clone)]
pub struct Store {
    backend: Backend,
}

impl Store {
    /// Connect to `database_url` and, if `auto_migrate` is set, bring the
    /// schema up to date immediately.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Backend`] if the connection fails, or a
    /// migration error (tagged via [`ReceiptGateError::with_context`] under
    /// `"stage" = "migrate"`) if `auto_migrate` is set and applying
    /// migrations fails.
    pub async fn connect(database_url: &str, auto_migrate: bool) -> Result<Self, ReceiptGateError> {
        let backend = Backend::connect(database_url).await?;
        if auto_migrate {
            backend
                .migrate()
                .await
                .map_err(|e| e.with_context("stage", "migrate"))?;
        }
        Ok(Self { backend })
    }

    /// Run migrations explicitly (used by the `migrate` CLI subcommand,
    /// independent of `auto_migrate`).
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Backend`] if a migration fails to apply.
    pub async fn migrate(&self) -> Result<(), ReceiptGateError> {
        self.backend.migrate().await
    }

    /// Stable dialect label, for logging.
    #[must_use]
    pub fn dialect(&self) -> &'static str {
        self.backend.dialect()
    }

    /// Cheapest possible round-trip to the backend, used by `GET /health`
    /// (spec §6.2) to decide between HTTP 200 and 503.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Backend`] if the database is unreachable.
    pub async fn ping(&self) -> Result<(), ReceiptGateError> {
        retry_once(|| async {
            match &self.backend {
                Backend::Sqlite(pool) => sqlx::query("SELECT 1")
                    .execute(pool)
                    .await
                    .map(|_| ())
                    .map_err(internal("ping")),
                Backend::Postgres(pool) => sqlx::query("SELECT 1")
                    .execute(pool)
                    .await
                    .map(|_| ())
                    .map_err(internal("ping")),
            }
        })
        .await
    }

    /// Look up a receipt by its tenant-scoped external `receipt_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Backend`] on a query failure.
    pub async fn find_by_receipt_id(&self, receipt_id: &str) -> Result<Option<Receipt>, ReceiptGateError> {
        retry_once(|| async {
            match &self.backend {
                Backend::Sqlite(pool) => {
                    let row = sqlx::query_as::<_, SqliteReceiptRow>(
                        "SELECT * FROM receipts WHERE tenant_id = ? AND receipt_id = ?",
                    )
                    .bind(DEFAULT_TENANT)
                    .bind(receipt_id)
                    .fetch_optional(pool)
                    .await
                    .map_err(internal("query receipt by receipt_id"))?;
                    row.map(Receipt::try_from).transpose()
                }
                Backend::Postgres(pool) => {
                    let row = sqlx::query_as::<_, PgReceiptRow>(
                        "SELECT * FROM receipts WHERE tenant_id = $1 AND receipt_id = $2",
                    )
                    .bind(DEFAULT_TENANT)
                    .bind(receipt_id)
                    .fetch_optional(pool)
                    .await
                    .map_err(internal("query receipt by receipt_id"))?;
                    row.map(Receipt::try_from).transpose()
                }
            }
        })
        .await
    }

    /// Look up a receipt by its server-assigned `uuid`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Backend`] on a query failure.
    pub async fn find_by_uuid(&self, uuid: Uuid) -> Result<Option<Receipt>, ReceiptGateError> {
        retry_once(|| async {
            match &self.backend {
                Backend::Sqlite(pool) => {
                    let row = sqlx::query_as::<_, SqliteReceiptRow>(
                        "SELECT * FROM receipts WHERE tenant_id = ? AND uuid = ?",
                    )
                    .bind(DEFAULT_TENANT)
                    .bind(uuid.to_string())
                    .fetch_optional(pool)
                    .await
                    .map_err(internal("query receipt by uuid"))?;
                    row.map(Receipt::try_from).transpose()
                }
                Backend::Postgres(pool) => {
                    let row = sqlx::query_as::<_, PgReceiptRow>(
                        "SELECT * FROM receipts WHERE tenant_id = $1 AND uuid = $2",
                    )
                    .bind(DEFAULT_TENANT)
                    .bind(uuid)
                    .fetch_optional(pool)
                    .await
                    .map_err(internal("query receipt by uuid"))?;
                    row.map(Receipt::try_from).transpose()
                }
            }
        })
        .await
    }

    /// Returns `true` if `obligation_id` already has a receipt in a
    /// terminal phase (`complete` or `escalate`); spec §3.1 invariant 6.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Backend`] on a query failure.
    pub async fn has_terminal(&self, obligation_id: &str) -> Result<bool, ReceiptGateError> {
        retry_once(|| async {
            match &self.backend {
                Backend::Sqlite(pool) => {
                    let row = sqlx::query(
                        "SELECT 1 FROM receipts WHERE tenant_id = ? AND obligation_id = ? AND phase IN ('complete', 'escalate') LIMIT 1",
                    )
                    .bind(DEFAULT_TENANT)
                    .bind(obligation_id)
                    .fetch_optional(pool)
                    .await
                    .map_err(internal("query terminal existence"))?;
                    Ok(row.is_some())
                }
                Backend::Postgres(pool) => {
                    let row = sqlx::query(
                        "SELECT 1 FROM receipts WHERE tenant_id = $1 AND obligation_id = $2 AND phase IN ('complete', 'escalate') LIMIT 1",
                    )
                    .bind(DEFAULT_TENANT)
                    .bind(obligation_id)
                    .fetch_optional(pool)
                    .await
                    .map_err(internal("query terminal existence"))?;
                    Ok(row.is_some())
                }
            }
        })
        .await
    }

    /// Append a validated, canonicalized receipt inside a single
    /// transaction (spec §4.4):
    ///
    /// 1. If a receipt with the same `receipt_id` already exists, compare
    ///    `canonical_hash`: identical hash replays the existing row
    ///    (idempotent), differing hash is [`ErrorKind::ReceiptConflict`].
    /// 2. For `phase ∈ {complete, escalate}`, the referenced
    ///    `caused_by_receipt_id` must exist ([`ErrorKind::ParentMissing`])
    ///    and be in phase `accepted` ([`ErrorKind::ParentNotAcceptedPhase`]).
    /// 3. The obligation must not already have a terminal receipt
    ///    ([`ErrorKind::AlreadyTerminated`]), unless this append *is* that
    ///    existing terminal receipt (the idempotent-replay case above).
    /// 4. Assign `uuid` (if not already set) and `created_at`, insert, and,
    ///    if `write_edges` is set (spec §6.4 `enable_graph_layer`), insert
    ///    the `receipt_edges` row linking to the parent.
    ///
    /// Retries once on a transient [`ErrorKind::Backend`] failure; the
    /// idempotent-replay check above makes a second attempt safe even if
    /// the first attempt's transaction had already committed and only the
    /// acknowledgement was lost.
    ///
    /// # Errors
    ///
    /// Returns the specific [`ErrorKind`] for whichever check above fails,
    /// or [`ErrorKind::Backend`] for a lower-level database failure.
    pub async fn append_receipt(
        &self,
        receipt: Receipt,
        canonical_hash: String,
        write_edges: bool,
    ) -> Result<Receipt, ReceiptGateError> {
        match self
            .append_receipt_once(receipt.clone(), canonical_hash.clone(), write_edges)
            .await
        {
            Ok(stored) => Ok(stored),
            Err(err) if err.kind == ErrorKind::Backend => {
                tracing::warn!(error = %err, "backend error on append, retrying once");
                self.append_receipt_once(receipt, canonical_hash, write_edges).await
            }
            Err(err) => Err(err),
        }
    }

    async fn append_receipt_once(
        &self,
        mut receipt: Receipt,
        canonical_hash: String,
        write_edges: bool,
    ) -> Result<Receipt, ReceiptGateError> {
        match &self.backend {
            Backend::Sqlite(pool) => {
                let mut tx = pool.begin().await.map_err(internal("begin transaction"))?;

                if let Some(existing) = sqlx::query_as::<_, SqliteReceiptRow>(
                    "SELECT * FROM receipts WHERE tenant_id = ? AND receipt_id = ?",
                )
                .bind(DEFAULT_TENANT)
                .bind(receipt.receipt_id.as_str())
                .fetch_optional(&mut *tx)
                .await
                .map_err(internal("check existing receipt"))?
                {
                    if existing.canonical_hash == canonical_hash {
                        return Receipt::try_from(existing);
                    }
                    tracing::warn!(receipt_id = %receipt.receipt_id, "rejecting append: canonical hash conflict");
                    return Err(ReceiptGateError::new(
                        ErrorKind::ReceiptConflict,
                        format!(
                            "receipt_id {:?} already exists with a different canonical hash",
                            receipt.receipt_id
                        ),
                    )
                    .with_context("existing_hash", existing.canonical_hash));
                }

                if receipt.phase.is_terminal() {
                    let parent_id = receipt
                        .caused_by_receipt_id
                        .as_ref()
                        .expect("validated: terminal phase requires caused_by_receipt_id");
                    let parent = sqlx::query_as::<_, SqliteReceiptRow>(
                        "SELECT * FROM receipts WHERE tenant_id = ? AND receipt_id = ?",
                    )
                    .bind(DEFAULT_TENANT)
                    .bind(parent_id.as_str())
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(internal("query parent receipt"))?
                    .ok_or_else(|| {
                        ReceiptGateError::new(
                            ErrorKind::ParentMissing,
                            format!("caused_by_receipt_id {parent_id:?} does not exist"),
                        )
                    })?;
                    if parent.phase != "accepted" {
                        tracing::warn!(parent_id = %parent_id, "rejecting append: parent not in accepted phase");
                        return Err(ReceiptGateError::new(
                            ErrorKind::ParentNotAcceptedPhase,
                            format!("parent receipt {parent_id:?} is not in phase 'accepted'"),
                        ));
                    }
                }

                let terminal_exists = sqlx::query(
                    "SELECT 1 FROM receipts WHERE tenant_id = ? AND obligation_id = ? AND phase IN ('complete', 'escalate') LIMIT 1",
                )
                .bind(DEFAULT_TENANT)
                .bind(receipt.obligation_id.as_str())
                .fetch_optional(&mut *tx)
                .await
                .map_err(internal("check terminal existence"))?
                .is_some();
                if terminal_exists {
                    tracing::warn!(obligation_id = %receipt.obligation_id, "rejecting append: obligation already terminal");
                    return Err(ReceiptGateError::new(
                        ErrorKind::AlreadyTerminated,
                        format!(
                            "obligation {:?} already has a terminal receipt",
                            receipt.obligation_id
                        ),
                    ));
                }

                if receipt.uuid.is_nil() {
                    receipt.uuid = Uuid::new_v4();
                }
                receipt.created_at = Some(Utc::now());
                receipt.tenant_id = Some(DEFAULT_TENANT.to_string());
                receipt.canonical_hash = Some(canonical_hash.clone());

                let artifact_refs_json = serde_json::to_string(&receipt.artifact_refs)
                    .map_err(|e| ReceiptGateError::new(ErrorKind::Internal, "serialize artifact_refs").with_source(e))?;
                let body_json = serde_json::to_string(&receipt.body)
                    .map_err(|e| ReceiptGateError::new(ErrorKind::Internal, "serialize body").with_source(e))?;

                sqlx::query(
                    "INSERT INTO receipts (uuid, receipt_id, canonical_hash, phase, obligation_id, task_id, caused_by_receipt_id, created_by, recipient_ai, escalation_to, artifact_refs, body, created_at, tenant_id) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(receipt.uuid.to_string())
                .bind(receipt.receipt_id.as_str())
                .bind(&canonical_hash)
                .bind(receipt.phase.as_str())
                .bind(receipt.obligation_id.as_str())
                .bind(receipt.task_id.as_ref().map(|t| t.as_str()))
                .bind(receipt.caused_by_receipt_id.as_ref().map(|r| r.as_str()))
                .bind(receipt.created_by.as_str())
                .bind(receipt.recipient_ai.as_str())
                .bind(receipt.escalation_to.as_ref().map(|e| e.as_str()))
                .bind(&artifact_refs_json)
                .bind(&body_json)
                .bind(receipt.created_at.unwrap().to_rfc3339())
                .bind(DEFAULT_TENANT)
                .execute(&mut *tx)
                .await
                .map_err(internal("insert receipt"))?;

                if write_edges {
                    if let Some(parent_id) = &receipt.caused_by_receipt_id {
                        if let Some(parent_uuid) = sqlx::query("SELECT uuid FROM receipts WHERE tenant_id = ? AND receipt_id = ?")
                            .bind(DEFAULT_TENANT)
                            .bind(parent_id.as_str())
                            .fetch_optional(&mut *tx)
                            .await
                            .map_err(internal("look up parent uuid for edge"))?
                            .map(|row| row.get::<String, _>("uuid"))
                        {
                            sqlx::query(
                                "INSERT INTO receipt_edges (parent_uuid, child_uuid) VALUES (?, ?) ON CONFLICT DO NOTHING",
                            )
                            .bind(parent_uuid)
                            .bind(receipt.uuid.to_string())
                            .execute(&mut *tx)
                            .await
                            .map_err(internal("insert receipt edge"))?;
                        }
                    }
                }

                tx.commit().await.map_err(internal("commit transaction"))?;
                tracing::info!(receipt_id = %receipt.receipt_id, phase = receipt.phase.as_str(), "receipt appended");
                Ok(receipt)
            }
            Backend::Postgres(pool) => {
                let mut tx = pool.begin().await.map_err(internal("begin transaction"))?;

                if let Some(existing) = sqlx::query_as::<_, PgReceiptRow>(
                    "SELECT * FROM receipts WHERE tenant_id = $1 AND receipt_id = $2",
                )
                .bind(DEFAULT_TENANT)
                .bind(receipt.receipt_id.as_str())
                .fetch_optional(&mut *tx)
                .await
                .map_err(internal("check existing receipt"))?
                {
                    if existing.canonical_hash == canonical_hash {
                        return Receipt::try_from(existing);
                    }
                    tracing::warn!(receipt_id = %receipt.receipt_id, "rejecting append: canonical hash conflict");
                    return Err(ReceiptGateError::new(
                        ErrorKind::ReceiptConflict,
                        format!(
                            "receipt_id {:?} already exists with a different canonical hash",
                            receipt.receipt_id
                        ),
                    )
                    .with_context("existing_hash", existing.canonical_hash));
                }

                if receipt.phase.is_terminal() {
                    let parent_id = receipt
                        .caused_by_receipt_id
                        .as_ref()
                        .expect("validated: terminal phase requires caused_by_receipt_id");
                    let parent = sqlx::query_as::<_, PgReceiptRow>(
                        "SELECT * FROM receipts WHERE tenant_id = $1 AND receipt_id = $2",
                    )
                    .bind(DEFAULT_TENANT)
                    .bind(parent_id.as_str())
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(internal("query parent receipt"))?
                    .ok_or_else(|| {
                        ReceiptGateError::new(
                            ErrorKind::ParentMissing,
                            format!("caused_by_receipt_id {parent_id:?} does not exist"),
                        )
                    })?;
                    if parent.phase != "accepted" {
                        tracing::warn!(parent_id = %parent_id, "rejecting append: parent not in accepted phase");
                        return Err(ReceiptGateError::new(
                            ErrorKind::ParentNotAcceptedPhase,
                            format!("parent receipt {parent_id:?} is not in phase 'accepted'"),
                        ));
                    }
                }

                let terminal_exists = sqlx::query(
                    "SELECT 1 FROM receipts WHERE tenant_id = $1 AND obligation_id = $2 AND phase IN ('complete', 'escalate') LIMIT 1",
                )
                .bind(DEFAULT_TENANT)
                .bind(receipt.obligation_id.as_str())
                .fetch_optional(&mut *tx)
                .await
                .map_err(internal("check terminal existence"))?
                .is_some();
                if terminal_exists {
                    tracing::warn!(obligation_id = %receipt.obligation_id, "rejecting append: obligation already terminal");
                    return Err(ReceiptGateError::new(
                        ErrorKind::AlreadyTerminated,
                        format!(
                            "obligation {:?} already has a terminal receipt",
                            receipt.obligation_id
                        ),
                    ));
                }

                if receipt.uuid.is_nil() {
                    receipt.uuid = Uuid::new_v4();
                }
                receipt.created_at = Some(Utc::now());
                receipt.tenant_id = Some(DEFAULT_TENANT.to_string());
                receipt.canonical_hash = Some(canonical_hash.clone());

                let artifact_refs_json = serde_json::to_value(&receipt.artifact_refs)
                    .map_err(|e| ReceiptGateError::new(ErrorKind::Internal, "serialize artifact_refs").with_source(e))?;

                sqlx::query(
                    "INSERT INTO receipts (uuid, receipt_id, canonical_hash, phase, obligation_id, task_id, caused_by_receipt_id, created_by, recipient_ai, escalation_to, artifact_refs, body, created_at, tenant_id) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
                )
                .bind(receipt.uuid)
                .bind(receipt.receipt_id.as_str())
                .bind(&canonical_hash)
                .bind(receipt.phase.as_str())
                .bind(receipt.obligation_id.as_str())
                .bind(receipt.task_id.as_ref().map(|t| t.as_str()))
                .bind(receipt.caused_by_receipt_id.as_ref().map(|r| r.as_str()))
                .bind(receipt.created_by.as_str())
                .bind(receipt.recipient_ai.as_str())
                .bind(receipt.escalation_to.as_ref().map(|e| e.as_str()))
                .bind(&artifact_refs_json)
                .bind(&receipt.body)
                .bind(receipt.created_at.unwrap())
                .bind(DEFAULT_TENANT)
                .execute(&mut *tx)
                .await
                .map_err(internal("insert receipt"))?;

                if write_edges {
                    if let Some(parent_id) = &receipt.caused_by_receipt_id {
                        if let Some(parent_uuid) = sqlx::query("SELECT uuid FROM receipts WHERE tenant_id = $1 AND receipt_id = $2")
                            .bind(DEFAULT_TENANT)
                            .bind(parent_id.as_str())
                            .fetch_optional(&mut *tx)
                            .await
                            .map_err(internal("look up parent uuid for edge"))?
                            .map(|row| row.get::<Uuid, _>("uuid"))
                        {
                            sqlx::query(
                                "INSERT INTO receipt_edges (parent_uuid, child_uuid) VALUES ($1, $2) ON CONFLICT DO NOTHING",
                            )
                            .bind(parent_uuid)
                            .bind(receipt.uuid)
                            .execute(&mut *tx)
                            .await
                            .map_err(internal("insert receipt edge"))?;
                        }
                    }
                }

                tx.commit().await.map_err(internal("commit transaction"))?;
                tracing::info!(receipt_id = %receipt.receipt_id, phase = receipt.phase.as_str(), "receipt appended");
                Ok(receipt)
            }
        }
    }

    /// List receipts whose latest sibling receipt in the same
    /// `obligation_id` is in phase `accepted` and addressed to
    /// `recipient_ai` (spec §3.2/§4.5 `list_inbox`), newest first, capped
    /// at `limit`, optionally continuing after `cursor`.
    ///
    /// "Latest" means no other receipt in the same obligation has a
    /// strictly greater `(created_at, receipt_id)` pair — a superseded
    /// `accepted` receipt (one a later receipt in the same obligation has
    /// already moved past, regardless of that later receipt's own phase)
    /// never reappears here.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Backend`] on a query failure.
    pub async fn list_inbox(
        &self,
        recipient_ai: &str,
        limit: i64,
        cursor: Option<&PageCursor>,
    ) -> Result<Vec<Receipt>, ReceiptGateError> {
        retry_once(|| async {
            match &self.backend {
                Backend::Sqlite(pool) => {
                    let mut qb = sqlx::QueryBuilder::new("SELECT * FROM receipts r WHERE r.tenant_id = ");
                    qb.push_bind(DEFAULT_TENANT);
                    qb.push(" AND r.recipient_ai = ").push_bind(recipient_ai.to_string());
                    qb.push(" AND r.phase = 'accepted'");
                    qb.push(
                        " AND NOT EXISTS (SELECT 1 FROM receipts t WHERE t.tenant_id = r.tenant_id \
                         AND t.obligation_id = r.obligation_id \
                         AND (t.created_at > r.created_at OR (t.created_at = r.created_at AND t.receipt_id > r.receipt_id)))",
                    );
                    if let Some(c) = cursor {
                        qb.push(" AND (r.created_at < ").push_bind(c.created_at.to_rfc3339());
                        qb.push(" OR (r.created_at = ").push_bind(c.created_at.to_rfc3339());
                        qb.push(" AND r.receipt_id > ").push_bind(c.receipt_id.clone()).push("))");
                    }
                    qb.push(" ORDER BY r.created_at DESC, r.receipt_id ASC LIMIT ").push_bind(limit);
                    let rows = qb
                        .build_query_as::<SqliteReceiptRow>()
                        .fetch_all(pool)
                        .await
                        .map_err(internal("list inbox"))?;
                    rows.into_iter().map(Receipt::try_from).collect()
                }
                Backend::Postgres(pool) => {
                    let mut qb = sqlx::QueryBuilder::new("SELECT * FROM receipts r WHERE r.tenant_id = ");
                    qb.push_bind(DEFAULT_TENANT);
                    qb.push(" AND r.recipient_ai = ").push_bind(recipient_ai.to_string());
                    qb.push(" AND r.phase = 'accepted'");
                    qb.push(
                        " AND NOT EXISTS (SELECT 1 FROM receipts t WHERE t.tenant_id = r.tenant_id \
                         AND t.obligation_id = r.obligation_id \
                         AND (t.created_at > r.created_at OR (t.created_at = r.created_at AND t.receipt_id > r.receipt_id)))",
                    );
                    if let Some(c) = cursor {
                        qb.push(" AND (r.created_at < ").push_bind(c.created_at);
                        qb.push(" OR (r.created_at = ").push_bind(c.created_at);
                        qb.push(" AND r.receipt_id > ").push_bind(c.receipt_id.clone()).push("))");
                    }
                    qb.push(" ORDER BY r.created_at DESC, r.receipt_id ASC LIMIT ").push_bind(limit);
                    let rows = qb
                        .build_query_as::<PgReceiptRow>()
                        .fetch_all(pool)
                        .await
                        .map_err(internal("list inbox"))?;
                    rows.into_iter().map(Receipt::try_from).collect()
                }
            }
        })
        .await
    }

    /// List every receipt referencing `task_id`, oldest first (spec §4.5
    /// `list_task_receipts`).
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Backend`] on a query failure.
    pub async fn list_task_receipts(&self, task_id: &str) -> Result<Vec<Receipt>, ReceiptGateError> {
        retry_once(|| async {
            match &self.backend {
                Backend::Sqlite(pool) => {
                    let rows = sqlx::query_as::<_, SqliteReceiptRow>(
                        "SELECT * FROM receipts WHERE tenant_id = ? AND task_id = ? ORDER BY created_at ASC",
                    )
                    .bind(DEFAULT_TENANT)
                    .bind(task_id)
                    .fetch_all(pool)
                    .await
                    .map_err(internal("list task receipts"))?;
                    rows.into_iter().map(Receipt::try_from).collect()
                }
                Backend::Postgres(pool) => {
                    let rows = sqlx::query_as::<_, PgReceiptRow>(
                        "SELECT * FROM receipts WHERE tenant_id = $1 AND task_id = $2 ORDER BY created_at ASC",
                    )
                    .bind(DEFAULT_TENANT)
                    .bind(task_id)
                    .fetch_all(pool)
                    .await
                    .map_err(internal("list task receipts"))?;
                    rows.into_iter().map(Receipt::try_from).collect()
                }
            }
        })
        .await
    }

    /// Find the receipt a given receipt points to via `caused_by_receipt_id`
    /// (the parent one step toward the root), for the chain walker.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Backend`] on a query failure.
    pub async fn find_parent(&self, receipt: &Receipt) -> Result<Option<Receipt>, ReceiptGateError> {
        match &receipt.caused_by_receipt_id {
            Some(parent_id) => self.find_by_receipt_id(parent_id.as_str()).await,
            None => Ok(None),
        }
    }

    /// Find every receipt whose `caused_by_receipt_id` is this receipt's
    /// `receipt_id` (its children one step away from the root), for the
    /// chain walker.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Backend`] on a query failure.
    pub async fn find_children(&self, receipt: &Receipt) -> Result<Vec<Receipt>, ReceiptGateError> {
        retry_once(|| async {
            match &self.backend {
                Backend::Sqlite(pool) => {
                    let rows = sqlx::query_as::<_, SqliteReceiptRow>(
                        "SELECT * FROM receipts WHERE tenant_id = ? AND caused_by_receipt_id = ? ORDER BY created_at ASC",
                    )
                    .bind(DEFAULT_TENANT)
                    .bind(receipt.receipt_id.as_str())
                    .fetch_all(pool)
                    .await
                    .map_err(internal("find children"))?;
                    rows.into_iter().map(Receipt::try_from).collect()
                }
                Backend::Postgres(pool) => {
                    let rows = sqlx::query_as::<_, PgReceiptRow>(
                        "SELECT * FROM receipts WHERE tenant_id = $1 AND caused_by_receipt_id = $2 ORDER BY created_at ASC",
                    )
                    .bind(DEFAULT_TENANT)
                    .bind(receipt.receipt_id.as_str())
                    .fetch_all(pool)
                    .await
                    .map_err(internal("find children"))?;
                    rows.into_iter().map(Receipt::try_from).collect()
                }
            }
        })
        .await
    }

    /// Filtered, paginated search over all receipts (spec §4.5
    /// `search_receipts`), newest first, capped at `limit`, optionally
    /// continuing after `cursor`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Backend`] on a query failure.
    pub async fn search_receipts(
        &self,
        filter: &SearchFilter,
        limit: i64,
        cursor: Option<&PageCursor>,
    ) -> Result<Vec<Receipt>, ReceiptGateError> {
        retry_once(|| async {
            match &self.backend {
                Backend::Sqlite(pool) => {
                    let mut qb = sqlx::QueryBuilder::new("SELECT * FROM receipts WHERE tenant_id = ");
                    qb.push_bind(DEFAULT_TENANT);
                    push_filter_sqlite(&mut qb, filter);
                    if let Some(c) = cursor {
                        qb.push(" AND (created_at < ").push_bind(c.created_at.to_rfc3339());
                        qb.push(" OR (created_at = ").push_bind(c.created_at.to_rfc3339());
                        qb.push(" AND receipt_id > ").push_bind(c.receipt_id.clone()).push("))");
                    }
                    qb.push(" ORDER BY created_at DESC, receipt_id ASC LIMIT ");
                    qb.push_bind(limit);
                    let rows = qb
                        .build_query_as::<SqliteReceiptRow>()
                        .fetch_all(pool)
                        .await
                        .map_err(internal("search receipts"))?;
                    rows.into_iter().map(Receipt::try_from).collect()
                }
                Backend::Postgres(pool) => {
                    let mut qb = sqlx::QueryBuilder::new("SELECT * FROM receipts WHERE tenant_id = ");
                    qb.push_bind(DEFAULT_TENANT);
                    push_filter_postgres(&mut qb, filter);
                    if let Some(c) = cursor {
                        qb.push(" AND (created_at < ").push_bind(c.created_at);
                        qb.push(" OR (created_at = ").push_bind(c.created_at);
                        qb.push(" AND receipt_id > ").push_bind(c.receipt_id.clone()).push("))");
                    }
                    qb.push(" ORDER BY created_at DESC, receipt_id ASC LIMIT ");
                    qb.push_bind(limit);
                    let rows = qb
                        .build_query_as::<PgReceiptRow>()
                        .fetch_all(pool)
                        .await
                        .map_err(internal("search receipts"))?;
                    rows.into_iter().map(Receipt::try_from).collect()
                }
            }
        })
        .await
    }
}

impl Store {
    /// Every receipt in the store, oldest first. Used by the projection
    /// rebuilder (spec §4.6), which needs a full scan to recompute
    /// derived tables from scratch.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Backend`] on a query failure.
    pub async fn all_receipts(&self) -> Result<Vec<Receipt>, ReceiptGateError> {
        retry_once(|| async {
            match &self.backend {
                Backend::Sqlite(pool) => {
                    let rows = sqlx::query_as::<_, SqliteReceiptRow>(
                        "SELECT * FROM receipts WHERE tenant_id = ? ORDER BY created_at ASC",
                    )
                    .bind(DEFAULT_TENANT)
                    .fetch_all(pool)
                    .await
                    .map_err(internal("scan all receipts"))?;
                    rows.into_iter().map(Receipt::try_from).collect()
                }
                Backend::Postgres(pool) => {
                    let rows = sqlx::query_as::<_, PgReceiptRow>(
                        "SELECT * FROM receipts WHERE tenant_id = $1 ORDER BY created_at ASC",
                    )
                    .bind(DEFAULT_TENANT)
                    .fetch_all(pool)
                    .await
                    .map_err(internal("scan all receipts"))?;
                    rows.into_iter().map(Receipt::try_from).collect()
                }
            }
        })
        .await
    }

    /// Delete every row from `receipt_edges`, in preparation for a full
    /// rebuild.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Backend`] on a query failure.
    pub async fn clear_edges(&self) -> Result<(), ReceiptGateError> {
        retry_once(|| async {
            match &self.backend {
                Backend::Sqlite(pool) => sqlx::query("DELETE FROM receipt_edges")
                    .execute(pool)
                    .await
                    .map(|_| ())
                    .map_err(internal("clear receipt_edges")),
                Backend::Postgres(pool) => sqlx::query("DELETE FROM receipt_edges")
                    .execute(pool)
                    .await
                    .map(|_| ())
                    .map_err(internal("clear receipt_edges")),
            }
        })
        .await
    }

    /// Insert a parent/child edge, ignoring the insert if it already exists.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Backend`] on a query failure.
    pub async fn insert_edge(&self, parent_uuid: Uuid, child_uuid: Uuid) -> Result<(), ReceiptGateError> {
        retry_once(|| async {
            match &self.backend {
                Backend::Sqlite(pool) => sqlx::query(
                    "INSERT INTO receipt_edges (parent_uuid, child_uuid) VALUES (?, ?) ON CONFLICT DO NOTHING",
                )
                .bind(parent_uuid.to_string())
                .bind(child_uuid.to_string())
                .execute(pool)
                .await
                .map(|_| ())
                .map_err(internal("insert receipt_edges row")),
                Backend::Postgres(pool) => sqlx::query(
                    "INSERT INTO receipt_edges (parent_uuid, child_uuid) VALUES ($1, $2) ON CONFLICT DO NOTHING",
                )
                .bind(parent_uuid)
                .bind(child_uuid)
                .execute(pool)
                .await
                .map(|_| ())
                .map_err(internal("insert receipt_edges row")),
            }
        })
        .await
    }

    /// Upsert a computed embedding for a receipt (spec §4.6 semantic
    /// layer). `embedding` is stored as opaque JSON; its shape is owned by
    /// whatever embedding backend computed it.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Backend`] on a query failure.
    pub async fn upsert_embedding(
        &self,
        receipt_uuid: Uuid,
        model: &str,
        embedding: &serde_json::Value,
    ) -> Result<(), ReceiptGateError> {
        retry_once(|| async {
            let now = Utc::now();
            match &self.backend {
                Backend::Sqlite(pool) => {
                    let embedding_json = serde_json::to_string(embedding).map_err(|e| {
                        ReceiptGateError::new(ErrorKind::Internal, "serialize embedding").with_source(e)
                    })?;
                    sqlx::query(
                        "INSERT INTO receipt_embeddings (receipt_uuid, model, embedding, computed_at) VALUES (?, ?, ?, ?) \
                         ON CONFLICT (receipt_uuid) DO UPDATE SET model = excluded.model, embedding = excluded.embedding, computed_at = excluded.computed_at",
                    )
                    .bind(receipt_uuid.to_string())
                    .bind(model)
                    .bind(embedding_json)
                    .bind(now.to_rfc3339())
                    .execute(pool)
                    .await
                    .map(|_| ())
                    .map_err(internal("upsert receipt_embeddings row"))
                }
                Backend::Postgres(pool) => sqlx::query(
                    "INSERT INTO receipt_embeddings (receipt_uuid, model, embedding, computed_at) VALUES ($1, $2, $3, $4) \
                     ON CONFLICT (receipt_uuid) DO UPDATE SET model = excluded.model, embedding = excluded.embedding, computed_at = excluded.computed_at",
                )
                .bind(receipt_uuid)
                .bind(model)
                .bind(embedding)
                .bind(now)
                .execute(pool)
                .await
                .map(|_| ())
                .map_err(internal("upsert receipt_embeddings row")),
            }
        })
        .await
    }
}

fn push_filter_sqlite(qb: &mut sqlx::QueryBuilder<'_, sqlx::Sqlite>, filter: &SearchFilter) {
    if let Some(v) = &filter.obligation_id {
        qb.push(" AND obligation_id = ").push_bind(v.clone());
    }
    if let Some(v) = &filter.recipient_ai {
        qb.push(" AND recipient_ai = ").push_bind(v.clone());
    }
    if let Some(v) = &filter.created_by {
        qb.push(" AND created_by = ").push_bind(v.clone());
    }
    if let Some(v) = &filter.phase {
        qb.push(" AND phase = ").push_bind(v.as_str());
    }
    if let Some(v) = &filter.task_id {
        qb.push(" AND task_id = ").push_bind(v.clone());
    }
    if let Some(v) = &filter.receipt_id_contains {
        qb.push(" AND receipt_id LIKE ").push_bind(format!("%{v}%"));
    }
    if let Some(v) = filter.created_after {
        qb.push(" AND created_at >= ").push_bind(v.to_rfc3339());
    }
    if let Some(v) = filter.created_before {
        qb.push(" AND created_at <= ").push_bind(v.to_rfc3339());
    }
}

fn push_filter_postgres(qb: &mut sqlx::QueryBuilder<'_, sqlx::Postgres>, filter: &SearchFilter) {
    if let Some(v) = &filter.obligation_id {
        qb.push(" AND obligation_id = ").push_bind(v.clone());
    }
    if let Some(v) = &filter.recipient_ai {
        qb.push(" AND recipient_ai = ").push_bind(v.clone());
    }
    if let Some(v) = &filter.created_by {
        qb.push(" AND created_by = ").push_bind(v.clone());
    }
    if let Some(v) = &filter.phase {
        qb.push(" AND phase = ").push_bind(v.as_str());
    }
    if let Some(v) = &filter.task_id {
        qb.push(" AND task_id = ").push_bind(v.clone());
    }
    if let Some(v) = &filter.receipt_id_contains {
        qb.push(" AND receipt_id ILIKE ").push_bind(format!("%{v}%"));
    }
    if let Some(v) = filter.created_after {
        qb.push(" AND created_at >= ").push_bind(v);
    }
    if let Some(v) = filter.created_before {
        qb.push(" AND created_at <= ").push_bind(v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn sqlite_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let store = Store::connect(&url, true).await.unwrap();
        (store, dir)
    }

    async fn seed(store: &Store, raw: &serde_json::Value) -> Receipt {
        let receipt = receiptgate_validate::validate_receipt(raw, receiptgate_validate::DEFAULT_BODY_MAX_BYTES)
            .unwrap();
        let hash = receiptgate_canon::compute_hash(&receipt).unwrap();
        store.append_receipt(receipt, hash, true).await.unwrap()
    }

    #[tokio::test]
    async fn connect_reports_sqlite_dialect() {
        let (store, _dir) = sqlite_store().await;
        assert_eq!(store.dialect(), "sqlite");
    }

    #[tokio::test]
    async fn ping_succeeds_against_a_live_connection() {
        let (store, _dir) = sqlite_store().await;
        store.ping().await.unwrap();
    }

    #[tokio::test]
    async fn migrate_is_idempotent_when_run_explicitly() {
        let (store, _dir) = sqlite_store().await;
        store.migrate().await.unwrap();
        store.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn find_by_uuid_reports_none_for_unknown_uuid() {
        let (store, _dir) = sqlite_store().await;
        assert!(store.find_by_uuid(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn find_parent_and_children_round_trip() {
        let (store, _dir) = sqlite_store().await;
        let parent = seed(
            &store,
            &json!({"receipt_id": "r1", "phase": "accepted", "obligation_id": "o1", "created_by": "a", "recipient_ai": "b", "body": {}}),
        )
        .await;
        let child = seed(
            &store,
            &json!({"receipt_id": "r2", "phase": "complete", "obligation_id": "o1", "created_by": "a", "recipient_ai": "b", "caused_by_receipt_id": "r1", "body": {}}),
        )
        .await;

        let found_parent = store.find_parent(&child).await.unwrap().unwrap();
        assert_eq!(found_parent.receipt_id, parent.receipt_id);

        let children = store.find_children(&parent).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].receipt_id, child.receipt_id);
    }

    #[tokio::test]
    async fn clear_edges_removes_projected_edges() {
        let (store, _dir) = sqlite_store().await;
        let parent = seed(
            &store,
            &json!({"receipt_id": "r1", "phase": "accepted", "obligation_id": "o1", "created_by": "a", "recipient_ai": "b", "body": {}}),
        )
        .await;
        seed(
            &store,
            &json!({"receipt_id": "r2", "phase": "complete", "obligation_id": "o1", "created_by": "a", "recipient_ai": "b", "caused_by_receipt_id": "r1", "body": {}}),
        )
        .await;
        assert_eq!(store.find_children(&parent).await.unwrap().len(), 1);

        store.clear_edges().await.unwrap();
        assert!(store.find_children(&parent).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upsert_embedding_is_idempotent_per_receipt() {
        let (store, _dir) = sqlite_store().await;
        let receipt = seed(
            &store,
            &json!({"receipt_id": "r1", "phase": "accepted", "obligation_id": "o1", "created_by": "a", "recipient_ai": "b", "body": {}}),
        )
        .await;
        store.upsert_embedding(receipt.uuid, "hash-bucket-v1", &json!([0.0, 0.0, 0.0, 0.0])).await.unwrap();
        store.upsert_embedding(receipt.uuid, "hash-bucket-v1", &json!([1.0, 1.0, 1.0, 1.0])).await.unwrap();
    }

    #[tokio::test]
    async fn append_receipt_does_not_write_an_edge_when_graph_layer_is_disabled() {
        let (store, _dir) = sqlite_store().await;
        let receipt = receiptgate_validate::validate_receipt(
            &json!({"receipt_id": "r1", "phase": "accepted", "obligation_id": "o1", "created_by": "a", "recipient_ai": "b", "body": {}}),
            receiptgate_validate::DEFAULT_BODY_MAX_BYTES,
        )
        .unwrap();
        let hash = receiptgate_canon::compute_hash(&receipt).unwrap();
        let parent = store.append_receipt(receipt, hash, false).await.unwrap();

        let child = receiptgate_validate::validate_receipt(
            &json!({"receipt_id": "r2", "phase": "complete", "obligation_id": "o1", "created_by": "a", "recipient_ai": "b", "caused_by_receipt_id": "r1", "body": {}}),
            receiptgate_validate::DEFAULT_BODY_MAX_BYTES,
        )
        .unwrap();
        let hash = receiptgate_canon::compute_hash(&child).unwrap();
        store.append_receipt(child, hash, false).await.unwrap();

        assert!(store.find_children(&parent).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn inbox_shows_only_the_latest_non_terminal_receipt_in_an_obligation() {
        let (store, _dir) = sqlite_store().await;
        seed(
            &store,
            &json!({"receipt_id": "r1", "phase": "accepted", "obligation_id": "o1", "created_by": "a", "recipient_ai": "alice", "body": {}}),
        )
        .await;
        seed(
            &store,
            &json!({"receipt_id": "r2", "phase": "accepted", "obligation_id": "o1", "created_by": "a", "recipient_ai": "bob", "caused_by_receipt_id": "r1", "body": {}}),
        )
        .await;

        let alice_inbox = store.list_inbox("alice", 50, None).await.unwrap();
        assert!(alice_inbox.is_empty(), "r1 was superseded by r2 and must not reappear");

        let bob_inbox = store.list_inbox("bob", 50, None).await.unwrap();
        assert_eq!(bob_inbox.len(), 1);
        assert_eq!(bob_inbox[0].receipt_id.as_str(), "r2");
    }

    #[tokio::test]
    async fn search_receipts_filters_by_created_by_and_receipt_id_substring() {
        let (store, _dir) = sqlite_store().await;
        seed(
            &store,
            &json!({"receipt_id": "alpha-1", "phase": "accepted", "obligation_id": "o1", "created_by": "alice", "recipient_ai": "bob", "body": {}}),
        )
        .await;
        seed(
            &store,
            &json!({"receipt_id": "beta-1", "phase": "accepted", "obligation_id": "o2", "created_by": "carol", "recipient_ai": "bob", "body": {}}),
        )
        .await;

        let mut filter = SearchFilter::default();
        filter.created_by = Some("alice".to_string());
        let found = store.search_receipts(&filter, 50, None).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].receipt_id.as_str(), "alpha-1");

        let mut filter = SearchFilter::default();
        filter.receipt_id_contains = Some("eta".to_string());
        let found = store.search_receipts(&filter, 50, None).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].receipt_id.as_str(), "beta-1");
    }

    #[tokio::test]
    async fn search_receipts_cursor_excludes_already_seen_rows() {
        let (store, _dir) = sqlite_store().await;
        seed(
            &store,
            &json!({"receipt_id": "r1", "phase": "accepted", "obligation_id": "o1", "created_by": "a", "recipient_ai": "b", "body": {}}),
        )
        .await;
        let second = seed(
            &store,
            &json!({"receipt_id": "r2", "phase": "accepted", "obligation_id": "o2", "created_by": "a", "recipient_ai": "b", "body": {}}),
        )
        .await;

        let first_page = store.search_receipts(&SearchFilter::default(), 1, None).await.unwrap();
        assert_eq!(first_page.len(), 1);
        assert_eq!(first_page[0].receipt_id, second.receipt_id);

        let cursor = PageCursor {
            created_at: first_page[0].created_at.unwrap(),
            receipt_id: first_page[0].receipt_id.as_str().to_string(),
        };
        let second_page = store.search_receipts(&SearchFilter::default(), 10, Some(&cursor)).await.unwrap();
        assert_eq!(second_page.len(), 1);
        assert_eq!(second_page[0].receipt_id.as_str(), "r1");
    }
}
