// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "JSON-RPC 2.0 envelope and tool dispatch for the `receiptgate.*` surface."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Envelope shapes mirror a minimal MCP-style JSON-RPC driver
//! (`JsonRpcRequest`/`JsonRpcResponse`/`JsonRpcError`), generalised from a
//! `u64` request id to a [`serde_json::Value`] because JSON-RPC 2.0 permits
//! string, number, or null ids and this surface should not reject a
//! perfectly legal request over an id-type assumption the grounding source
//! happened to make for its own closed client population.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use receiptgate_derive::{ChainEntry, Direction, Page, ReceiptsPageCursor, SearchReceiptsFilter};
use receiptgate_error::{ErrorKind, ReceiptGateError};
use receiptgate_store::Store;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// A JSON-RPC 2.0 request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Must be the literal string `"2.0"`.
    pub jsonrpc: String,
    /// Request correlation id. JSON-RPC 2.0 permits string, number, or
    /// null; this surface accepts any of them.
    #[serde(default)]
    pub id: Value,
    /// Tool name, e.g. `"receiptgate.submit_receipt"`.
    pub method: String,
    /// Tool-specific parameters.
    #[serde(default)]
    pub params: Value,
}

/// A JSON-RPC 2.0 response envelope. Exactly one of `result`/`error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Echoes the request's id.
    pub id: Value,
    /// Present on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Present on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    fn success(id: Value, result: Value) -> Self {
        Self { jsonrpc: "2.0".into(), id, result: Some(result), error: None }
    }

    fn failure(id: Value, error: JsonRpcError) -> Self {
        Self { jsonrpc: "2.0".into(), id, result: None, error: Some(error) }
    }

    /// Build a response for a request body that failed to deserialize into
    /// a [`JsonRpcRequest`] at all — there is no request id to echo, so the
    /// caller (the `axum` handler in `receiptgate-daemon`) passes
    /// [`Value::Null`].
    #[must_use]
    pub fn parse_error(id: Value, message: impl Into<String>) -> Self {
        Self::failure(id, JsonRpcError { code: PARSE_ERROR, message: message.into(), data: None })
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Standard (`-32700..-32600`) or application-defined (below `-32000`) code.
    pub code: i64,
    /// Human-readable summary.
    pub message: String,
    /// Structured context: error kind (spec §7) plus any extra fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

impl From<&ReceiptGateError> for JsonRpcError {
    fn from(err: &ReceiptGateError) -> Self {
        let payload = err.to_payload();
        Self {
            code: err.kind.json_rpc_code(),
            message: err.message.clone(),
            data: Some(json!({ "kind": payload.kind, "context": payload.context })),
        }
    }
}

/// Shared state every dispatched call needs.
#[derive(Clone)]
pub struct RpcContext {
    /// The persistence handle.
    pub store: Arc<Store>,
    /// Per-receipt body size cap, from configuration.
    pub body_max_bytes: usize,
    /// Stable per-process identifier reported by `receiptgate.health`.
    pub instance_id: Uuid,
    /// Deadline a single tool call is allowed to run before this surface
    /// reports [`ErrorKind::Timeout`] (spec §6.4 `tool_call_timeout_ms`).
    pub tool_timeout: Duration,
    /// Whether to maintain the `receipt_edges` graph projection on write
    /// (spec §6.4 `enable_graph_layer`).
    pub enable_graph_layer: bool,
}

/// Opaque pagination token wrapping `(created_at, receipt_id)` (spec §4.5):
/// base64 so it round-trips safely through JSON and query strings without a
/// caller needing to know or depend on its internal shape.
fn encode_cursor(cursor: &ReceiptsPageCursor) -> String {
    let raw = format!("{}|{}", cursor.created_at.to_rfc3339(), cursor.receipt_id);
    URL_SAFE_NO_PAD.encode(raw)
}

fn decode_cursor(raw: &str) -> Result<ReceiptsPageCursor, ReceiptGateError> {
    let bytes = URL_SAFE_NO_PAD.decode(raw).map_err(|_| missing_param("cursor"))?;
    let text = String::from_utf8(bytes).map_err(|_| missing_param("cursor"))?;
    let (created_at, receipt_id) = text.split_once('|').ok_or_else(|| missing_param("cursor"))?;
    let created_at = created_at.parse().map_err(|_| missing_param("cursor"))?;
    Ok(ReceiptsPageCursor { created_at, receipt_id: receipt_id.to_string() })
}

fn page_to_json<T: Serialize>(page: Page<T>) -> Value {
    json!({
        "receipts": page.items,
        "next_cursor": page.next_cursor.as_ref().map(encode_cursor),
    })
}

/// Wrap a tool call with the configured per-call deadline (spec §6.4): a
/// call that does not complete in time is reported as
/// [`ErrorKind::Timeout`] rather than left to hang the caller indefinitely.
async fn with_timeout<T>(
    ctx: &RpcContext,
    fut: impl Future<Output = Result<T, ReceiptGateError>>,
) -> Result<T, ReceiptGateError> {
    match tokio::time::timeout(ctx.tool_timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ReceiptGateError::new(
            ErrorKind::Timeout,
            format!("tool call exceeded the configured {:?} deadline", ctx.tool_timeout),
        )),
    }
}

/// Parse a raw JSON-RPC request body and dispatch it.
///
/// Malformed JSON never reaches [`dispatch`]: the caller (the `axum`
/// handler in `receiptgate-daemon`) is expected to catch deserialization
/// failure and build a bare [`JsonRpcResponse`] with a null id and
/// [`PARSE_ERROR`] itself, since a request that didn't parse has no id to
/// echo.
pub async fn dispatch(request: JsonRpcRequest, ctx: &RpcContext) -> JsonRpcResponse {
    if request.jsonrpc != "2.0" {
        return JsonRpcResponse::failure(
            request.id,
            JsonRpcError { code: INVALID_REQUEST, message: "jsonrpc must be \"2.0\"".into(), data: None },
        );
    }

    let result = match request.method.as_str() {
        "receiptgate.submit_receipt" => with_timeout(ctx, submit_receipt(ctx, &request.params)).await,
        "receiptgate.get_receipt" => with_timeout(ctx, get_receipt(ctx, &request.params)).await,
        "receiptgate.get_receipt_chain" => with_timeout(ctx, get_receipt_chain(ctx, &request.params)).await,
        "receiptgate.list_inbox" => with_timeout(ctx, list_inbox(ctx, &request.params)).await,
        "receiptgate.list_task_receipts" => with_timeout(ctx, list_task_receipts(ctx, &request.params)).await,
        "receiptgate.search_receipts" => with_timeout(ctx, search_receipts(ctx, &request.params)).await,
        "receiptgate.health" => Ok(health(ctx)),
        other => {
            return JsonRpcResponse::failure(
                request.id,
                JsonRpcError {
                    code: METHOD_NOT_FOUND,
                    message: format!("unknown tool {other:?}"),
                    data: None,
                },
            );
        }
    };

    match result {
        Ok(value) => JsonRpcResponse::success(request.id, value),
        Err(err) => {
            tracing::warn!(method = %request.method, kind = err.kind.as_str(), "rpc call failed");
            JsonRpcResponse::failure(request.id, (&err).into())
        }
    }
}

fn param_str<'a>(params: &'a Value, field: &str) -> Result<&'a str, ReceiptGateError> {
    params
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| missing_param(field))
}

fn missing_param(field: &str) -> ReceiptGateError {
    ReceiptGateError::new(ErrorKind::ValidationFailed, format!("missing or invalid required parameter {field:?}"))
}

fn parse_cursor_param(params: &Value) -> Result<Option<ReceiptsPageCursor>, ReceiptGateError> {
    match params.get("cursor").and_then(Value::as_str) {
        None => Ok(None),
        Some(raw) => decode_cursor(raw).map(Some),
    }
}

async fn submit_receipt(ctx: &RpcContext, params: &Value) -> Result<Value, ReceiptGateError> {
    let receipt = params.get("receipt").ok_or_else(|| missing_param("receipt"))?;
    let committed = receiptgate_ledger::append(
        &ctx.store,
        receipt,
        Some(ctx.body_max_bytes),
        ctx.enable_graph_layer,
    )
    .await?;
    Ok(serde_json::to_value(committed).expect("Receipt serializes"))
}

async fn get_receipt(ctx: &RpcContext, params: &Value) -> Result<Value, ReceiptGateError> {
    if let Ok(receipt_id) = param_str(params, "receipt_id") {
        let receipt = receiptgate_derive::get_receipt(&ctx.store, receipt_id).await?;
        return Ok(serde_json::to_value(receipt).expect("Receipt serializes"));
    }
    let uuid_str = param_str(params, "uuid")?;
    let uuid = uuid_str
        .parse::<Uuid>()
        .map_err(|_| missing_param("uuid"))?;
    let receipt = ctx
        .store
        .find_by_uuid(uuid)
        .await?
        .ok_or_else(|| ReceiptGateError::new(ErrorKind::NotFound, format!("no receipt with uuid {uuid}")))?;
    Ok(serde_json::to_value(receipt).expect("Receipt serializes"))
}

async fn get_receipt_chain(ctx: &RpcContext, params: &Value) -> Result<Value, ReceiptGateError> {
    let receipt_id = param_str(params, "receipt_id")?;
    let direction = match params.get("direction").and_then(Value::as_str) {
        None | Some("ancestors") => Direction::Ancestors,
        Some("descendants") => Direction::Descendants,
        Some("both") => Direction::Both,
        Some(other) => {
            return Err(ReceiptGateError::new(
                ErrorKind::ValidationFailed,
                format!("direction {other:?} is not one of ancestors, descendants, both"),
            ));
        }
    };
    let max_depth = params.get("max_depth").and_then(Value::as_u64).map(|d| d as u32);
    let chain: Vec<ChainEntry> =
        receiptgate_derive::get_receipt_chain(&ctx.store, receipt_id, direction, max_depth).await?;
    Ok(serde_json::to_value(chain).expect("chain serializes"))
}

async fn list_inbox(ctx: &RpcContext, params: &Value) -> Result<Value, ReceiptGateError> {
    let recipient_ai = param_str(params, "recipient_ai")?;
    let limit = params.get("limit").and_then(Value::as_i64);
    let cursor = parse_cursor_param(params)?;
    let page = receiptgate_derive::list_inbox(&ctx.store, recipient_ai, limit, cursor.as_ref()).await?;
    Ok(page_to_json(page))
}

async fn list_task_receipts(ctx: &RpcContext, params: &Value) -> Result<Value, ReceiptGateError> {
    let task_id = param_str(params, "task_id")?;
    let receipts = receiptgate_derive::list_task_receipts(&ctx.store, task_id).await?;
    Ok(json!({ "receipts": receipts }))
}

async fn search_receipts(ctx: &RpcContext, params: &Value) -> Result<Value, ReceiptGateError> {
    let phase = match params.get("phase").and_then(Value::as_str) {
        None => None,
        Some("accepted") => Some(receiptgate_core::Phase::Accepted),
        Some("complete") => Some(receiptgate_core::Phase::Complete),
        Some("escalate") => Some(receiptgate_core::Phase::Escalate),
        Some(other) => {
            return Err(ReceiptGateError::new(
                ErrorKind::ValidationFailed,
                format!("phase {other:?} is not one of accepted, complete, escalate"),
            ));
        }
    };
    let filter = SearchReceiptsFilter {
        obligation_id: params.get("obligation_id").and_then(Value::as_str).map(str::to_string),
        recipient_ai: params.get("recipient_ai").and_then(Value::as_str).map(str::to_string),
        created_by: params.get("created_by").and_then(Value::as_str).map(str::to_string),
        phase,
        task_id: params.get("task_id").and_then(Value::as_str).map(str::to_string),
        receipt_id_contains: params.get("receipt_id_contains").and_then(Value::as_str).map(str::to_string),
        created_after: params
            .get("since")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok()),
        created_before: params
            .get("until")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok()),
    };
    let limit = params.get("limit").and_then(Value::as_i64);
    let cursor = parse_cursor_param(params)?;
    let page = receiptgate_derive::search_receipts(&ctx.store, &filter, limit, cursor.as_ref()).await?;
    Ok(page_to_json(page))
}

fn health(ctx: &RpcContext) -> Value {
    json!({
        "status": "ok",
        "service": "receiptgate",
        "version": env!("CARGO_PKG_VERSION"),
        "instance_id": ctx.instance_id,
    })
}
