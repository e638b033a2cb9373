// SPDX-License-Identifier: MIT OR Apache-2.0
//! Middleware stack for the ReceiptGate daemon HTTP API.

use crate::AppState;
use axum::{
    extract::{Request, State},
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use uuid::Uuid;

/// Header a caller must present the configured API key under (spec §6.3).
pub const API_KEY_HEADER: &str = "x-receiptgate-api-key";

/// A unique request identifier, available as an Axum extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub Uuid);

/// Generates a [`RequestId`] for each request and sets the `x-request-id`
/// response header.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let id = RequestId(Uuid::new_v4());
    req.extensions_mut().insert(id);
    let mut resp = next.run(req).await;
    resp.headers_mut().insert(
        "x-request-id",
        HeaderValue::from_str(&id.0.to_string()).expect("uuid is a valid header value"),
    );
    resp
}

/// Logs method, path, status code, duration, and request id for each
/// request. Must run after [`request_id_middleware`] in the layer stack so
/// the [`RequestId`] extension is already present.
pub async fn request_logger(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let request_id = req.extensions().get::<RequestId>().copied();
    let start = Instant::now();

    let resp = next.run(req).await;

    info!(
        http.method = %method,
        http.path = %path,
        http.status = resp.status().as_u16(),
        http.duration_ms = start.elapsed().as_millis() as u64,
        request_id = ?request_id.map(|id| id.0),
        "request completed"
    );

    resp
}

/// Enforces the API key on every request this layer is applied to (spec
/// §6.3). `GET /health` never runs through this layer; every `POST /mcp`
/// request does.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    if state.config.allow_insecure_dev {
        return next.run(req).await;
    }

    let presented = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    let expected = state.config.api_key.as_deref();
    match (presented, expected) {
        (Some(p), Some(e)) if p == e => next.run(req).await,
        _ => (
            StatusCode::UNAUTHORIZED,
            axum::Json(json!({
                "error": {
                    "kind": "UNAUTHORIZED",
                    "message": format!("missing or invalid {API_KEY_HEADER} header"),
                }
            })),
        )
            .into_response(),
    }
}
