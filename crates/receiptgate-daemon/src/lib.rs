// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "Axum HTTP surface for ReceiptGate: POST /mcp and GET /health."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod middleware;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use middleware::{auth_middleware, request_id_middleware, request_logger};
use receiptgate_config::ReceiptGateConfig;
use receiptgate_rpc::{JsonRpcRequest, JsonRpcResponse, RpcContext};
use receiptgate_store::Store;
use serde_json::{Value, json};
use std::sync::Arc;
use uuid::Uuid;

/// Shared application state handed to every Axum handler.
pub struct AppState {
    /// Persistence handle.
    pub store: Arc<Store>,
    /// Loaded runtime configuration.
    pub config: ReceiptGateConfig,
    /// Stable per-process identifier reported by health checks.
    pub instance_id: Uuid,
}

impl AppState {
    fn rpc_context(&self) -> RpcContext {
        RpcContext {
            store: self.store.clone(),
            body_max_bytes: self.config.receipt_body_max_bytes,
            instance_id: self.instance_id,
            tool_timeout: std::time::Duration::from_millis(self.config.tool_call_timeout_ms),
            enable_graph_layer: self.config.enable_graph_layer,
        }
    }
}

/// Build the Axum router: `GET /health` (no auth) and `POST /mcp` (API-key
/// gated per spec §6.3).
pub fn build_app(state: Arc<AppState>) -> Router {
    let mcp = Router::new()
        .route("/mcp", post(handle_mcp))
        .route_layer(axum::middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/health", get(handle_health))
        .merge(mcp)
        .layer(axum::middleware::from_fn(request_logger))
        .layer(axum::middleware::from_fn(request_id_middleware))
        .with_state(state)
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Response {
    let body = json!({
        "status": "ok",
        "service": "receiptgate",
        "version": env!("CARGO_PKG_VERSION"),
        "instance_id": state.instance_id,
    });
    match state.store.ping().await {
        Ok(()) => (StatusCode::OK, Json(body)).into_response(),
        Err(err) => {
            tracing::warn!(error = %err, "health check failed: database unreachable");
            let mut unreachable = body;
            unreachable["status"] = json!("unreachable");
            (StatusCode::SERVICE_UNAVAILABLE, Json(unreachable)).into_response()
        }
    }
}

async fn handle_mcp(State(state): State<Arc<AppState>>, body: Json<Value>) -> Response {
    let ctx = state.rpc_context();
    let request: JsonRpcRequest = match serde_json::from_value(body.0) {
        Ok(r) => r,
        Err(e) => {
            let resp = JsonRpcResponse::parse_error(Value::Null, e.to_string());
            return (StatusCode::OK, Json(resp)).into_response();
        }
    };
    let resp = receiptgate_rpc::dispatch(request, &ctx).await;
    (StatusCode::OK, Json(resp)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use middleware::API_KEY_HEADER;
    use tower::ServiceExt;

    async fn state(allow_insecure_dev: bool) -> (Arc<AppState>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.db");
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let store = Store::connect(&url, true).await.unwrap();
        let config = ReceiptGateConfig {
            database_url: url,
            api_key: Some("secret".into()),
            allow_insecure_dev,
            auto_migrate_on_startup: true,
            receipt_body_max_bytes: 262_144,
            enable_graph_layer: false,
            enable_semantic_layer: false,
            tool_call_timeout_ms: 30_000,
        };
        (
            Arc::new(AppState { store: Arc::new(store), config, instance_id: Uuid::new_v4() }),
            dir,
        )
    }

    #[tokio::test]
    async fn health_returns_ok_without_auth() {
        let (state, _dir) = state(false).await;
        let app = build_app(state);
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn mcp_without_api_key_is_unauthorized() {
        let (state, _dir) = state(false).await;
        let app = build_app(state);
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/mcp")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(
                        json!({"jsonrpc": "2.0", "id": 1, "method": "receiptgate.health"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn mcp_with_api_key_dispatches() {
        let (state, _dir) = state(false).await;
        let app = build_app(state);
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/mcp")
                    .header("content-type", "application/json")
                    .header(API_KEY_HEADER, "secret")
                    .body(axum::body::Body::from(
                        json!({"jsonrpc": "2.0", "id": 1, "method": "receiptgate.health"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["result"]["status"], json!("ok"));
    }

    #[tokio::test]
    async fn insecure_dev_bypasses_auth() {
        let (state, _dir) = state(true).await;
        let app = build_app(state);
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/mcp")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(
                        json!({"jsonrpc": "2.0", "id": 1, "method": "receiptgate.health"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
