//! `POST /rpc`. Bearer auth is optional and, when configured,
//! is checked here -- `RpcRouter::dispatch` takes the token only to keep its
//! signature symmetric with the rest of the request; the actual header
//! extraction and rejection happens at this transport boundary.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use fabric_core::RpcRequest;
use serde_json::{json, Value};

use crate::state::AppState;

pub async fn rpc_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<RpcRequest>,
) -> Json<Value> {
    let auth_header = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    if !state.check_bearer(auth_header) {
        return Json(json!({"ok": false, "error": {"code": "AUTH_FAILED", "message": "invalid or missing bearer token"}}));
    }

    let response = state.rpc.dispatch(request, auth_header).await;
    Json(serde_json::to_value(response).unwrap_or_else(|_| json!({"ok": false, "error": {"code": "INTERNAL", "message": "failed to serialize response"}})))
}
