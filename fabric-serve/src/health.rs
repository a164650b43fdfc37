//! `GET /healthz`, `/version`, `/readyz`, `/debug`, `/ws-metrics`.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::state::{AppState, VERSION};

pub async fn healthz(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": VERSION,
        "listeners_count": state.listeners.attached_user_count(),
        "workflow_listeners_count": state.listeners.workflow_watcher_count(),
        "redis": state.kv.get("__healthz_probe__").await.is_ok(),
        "uptime_s": state.uptime_seconds(),
        "region": std::env::var("REGION").unwrap_or_else(|_| "local".to_string()),
    }))
}

pub async fn version() -> Json<Value> {
    Json(json!({"version": VERSION}))
}

pub async fn readyz(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    match state.kv.get("__readyz_probe__").await {
        Ok(_) => (StatusCode::OK, Json(json!({"ok": true}))),
        Err(e) => {
            tracing::warn!(error = %e, "readyz probe failed");
            (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"ok": false, "error": "redis_unavailable"})))
        }
    }
}

pub async fn debug(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "uptime_s": state.uptime_seconds(),
        "attached_users": state.listeners.attached_user_count(),
        "workflow_watchers": state.listeners.workflow_watcher_count(),
        "hub_attached_users": state.hub.attached_user_count(),
        "rpc_api_version": state.settings.rpc_api_version,
        "settings": {
            "heartbeat_interval_s": state.settings.heartbeat_interval.as_secs(),
            "keepalive_interval_s": state.settings.keepalive_interval.as_secs(),
            "presence_ttl_s": state.settings.presence_ttl.as_secs(),
            "workflow_listener_enabled": state.settings.workflow_listener_enabled,
            "transaction_listener_enabled": state.settings.transaction_listener_enabled,
        },
    }))
}

pub async fn ws_metrics(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({"disconnects": state.ws_metrics.snapshot()}))
}
