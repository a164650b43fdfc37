//! `POST /invalidate-context`, `POST /admin/invalidate_cache` -- operator
//! tools.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct InvalidateContextRequest {
    pub user_id: String,
    pub company_id: String,
}

pub async fn invalidate_context(
    State(state): State<Arc<AppState>>,
    Json(request): Json<InvalidateContextRequest>,
) -> Json<Value> {
    match state.agent.invalidate_user_context(&request.user_id, &request.company_id).await {
        Ok(()) => Json(json!({"ok": true})),
        Err(e) => {
            tracing::warn!(error = %e, "invalidate_context failed");
            Json(json!({"ok": false, "error": {"code": "INTERNAL", "message": e.to_string()}}))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct InvalidateCacheRequest {
    pub user_id: String,
    pub company_id: String,
    pub data_type: String,
}

pub async fn invalidate_cache(
    State(state): State<Arc<AppState>>,
    Json(request): Json<InvalidateCacheRequest>,
) -> Json<Value> {
    match state
        .cache
        .invalidate_module_cache(&request.user_id, &request.company_id, &request.data_type)
        .await
    {
        Ok(deleted) => Json(json!({"ok": true, "deleted_count": deleted})),
        Err(e) => {
            tracing::warn!(error = %e, "invalidate_cache failed");
            Json(json!({"ok": false, "error": {"code": "INTERNAL", "message": e.to_string()}}))
        }
    }
}
