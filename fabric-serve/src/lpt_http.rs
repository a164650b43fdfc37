//! `POST /lpt/callback` and `POST /hr/callback`.
//! Both endpoints share the same wire shape and the same processing rules;
//! the HR worker is just another LPT-style collaborator.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use chrono::{DateTime, Utc};
use fabric_core::LptCallbackPayload;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::state::AppState;

/// The full wire body: everything the original LPT request carried, plus
/// the worker's `response`. `company_id` is not part of the documented
/// callback fields but is required to resolve which company's workflow to
/// resume -- callers are expected to echo it back from the original dispatch.
#[derive(Debug, Deserialize)]
pub struct LptCallbackRequest {
    pub collection_name: String,
    pub user_id: String,
    pub company_id: Option<String>,
    pub client_uuid: String,
    pub mandates_path: String,
    pub batch_id: String,
    #[serde(default)]
    pub jobs_data: Value,
    #[serde(default)]
    pub settings: Value,
    pub traceability: Value,
    #[serde(default)]
    pub pub_sub_id: Value,
    #[serde(default)]
    pub start_instructions: Option<String>,
    pub response: fabric_core::LptResponse,
    #[serde(default)]
    pub execution_time: Option<f64>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub logs_url: Option<String>,
}

fn auth_error() -> Json<Value> {
    Json(json!({"ok": false, "error": {"code": "AUTH_FAILED", "message": "invalid or missing bearer token"}}))
}

async fn handle(state: &Arc<AppState>, request: LptCallbackRequest) -> Json<Value> {
    let Some(company_id) = request.company_id.clone() else {
        return Json(json!({"ok": false, "error": {"code": "MISSING_COMPANY_ID", "message": "company_id is required"}}));
    };
    let thread_key = match request.traceability.get("thread_key").and_then(Value::as_str) {
        Some(t) => t.to_string(),
        None => {
            return Json(json!({"ok": false, "error": {"code": "INVALID_ARGS", "message": "traceability.thread_key is required"}}));
        }
    };

    let original_payload = json!({
        "collection_name": request.collection_name,
        "client_uuid": request.client_uuid,
        "jobs_data": request.jobs_data,
        "settings": request.settings,
        "traceability": request.traceability,
        "pub_sub_id": request.pub_sub_id,
        "start_instructions": request.start_instructions,
    });

    let payload = LptCallbackPayload {
        batch_id: request.batch_id,
        original_payload,
        response: request.response,
        execution_time: request.execution_time,
        completed_at: request.completed_at,
        logs_url: request.logs_url,
    };

    match state
        .lpt
        .handle_callback(&request.user_id, &company_id, &thread_key, &request.mandates_path, payload)
        .await
    {
        Ok(ack) => Json(json!({"ok": true, "task_id": ack.id, "message": "Callback traité avec succès"})),
        Err(e) => {
            tracing::warn!(error = %e, "lpt callback failed");
            Json(json!({"ok": false, "error": {"code": "INTERNAL", "message": e.to_string()}}))
        }
    }
}

pub async fn lpt_callback(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<LptCallbackRequest>,
) -> Json<Value> {
    let auth_header = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    if !state.check_bearer(auth_header) {
        return auth_error();
    }
    handle(&state, request).await
}

pub async fn hr_callback(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<LptCallbackRequest>,
) -> Json<Value> {
    let auth_header = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    if !state.check_bearer(auth_header) {
        return auth_error();
    }
    handle(&state, request).await
}
