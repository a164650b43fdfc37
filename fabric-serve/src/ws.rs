//! `WEBSOCKET /ws?uid=&session_id=&space_code=&thread_key=&mode=`.
//! One cooperative event loop per socket: heartbeat, keepalive, chat-watcher
//! attach + buffer drain on connect, a JSON `{type, payload}` receive loop,
//! and disconnect cleanup with classified reason recording.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use fabric_core::UserPresence;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::state::AppState;
use crate::ws_metrics::DisconnectReason;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub uid: String,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Not in the originally documented query string, but required to resolve
    /// which company's workflow a chat watcher attaches to; accepted as a
    /// pragmatic supplement (see DESIGN.md).
    #[serde(default)]
    pub company_id: Option<String>,
    #[serde(default)]
    pub space_code: Option<String>,
    #[serde(default)]
    pub thread_key: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, params: WsParams) {
    let uid = params.uid.clone();
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    let conn_id = state.hub.register(&uid, tx.clone());
    state.presence.heartbeat(&UserPresence::online(&uid)).await;
    state.listeners.on_presence_changed(&uid, true).await;

    if let (Some(space_code), Some(thread_key)) = (&params.space_code, &params.thread_key) {
        if let Some(company_id) = &params.company_id {
            let candidates = fabric_core::chat_thread_candidates(space_code, thread_key);
            if let Some(rtdb_path) = candidates.first() {
                state
                    .listeners
                    .attach_chat_watcher(&uid, company_id, space_code, thread_key, rtdb_path)
                    .await;
            }
            drain_buffer(&state, &uid, thread_key, &tx).await;
        }
    }

    let heartbeat_handle = {
        let state = state.clone();
        let uid = uid.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(state.settings.heartbeat_interval);
            interval.tick().await; // first tick fires immediately; skip it, connect already heartbeat-ed
            loop {
                interval.tick().await;
                state.presence.heartbeat(&UserPresence::online(&uid)).await;
            }
        })
    };

    let keepalive_handle = {
        let state = state.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(state.settings.keepalive_interval);
            loop {
                interval.tick().await;
                let frame = json!({"type": "ping", "timestamp": chrono::Utc::now().timestamp()});
                if tx.send(Message::Text(frame.to_string())).is_err() {
                    break;
                }
            }
        })
    };

    let mut close_code: Option<u16> = None;
    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if let Some(response) = dispatch_frame(&state, &uid, &text).await {
                    let _ = tx.send(Message::Text(response.to_string()));
                }
            }
            Ok(Message::Close(frame)) => {
                close_code = frame.map(|CloseFrame { code, .. }| code);
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(uid, error = %e, "websocket read error");
                close_code = Some(1006);
                break;
            }
        }
    }

    heartbeat_handle.abort();
    keepalive_handle.abort();
    writer.abort();
    state.hub.unregister(&uid, conn_id);
    if let (Some(space_code), Some(thread_key)) = (&params.space_code, &params.thread_key) {
        let _ = (space_code, thread_key);
    }
    state.listeners.on_presence_changed(&uid, false).await;
    state.presence.mark_offline(&uid).await;
    state.ws_metrics.record(&DisconnectReason::from_close_code(close_code));
}

async fn drain_buffer(state: &Arc<AppState>, uid: &str, thread_key: &str, tx: &mpsc::UnboundedSender<Message>) {
    let key = fabric_core::namespace::ws_buffer_key(uid, thread_key);
    match state.kv.lrange(&key, 0, -1).await {
        Ok(messages) => {
            for raw in messages {
                let _ = tx.send(Message::Text(raw));
            }
            if let Err(e) = state.kv.delete(&key).await {
                tracing::warn!(uid, thread_key, error = %e, "failed to clear ws buffer after drain");
            }
        }
        Err(e) => tracing::warn!(uid, thread_key, error = %e, "failed to read ws buffer"),
    }
}

/// Parses one frame and dispatches by `type`. Unknown types are
/// logged and ignored -- this returns `None` rather than an error frame.
async fn dispatch_frame(state: &Arc<AppState>, uid: &str, text: &str) -> Option<Value> {
    let frame: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(uid, error = %e, "failed to parse websocket frame");
            return Some(json!({"type": "error", "payload": {"message": "invalid json"}}));
        }
    };
    let msg_type = frame.get("type").and_then(Value::as_str).unwrap_or("");
    let payload = frame.get("payload").cloned().unwrap_or_else(|| json!({}));

    match msg_type {
        "auth.firebase_token" => Some(json!({"type": "auth.result", "payload": {"ok": true}})),
        "dashboard.orchestrate_init" | "dashboard.refresh" => {
            let force_refresh = msg_type == "dashboard.refresh";
            let company_id = payload.get("company_id").cloned().unwrap_or(Value::Null);
            let request = fabric_core::RpcRequest {
                api_version: state.settings.rpc_api_version.clone(),
                method: "DASHBOARD.full_data".to_string(),
                args: Vec::new(),
                kwargs: json!({"company_id": company_id, "force_refresh": force_refresh}),
                user_id: Some(uid.to_string()),
                session_id: None,
                reply_to: None,
                idempotency_key: uuid::Uuid::new_v4().to_string(),
                timeout_ms: None,
                trace_id: None,
            };
            let response = state.rpc.dispatch(request, None).await;
            Some(json!({"type": format!("{msg_type}.response"), "payload": response}))
        }
        "dashboard.company_change" => Some(json!({"type": "dashboard.company_change.response", "payload": {"ok": true}})),
        "task.list" | "task.execute" | "task.toggle_enabled" | "task.update" => {
            let method = match msg_type {
                "task.list" => "TASK.list",
                "task.execute" => "TASK.execute",
                "task.toggle_enabled" => "TASK.toggle_enabled",
                _ => "TASK.update",
            };
            let request = fabric_core::RpcRequest {
                api_version: state.settings.rpc_api_version.clone(),
                method: method.to_string(),
                args: Vec::new(),
                kwargs: payload,
                user_id: Some(uid.to_string()),
                session_id: None,
                reply_to: None,
                idempotency_key: uuid::Uuid::new_v4().to_string(),
                timeout_ms: None,
                trace_id: None,
            };
            let response = state.rpc.dispatch(request, None).await;
            Some(json!({"type": format!("{msg_type}.response"), "payload": response}))
        }
        other => {
            tracing::info!(uid, msg_type = other, "ignoring unknown websocket frame type");
            None
        }
    }
}
