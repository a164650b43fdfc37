//! LPT dispatch & callback: emits long-running-task requests through an
//! opaque transport (HTTP POST is the only collaborator in scope; a message
//! queue transport is possible but not implemented here), and processes the
//! worker's callback by resuming the owning workflow.

mod error;

pub use error::LptError;

use crate::agent::AgentRuntime;
use crate::docdb::DocDbStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The opaque "LPT request" object emitted to the external worker.
#[derive(Debug, Clone, Serialize)]
pub struct LptRequest {
    pub batch_id: String,
    pub collection_name: String,
    pub user_id: String,
    pub client_uuid: String,
    pub mandates_path: String,
    pub jobs_data: serde_json::Value,
    pub settings: serde_json::Value,
    pub traceability: Traceability,
    pub pub_sub_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_instructions: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Traceability {
    pub thread_key: String,
    pub thread_name: String,
}

/// Dispatch transport, an external collaborator. HTTP POST is the only
/// implementation in scope; a queue-backed transport would implement the same trait.
#[async_trait]
pub trait LptTransport: Send + Sync {
    async fn dispatch(&self, request: &LptRequest) -> Result<(), LptError>;
}

/// `reqwest`-backed transport posting the request as JSON with a bearer token.
pub struct HttpLptTransport {
    client: reqwest::Client,
    endpoint: String,
    bearer_token: Option<String>,
}

impl HttpLptTransport {
    pub fn new(endpoint: impl Into<String>, bearer_token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            bearer_token,
        }
    }
}

#[async_trait]
impl LptTransport for HttpLptTransport {
    async fn dispatch(&self, request: &LptRequest) -> Result<(), LptError> {
        let mut builder = self.client.post(&self.endpoint).json(request);
        if let Some(token) = &self.bearer_token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await.map_err(|e| LptError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(LptError::Transport(format!("lpt worker returned {}", response.status())));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LptResponseStatus {
    Completed,
    Failed,
    Partial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LptResponse {
    pub status: LptResponseStatus,
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
}

/// The full callback body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LptCallbackPayload {
    pub batch_id: String,
    #[serde(default)]
    pub original_payload: serde_json::Value,
    pub response: LptResponse,
    #[serde(default)]
    pub execution_time: Option<f64>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub logs_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallbackAck {
    pub id: String,
    pub planned: bool,
}

/// Processes an LPT callback. `mandates_path` roots the
/// planned-task document, `user_id`/`company_id`/`thread_key` identify the
/// workflow to resume.
pub struct LptCallbackProcessor {
    docdb: Arc<dyn DocDbStore>,
    agent: Arc<AgentRuntime>,
}

impl LptCallbackProcessor {
    pub fn new(docdb: Arc<dyn DocDbStore>, agent: Arc<AgentRuntime>) -> Self {
        Self { docdb, agent }
    }

    pub async fn handle_callback(
        &self,
        user_id: &str,
        company_id: &str,
        thread_key: &str,
        mandates_path: &str,
        payload: LptCallbackPayload,
    ) -> Result<CallbackAck, LptError> {
        let task_path = format!("{mandates_path}/tasks/{thread_key}");
        let planned = self.docdb.get(&task_path).await?.is_some();

        if planned {
            let mut update = payload.original_payload.clone();
            if let Some(obj) = update.as_object_mut() {
                obj.insert("status".to_string(), serde_json::to_value(&payload.response.status)?);
                obj.insert("result".to_string(), payload.response.result.clone());
                obj.insert(
                    "error".to_string(),
                    payload.response.error.clone().map(serde_json::Value::String).unwrap_or(serde_json::Value::Null),
                );
                obj.insert(
                    "completed_at".to_string(),
                    payload
                        .completed_at
                        .map(|t| serde_json::Value::String(t.to_rfc3339()))
                        .unwrap_or(serde_json::Value::Null),
                );
            }
            self.docdb.set(&task_path, update, true).await?;
        }

        let response_value = serde_json::to_value(&payload.response)?;
        let agent = self.agent.clone();
        let uid = user_id.to_string();
        let cid = company_id.to_string();
        let tk = thread_key.to_string();
        tokio::spawn(async move {
            if let Err(e) = agent.resume_from_lpt_callback(&uid, &cid, &tk, response_value).await {
                tracing::warn!(uid = %uid, thread_key = %tk, error = %e, "failed to resume workflow from lpt callback");
            }
        });

        Ok(CallbackAck {
            id: if planned { thread_key.to_string() } else { payload.batch_id.clone() },
            planned,
        })
    }
}
