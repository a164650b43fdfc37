//! Protocol-level event types: the WebSocket event taxonomy.
//! Envelope (session_id, node_id, event_id) is applied separately by `EnvelopeState`.

use serde::Serialize;
use serde_json::Value;

/// One event on the WebSocket hub: `{type, payload}` per the fabric's wire format.
///
/// Variant names carry their dotted wire `type` via `#[serde(rename = ...)]` since
/// `rename_all` cannot produce the `namespace.verb` shape used on the wire.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type")]
pub enum ProtocolEvent {
    #[serde(rename = "ping")]
    Ping { timestamp: i64 },

    #[serde(rename = "error")]
    Error { code: String, message: String },

    #[serde(rename = "stream.start")]
    StreamStart { thread_key: String },
    #[serde(rename = "stream.chunk")]
    StreamChunk { thread_key: String, content: String },
    #[serde(rename = "stream.end")]
    StreamEnd {
        thread_key: String,
        assistant_message_id: String,
    },
    #[serde(rename = "stream.error")]
    StreamError { thread_key: String, message: String },

    #[serde(rename = "chat.message")]
    ChatMessage {
        thread_key: String,
        message_id: String,
        role: String,
        content: Value,
    },

    #[serde(rename = "workflow.invoice_update")]
    WorkflowInvoiceUpdate { job_id: String, fields: Value },
    #[serde(rename = "workflow.step_update")]
    WorkflowStepUpdate { job_id: String, step_status: Value },

    #[serde(rename = "transaction.status_change")]
    TransactionStatusChange {
        batch_id: String,
        changed: Vec<Value>,
    },
}

impl ProtocolEvent {
    /// Serializes this event to a JSON object (type + payload only; no envelope).
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}
