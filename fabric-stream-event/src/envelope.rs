//! Envelope (session_id, thread_key, event_id) injected into every WebSocket event.
//! EnvelopeState tracks the active thread and the per-session monotonic sequence.

use crate::event::ProtocolEvent;
use serde_json::Value;

/// Envelope fields attached to every event on the wire.
#[derive(Clone, Debug, Default)]
pub struct Envelope {
    /// Session ID; constant within a WebSocket connection.
    pub session_id: Option<String>,
    /// The thread a stream/chat/workflow event belongs to, when applicable.
    pub thread_key: Option<String>,
    /// Per-connection sequence number; monotonically increasing within a session.
    pub event_id: Option<u64>,
}

impl Envelope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn with_thread_key(mut self, key: impl Into<String>) -> Self {
        self.thread_key = Some(key.into());
        self
    }

    pub fn with_event_id(mut self, id: u64) -> Self {
        self.event_id = Some(id);
        self
    }

    /// Merges envelope fields into the given JSON object (top-level only).
    /// Does not overwrite existing keys (a per-event `thread_key` wins).
    pub fn inject_into(&self, obj: &mut Value) {
        let Some(obj) = obj.as_object_mut() else {
            return;
        };
        if let Some(ref id) = self.session_id {
            obj.entry("session_id")
                .or_insert_with(|| Value::String(id.clone()));
        }
        if let Some(ref key) = self.thread_key {
            obj.entry("thread_key")
                .or_insert_with(|| Value::String(key.clone()));
        }
        if let Some(id) = self.event_id {
            obj.entry("event_id")
                .or_insert_with(|| Value::Number(serde_json::Number::from(id)));
        }
    }
}

/// Envelope state for one WebSocket connection: session id and next event id.
pub struct EnvelopeState {
    pub session_id: String,
    pub next_event_id: u64,
}

impl EnvelopeState {
    pub fn new(session_id: String) -> Self {
        Self {
            session_id,
            next_event_id: 1,
        }
    }

    /// Injects envelope into the event value and advances the sequence.
    pub fn inject_into(&mut self, value: &mut Value) {
        let env = Envelope::new()
            .with_session_id(&self.session_id)
            .with_event_id(self.next_event_id);
        self.next_event_id += 1;
        env.inject_into(value);
    }
}

/// Converts a protocol event to JSON and injects envelope using the given state.
/// Returns the final value (type + payload + session_id, event_id).
pub fn to_json(
    event: &ProtocolEvent,
    state: &mut EnvelopeState,
) -> Result<Value, serde_json::Error> {
    let mut value = event.to_value()?;
    state.inject_into(&mut value);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ProtocolEvent;

    #[test]
    fn envelope_inject_does_not_overwrite_thread_key() {
        let mut obj = serde_json::json!({"type":"stream.chunk","thread_key":"t1","content":"hi"});
        let env = Envelope::new()
            .with_session_id("sess-1")
            .with_thread_key("ignored")
            .with_event_id(1);
        env.inject_into(&mut obj);
        assert_eq!(obj["session_id"], "sess-1");
        assert_eq!(obj["thread_key"], "t1");
        assert_eq!(obj["event_id"], 1);
    }

    #[test]
    fn to_json_injects_session_and_sequence() {
        let ev = ProtocolEvent::StreamStart {
            thread_key: "t1".to_string(),
        };
        let mut state = EnvelopeState::new("sess-123".to_string());
        let first = to_json(&ev, &mut state).unwrap();
        assert_eq!(first["session_id"], "sess-123");
        assert_eq!(first["event_id"], 1);
        let second = to_json(&ev, &mut state).unwrap();
        assert_eq!(second["event_id"], 2);
    }
}
