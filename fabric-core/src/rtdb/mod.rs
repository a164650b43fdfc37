//! Realtime tree database client: path-scoped listeners over a tree of
//! JSON values, demultiplexing `put`/`patch` events, with the documented
//! path-fallback behaviour for chat thread attachment.

mod error;
mod in_memory;

pub use error::RtdbError;
pub use in_memory::InMemoryRtdb;

use async_trait::async_trait;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtdbEventType {
    Put,
    Patch,
}

#[derive(Debug, Clone)]
pub struct RtdbEvent {
    pub event_type: RtdbEventType,
    /// `"/"` for the initial full snapshot;
    /// `"/{key}"` for a single child write thereafter.
    pub path: String,
    pub data: Value,
}

pub struct RtdbListenerHandle {
    pub events: tokio::sync::mpsc::Receiver<RtdbEvent>,
    _guard: in_memory::RtdbSubscriptionGuard,
}

#[async_trait]
pub trait RtdbStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<Value>, RtdbError>;

    /// Overwrites the node at `path`, firing a [`RtdbEventType::Put`].
    async fn put(&self, path: &str, data: Value) -> Result<(), RtdbError>;

    /// Shallow-merges `data` into the node at `path`, firing a [`RtdbEventType::Patch`].
    async fn patch(&self, path: &str, data: Value) -> Result<(), RtdbError>;

    fn listen(&self, path: &str) -> RtdbListenerHandle;
}

/// Tries each of `candidates` in order, returning the
/// first one with existing data and the listener attached to it. Falls back
/// to the first candidate if none has data yet (a brand-new thread) -- per
/// the open question in SPEC_FULL.md/DESIGN.md, the first candidate in the
/// configured order is authoritative once chosen, for the rest of the
/// thread's lifetime.
pub async fn attach_with_fallback(
    store: &dyn RtdbStore,
    candidates: &[String],
) -> Result<(String, RtdbListenerHandle), RtdbError> {
    for path in candidates {
        if store.get(path).await?.is_some() {
            return Ok((path.clone(), store.listen(path)));
        }
    }
    let chosen = candidates
        .first()
        .cloned()
        .unwrap_or_else(|| String::new());
    Ok((chosen.clone(), store.listen(&chosen)))
}

/// Builds the three fallback candidate paths for a chat thread.
pub fn chat_thread_candidates(space_code: &str, thread_key: &str) -> Vec<String> {
    ["active_chats", "chats", "job_chats"]
        .iter()
        .map(|mode| format!("{space_code}/{mode}/{thread_key}/messages"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listen_ignores_initial_snapshot_by_convention() {
        let db = InMemoryRtdb::new();
        db.put("clients/u1/direct_message_notif", serde_json::json!({"a": 1}))
            .await
            .unwrap();
        let mut handle = db.listen("clients/u1/direct_message_notif");
        db.patch("clients/u1/direct_message_notif", serde_json::json!({"b": 2}))
            .await
            .unwrap();
        let ev = handle.events.recv().await.unwrap();
        assert_eq!(ev.event_type, RtdbEventType::Patch);
    }

    #[tokio::test]
    async fn chat_thread_candidates_try_active_chats_first() {
        let candidates = chat_thread_candidates("space1", "t1");
        assert_eq!(candidates[0], "space1/active_chats/t1/messages");
        assert_eq!(candidates[1], "space1/chats/t1/messages");
        assert_eq!(candidates[2], "space1/job_chats/t1/messages");
    }

    #[tokio::test]
    async fn attach_with_fallback_picks_first_existing_bucket() {
        let db = InMemoryRtdb::new();
        let candidates = chat_thread_candidates("space1", "t1");
        db.put(&candidates[1], serde_json::json!({"msg1": {"text": "hi"}}))
            .await
            .unwrap();
        let (chosen, _handle) = attach_with_fallback(&db, &candidates).await.unwrap();
        assert_eq!(chosen, candidates[1]);
    }

    #[tokio::test]
    async fn attach_with_fallback_defaults_to_first_when_empty() {
        let db = InMemoryRtdb::new();
        let candidates = chat_thread_candidates("space1", "t1");
        let (chosen, _handle) = attach_with_fallback(&db, &candidates).await.unwrap();
        assert_eq!(chosen, candidates[0]);
    }
}
