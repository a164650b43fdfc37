//! Chat history store, key `chat:{uid}:{cid}:{thread_key}:history`, JSON, TTL 24h.
//!
//! Grounded in the original `chat_history_manager` module: messages, system
//! prompt, status, and a monotonic `version` counter bumped on every write so
//! concurrent readers can detect a stale cached copy.

mod error;

pub use error::ChatHistoryError;

use crate::kv::{scan_all, KvStore};
use crate::namespace::{self, CHAT_HISTORY_TTL};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatStatus {
    Active,
    Idle,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatHistory {
    #[serde(default)]
    pub messages: Vec<serde_json::Value>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub status: ChatStatus,
    pub message_count: usize,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl ChatHistory {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            system_prompt: None,
            metadata: serde_json::Value::Object(Default::default()),
            status: ChatStatus::Active,
            message_count: 0,
            updated_at: Utc::now(),
            version: 0,
        }
    }
}

impl Default for ChatHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatStats {
    pub total_chats: usize,
    pub total_messages: usize,
    pub active_chats: usize,
    pub chats_by_status: std::collections::HashMap<String, usize>,
}

pub struct ChatHistoryStore {
    kv: Arc<dyn KvStore>,
}

impl ChatHistoryStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    async fn write(
        &self,
        uid: &str,
        cid: &str,
        thread_key: &str,
        mut history: ChatHistory,
    ) -> Result<(), ChatHistoryError> {
        history.message_count = history.messages.len();
        history.updated_at = Utc::now();
        history.version += 1;
        let key = namespace::chat_history_key(uid, cid, thread_key);
        let payload = serde_json::to_string(&history)?;
        self.kv.setex(&key, &payload, CHAT_HISTORY_TTL).await?;
        Ok(())
    }

    pub async fn save(
        &self,
        uid: &str,
        cid: &str,
        thread_key: &str,
        history: ChatHistory,
    ) -> Result<(), ChatHistoryError> {
        self.write(uid, cid, thread_key, history).await
    }

    pub async fn load(
        &self,
        uid: &str,
        cid: &str,
        thread_key: &str,
    ) -> Result<Option<ChatHistory>, ChatHistoryError> {
        let key = namespace::chat_history_key(uid, cid, thread_key);
        match self.kv.get(&key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn get_messages(
        &self,
        uid: &str,
        cid: &str,
        thread_key: &str,
    ) -> Result<Vec<serde_json::Value>, ChatHistoryError> {
        Ok(self
            .load(uid, cid, thread_key)
            .await?
            .map(|h| h.messages)
            .unwrap_or_default())
    }

    async fn load_or_new(&self, uid: &str, cid: &str, thread_key: &str) -> Result<ChatHistory, ChatHistoryError> {
        Ok(self.load(uid, cid, thread_key).await?.unwrap_or_default())
    }

    /// Stamps the message with a stable `id` (reusing one it already carries)
    /// and returns it, so callers can surface `user_message_id`/
    /// `assistant_message_id` without re-deriving them from the stored blob.
    pub async fn append_message(
        &self,
        uid: &str,
        cid: &str,
        thread_key: &str,
        mut message: serde_json::Value,
    ) -> Result<String, ChatHistoryError> {
        let id = message
            .get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if let Some(obj) = message.as_object_mut() {
            obj.entry("id").or_insert_with(|| serde_json::Value::String(id.clone()));
        }
        let mut history = self.load_or_new(uid, cid, thread_key).await?;
        history.messages.push(message);
        self.write(uid, cid, thread_key, history).await?;
        Ok(id)
    }

    pub async fn append_messages_batch(
        &self,
        uid: &str,
        cid: &str,
        thread_key: &str,
        messages: Vec<serde_json::Value>,
    ) -> Result<(), ChatHistoryError> {
        let mut history = self.load_or_new(uid, cid, thread_key).await?;
        history.messages.extend(messages);
        self.write(uid, cid, thread_key, history).await
    }

    pub async fn update_system_prompt(
        &self,
        uid: &str,
        cid: &str,
        thread_key: &str,
        system_prompt: String,
    ) -> Result<(), ChatHistoryError> {
        let mut history = self.load_or_new(uid, cid, thread_key).await?;
        history.system_prompt = Some(system_prompt);
        self.write(uid, cid, thread_key, history).await
    }

    pub async fn clear_messages(
        &self,
        uid: &str,
        cid: &str,
        thread_key: &str,
        keep_system_prompt: bool,
    ) -> Result<(), ChatHistoryError> {
        let mut history = self.load_or_new(uid, cid, thread_key).await?;
        history.messages.clear();
        if !keep_system_prompt {
            history.system_prompt = None;
        }
        self.write(uid, cid, thread_key, history).await
    }

    pub async fn delete(&self, uid: &str, cid: &str, thread_key: &str) -> Result<(), ChatHistoryError> {
        let key = namespace::chat_history_key(uid, cid, thread_key);
        self.kv.delete(&key).await?;
        Ok(())
    }

    pub async fn update_status(
        &self,
        uid: &str,
        cid: &str,
        thread_key: &str,
        status: ChatStatus,
    ) -> Result<(), ChatHistoryError> {
        let mut history = self.load_or_new(uid, cid, thread_key).await?;
        history.status = status;
        self.write(uid, cid, thread_key, history).await
    }

    pub async fn update_metadata(
        &self,
        uid: &str,
        cid: &str,
        thread_key: &str,
        metadata: serde_json::Value,
    ) -> Result<(), ChatHistoryError> {
        let mut history = self.load_or_new(uid, cid, thread_key).await?;
        history.metadata = metadata;
        self.write(uid, cid, thread_key, history).await
    }

    pub async fn get_message_count(
        &self,
        uid: &str,
        cid: &str,
        thread_key: &str,
    ) -> Result<usize, ChatHistoryError> {
        Ok(self.load(uid, cid, thread_key).await?.map(|h| h.message_count).unwrap_or(0))
    }

    pub async fn chat_exists(&self, uid: &str, cid: &str, thread_key: &str) -> Result<bool, ChatHistoryError> {
        let key = namespace::chat_history_key(uid, cid, thread_key);
        Ok(self.kv.exists(&key).await?)
    }

    pub async fn extend_ttl(&self, uid: &str, cid: &str, thread_key: &str) -> Result<bool, ChatHistoryError> {
        let key = namespace::chat_history_key(uid, cid, thread_key);
        Ok(self.kv.expire(&key, CHAT_HISTORY_TTL).await?)
    }

    /// Lists thread keys with stored history for `(uid, cid)`, via SCAN.
    pub async fn list_user_chats(&self, uid: &str, cid: &str) -> Result<Vec<String>, ChatHistoryError> {
        let pattern = namespace::chat_scan_pattern(uid, cid);
        let keys = scan_all(self.kv.as_ref(), &pattern).await?;
        let prefix = format!("chat:{uid}:{cid}:");
        Ok(keys
            .into_iter()
            .filter_map(|k| {
                k.strip_prefix(&prefix)
                    .and_then(|rest| rest.strip_suffix(":history"))
                    .map(|t| t.to_string())
            })
            .collect())
    }

    pub async fn get_chat_stats(&self, uid: &str, cid: &str) -> Result<ChatStats, ChatHistoryError> {
        let threads = self.list_user_chats(uid, cid).await?;
        let mut total_messages = 0usize;
        let mut active_chats = 0usize;
        let mut by_status: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
        for thread in &threads {
            if let Some(history) = self.load(uid, cid, thread).await? {
                total_messages += history.message_count;
                if history.status == ChatStatus::Active {
                    active_chats += 1;
                }
                let key = match history.status {
                    ChatStatus::Active => "active",
                    ChatStatus::Idle => "idle",
                    ChatStatus::Closed => "closed",
                };
                *by_status.entry(key.to_string()).or_insert(0) += 1;
            }
        }
        Ok(ChatStats {
            total_chats: threads.len(),
            total_messages,
            active_chats,
            chats_by_status: by_status,
        })
    }
}

/// Roughly 4 characters per token, matching the original's estimator.
/// Anthropic-style multi-block `content` arrays (`text`/`tool_result` blocks)
/// are flattened to their text before counting.
pub fn estimate_token_count(messages: &[serde_json::Value]) -> usize {
    let mut chars = 0usize;
    for message in messages {
        chars += content_chars(message.get("content").unwrap_or(&serde_json::Value::Null));
    }
    chars / 4
}

fn content_chars(content: &serde_json::Value) -> usize {
    match content {
        serde_json::Value::String(s) => s.len(),
        serde_json::Value::Array(blocks) => blocks
            .iter()
            .map(|block| match block.get("type").and_then(|t| t.as_str()) {
                Some("text") => block.get("text").and_then(|t| t.as_str()).map(str::len).unwrap_or(0),
                Some("tool_result") => block
                    .get("content")
                    .map(content_chars)
                    .unwrap_or(0),
                _ => 0,
            })
            .sum(),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKv;

    fn store() -> ChatHistoryStore {
        ChatHistoryStore::new(Arc::new(InMemoryKv::new()))
    }

    #[tokio::test]
    async fn append_message_persists_and_increments_version() {
        let store = store();
        store
            .append_message("u1", "c1", "t1", serde_json::json!({"role": "user", "content": "hi"}))
            .await
            .unwrap();
        let history = store.load("u1", "c1", "t1").await.unwrap().unwrap();
        assert_eq!(history.messages.len(), 1);
        assert_eq!(history.message_count, 1);
        assert_eq!(history.version, 1);

        store
            .append_message("u1", "c1", "t1", serde_json::json!({"role": "assistant", "content": "hello"}))
            .await
            .unwrap();
        let history = store.load("u1", "c1", "t1").await.unwrap().unwrap();
        assert_eq!(history.messages.len(), 2);
        assert_eq!(history.version, 2);
    }

    #[tokio::test]
    async fn clear_messages_keeps_system_prompt_when_asked() {
        let store = store();
        store
            .update_system_prompt("u1", "c1", "t1", "be helpful".to_string())
            .await
            .unwrap();
        store
            .append_message("u1", "c1", "t1", serde_json::json!({"role": "user", "content": "hi"}))
            .await
            .unwrap();
        store.clear_messages("u1", "c1", "t1", true).await.unwrap();
        let history = store.load("u1", "c1", "t1").await.unwrap().unwrap();
        assert!(history.messages.is_empty());
        assert_eq!(history.system_prompt.as_deref(), Some("be helpful"));
    }

    #[tokio::test]
    async fn list_user_chats_and_stats() {
        let store = store();
        store.append_message("u1", "c1", "t1", serde_json::json!({"content": "a"})).await.unwrap();
        store.append_message("u1", "c1", "t2", serde_json::json!({"content": "b"})).await.unwrap();
        store.update_status("u1", "c1", "t2", ChatStatus::Closed).await.unwrap();

        let mut threads = store.list_user_chats("u1", "c1").await.unwrap();
        threads.sort();
        assert_eq!(threads, vec!["t1".to_string(), "t2".to_string()]);

        let stats = store.get_chat_stats("u1", "c1").await.unwrap();
        assert_eq!(stats.total_chats, 2);
        assert_eq!(stats.active_chats, 1);
        assert_eq!(stats.chats_by_status.get("closed"), Some(&1));
    }

    #[test]
    fn estimate_token_count_handles_string_and_block_content() {
        let messages = vec![
            serde_json::json!({"content": "12345678"}),
            serde_json::json!({"content": [{"type": "text", "text": "abcdefgh"}]}),
        ];
        assert_eq!(estimate_token_count(&messages), 4);
    }
}
