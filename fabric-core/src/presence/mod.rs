//! Presence registry. Mirrors every write to both the
//! KV store (fast listener-registry reads) and the DocDB (the supervisor's
//! snapshot subscription) so both stay consistent with each other.
//!
//! Failure policy: a single mirror write failing is logged and swallowed --
//! the next heartbeat (every `heartbeat_interval`) retries, and a missing
//! heartbeat naturally causes the listener supervisor to detach.

mod error;

pub use error::PresenceError;

use crate::docdb::DocDbStore;
use crate::kv::KvStore;
use crate::namespace::{self, PRESENCE_TTL};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// DocDB collection the listener supervisor subscribes to for presence
/// snapshots (not named explicitly in the originating design; resolved in DESIGN.md).
pub const PRESENCE_COLLECTION: &str = "presence";

pub fn presence_doc_path(uid: &str) -> String {
    format!("{PRESENCE_COLLECTION}/{uid}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPresence {
    pub user_id: String,
    pub status: PresenceStatus,
    pub heartbeat_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    #[serde(default)]
    pub authorized_companies_ids: Vec<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub backend_route: Option<String>,
}

impl UserPresence {
    pub fn online(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            status: PresenceStatus::Online,
            heartbeat_at: Utc::now(),
            ttl_seconds: PRESENCE_TTL.as_secs(),
            authorized_companies_ids: Vec::new(),
            session_id: None,
            backend_route: None,
        }
    }
}

/// A record is "live" iff `status = online` and the heartbeat hasn't aged past
/// its TTL. Pure function over the doc so both the
/// registry and the listener supervisor agree on one definition.
pub fn is_live(doc: &UserPresence) -> bool {
    if doc.status != PresenceStatus::Online {
        return false;
    }
    let age = Utc::now().signed_duration_since(doc.heartbeat_at);
    age.num_seconds() >= 0 && (age.num_seconds() as u64) <= doc.ttl_seconds
}

pub struct PresenceRegistry {
    kv: Arc<dyn KvStore>,
    docdb: Arc<dyn DocDbStore>,
}

impl PresenceRegistry {
    pub fn new(kv: Arc<dyn KvStore>, docdb: Arc<dyn DocDbStore>) -> Self {
        Self { kv, docdb }
    }

    /// Writes `status=online`, refreshing `heartbeat_at`. Called on WebSocket
    /// accept and then every `heartbeat_interval` while connected.
    pub async fn heartbeat(&self, presence: &UserPresence) {
        self.mirror_write(presence).await;
    }

    /// Writes `status=offline` once, on WebSocket close.
    pub async fn mark_offline(&self, user_id: &str) {
        let presence = UserPresence {
            status: PresenceStatus::Offline,
            ..UserPresence::online(user_id)
        };
        self.mirror_write(&presence).await;
    }

    async fn mirror_write(&self, presence: &UserPresence) {
        let key = namespace::presence_key(&presence.user_id);
        let payload = match serde_json::to_string(presence) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(uid = %presence.user_id, error = %e, "presence serialize failed");
                return;
            }
        };
        if let Err(e) = self.kv.setex(&key, &payload, PRESENCE_TTL).await {
            tracing::warn!(uid = %presence.user_id, error = %e, "presence kv write failed, will retry next heartbeat");
        }
        let doc_path = presence_doc_path(&presence.user_id);
        let doc = match serde_json::to_value(presence) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(uid = %presence.user_id, error = %e, "presence doc serialize failed");
                return;
            }
        };
        if let Err(e) = self.docdb.set(&doc_path, doc, false).await {
            tracing::warn!(uid = %presence.user_id, error = %e, "presence docdb write failed, will retry next heartbeat");
        }
    }

    pub async fn load(&self, user_id: &str) -> Result<Option<UserPresence>, PresenceError> {
        let key = namespace::presence_key(user_id);
        match self.kv.get(&key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn is_user_live(&self, user_id: &str) -> Result<bool, PresenceError> {
        Ok(self.load(user_id).await?.map(|p| is_live(&p)).unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docdb::InMemoryDocDb;
    use crate::kv::InMemoryKv;
    use chrono::Duration as ChronoDuration;

    fn registry() -> PresenceRegistry {
        PresenceRegistry::new(Arc::new(InMemoryKv::new()), Arc::new(InMemoryDocDb::new()))
    }

    #[test]
    fn is_live_true_within_ttl() {
        let presence = UserPresence::online("u1");
        assert!(is_live(&presence));
    }

    #[test]
    fn is_live_false_when_offline() {
        let mut presence = UserPresence::online("u1");
        presence.status = PresenceStatus::Offline;
        assert!(!is_live(&presence));
    }

    #[test]
    fn is_live_false_past_ttl() {
        let mut presence = UserPresence::online("u1");
        presence.heartbeat_at = Utc::now() - ChronoDuration::seconds(200);
        assert!(!is_live(&presence));
    }

    #[tokio::test]
    async fn heartbeat_mirrors_to_both_stores() {
        let registry = registry();
        let presence = UserPresence::online("u1");
        registry.heartbeat(&presence).await;

        assert!(registry.is_user_live("u1").await.unwrap());
        let doc = registry
            .docdb
            .get(&presence_doc_path("u1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc["status"], "online");
    }

    #[tokio::test]
    async fn mark_offline_flips_status() {
        let registry = registry();
        registry.heartbeat(&UserPresence::online("u1")).await;
        registry.mark_offline("u1").await;
        assert!(!registry.is_user_live("u1").await.unwrap());
    }
}
