//! ListenerRecord registry: `registry:listeners:{uid}:{type}[:{space}:{thread}]`,
//! TTL 90s. The supervisor registers one of these per attached watcher so that
//! an external observer can confirm attachment
//! without reaching into the supervisor's in-process maps.

use super::ListenerError;
use crate::kv::KvStore;
use crate::namespace::{self, LISTENER_RECORD_TTL};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerType {
    Notif,
    Msg,
    Chat,
    Workflow,
}

impl ListenerType {
    fn as_str(&self) -> &'static str {
        match self {
            ListenerType::Notif => "notif",
            ListenerType::Msg => "msg",
            ListenerType::Chat => "chat",
            ListenerType::Workflow => "workflow",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerRecord {
    pub created_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub channel_name: String,
    pub ttl_seconds: u64,
}

pub struct ListenerRecordRegistry {
    kv: Arc<dyn KvStore>,
}

impl ListenerRecordRegistry {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub async fn register(
        &self,
        uid: &str,
        listener_type: ListenerType,
        space_and_thread: Option<(&str, &str)>,
        channel_name: &str,
    ) -> Result<(), ListenerError> {
        let key = namespace::listener_record_key(uid, listener_type.as_str(), space_and_thread);
        let now = Utc::now();
        let record = ListenerRecord {
            created_at: now,
            last_heartbeat: now,
            channel_name: channel_name.to_string(),
            ttl_seconds: LISTENER_RECORD_TTL.as_secs(),
        };
        let payload = serde_json::to_string(&record)?;
        self.kv.setex(&key, &payload, LISTENER_RECORD_TTL).await?;
        Ok(())
    }

    pub async fn deregister(
        &self,
        uid: &str,
        listener_type: ListenerType,
        space_and_thread: Option<(&str, &str)>,
    ) -> Result<(), ListenerError> {
        let key = namespace::listener_record_key(uid, listener_type.as_str(), space_and_thread);
        self.kv.delete(&key).await?;
        Ok(())
    }

    pub async fn is_registered(
        &self,
        uid: &str,
        listener_type: ListenerType,
        space_and_thread: Option<(&str, &str)>,
    ) -> Result<bool, ListenerError> {
        let key = namespace::listener_record_key(uid, listener_type.as_str(), space_and_thread);
        Ok(self.kv.exists(&key).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKv;

    #[tokio::test]
    async fn register_then_is_registered() {
        let registry = ListenerRecordRegistry::new(Arc::new(InMemoryKv::new()));
        registry.register("u1", ListenerType::Notif, None, "user:u1").await.unwrap();
        assert!(registry.is_registered("u1", ListenerType::Notif, None).await.unwrap());
        registry.deregister("u1", ListenerType::Notif, None).await.unwrap();
        assert!(!registry.is_registered("u1", ListenerType::Notif, None).await.unwrap());
    }

    #[tokio::test]
    async fn chat_record_keys_by_space_and_thread() {
        let registry = ListenerRecordRegistry::new(Arc::new(InMemoryKv::new()));
        registry
            .register("u1", ListenerType::Chat, Some(("s1", "t1")), "chat:u1:s1:t1")
            .await
            .unwrap();
        assert!(registry
            .is_registered("u1", ListenerType::Chat, Some(("s1", "t1")))
            .await
            .unwrap());
        assert!(!registry
            .is_registered("u1", ListenerType::Chat, Some(("s1", "t2")))
            .await
            .unwrap());
    }
}
