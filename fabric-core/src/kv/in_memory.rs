//! Single-process [`KvStore`] backed by `dashmap`, used for the in-memory
//! deployment and for tests of every store layered on `KvStore` (session,
//! chat history, workflow state, presence, scheduler locks).
//!
//! `scan` matches the glob subset Redis `SCAN MATCH` supports in this
//! codebase's usage: literal segments separated by `*` wildcards (every key
//! pattern built by [`crate::namespace`] is either a literal prefix followed
//! by `*`, or a literal prefix/suffix with a single `*` standing in for the
//! thread key, e.g. `chat:{uid}:{cid}:*:history`).

use super::{KvError, PubSubMessage, ScanPage};
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

struct ValueEntry {
    value: String,
    expires_at: Option<Instant>,
}

pub struct InMemoryKv {
    values: DashMap<String, ValueEntry>,
    hashes: DashMap<String, DashMap<String, String>>,
    lists: DashMap<String, Vec<String>>,
    subscribers: DashMap<String, Vec<mpsc::Sender<PubSubMessage>>>,
}

/// Matches `key` against a glob `pattern` whose only special character is `*`
/// (matches any run of characters, including none).
fn matches_pattern(pattern: &str, key: &str) -> bool {
    let segments: Vec<&str> = pattern.split('*').collect();
    if segments.len() == 1 {
        return pattern == key;
    }

    let mut rest = key;
    for (i, segment) in segments.iter().enumerate() {
        if i == 0 {
            if !rest.starts_with(segment) {
                return false;
            }
            rest = &rest[segment.len()..];
        } else if i == segments.len() - 1 {
            return rest.ends_with(segment);
        } else {
            match rest.find(segment) {
                Some(pos) => rest = &rest[pos + segment.len()..],
                None => return false,
            }
        }
    }
    true
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self {
            values: DashMap::new(),
            hashes: DashMap::new(),
            lists: DashMap::new(),
            subscribers: DashMap::new(),
        }
    }

    fn is_live(&self, key: &str) -> bool {
        match self.values.get(key) {
            Some(entry) => match entry.expires_at {
                Some(t) => Instant::now() < t,
                None => true,
            },
            None => false,
        }
    }
}

impl Default for InMemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl super::KvStore for InMemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        if !self.is_live(key) {
            self.values.remove(key);
            return Ok(None);
        }
        Ok(self.values.get(key).map(|e| e.value.clone()))
    }

    async fn set_nx(&self, key: &str, value: &str) -> Result<bool, KvError> {
        if self.is_live(key) {
            return Ok(false);
        }
        self.values.insert(
            key.to_string(),
            ValueEntry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(true)
    }

    async fn setex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        self.values.insert(
            key.to_string(),
            ValueEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        Ok(self.values.remove(key).is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        match self.values.get_mut(key) {
            Some(mut entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        Ok(self.is_live(key))
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<ScanPage, KvError> {
        let mut matched: Vec<String> = self
            .values
            .iter()
            .filter(|e| matches_pattern(pattern, e.key()) && self.is_live(e.key()))
            .map(|e| e.key().clone())
            .collect();
        matched.sort();

        let start = cursor as usize;
        let end = (start + count).min(matched.len());
        let page: Vec<String> = matched.get(start..end).unwrap_or_default().to_vec();
        let next_cursor = if end >= matched.len() { 0 } else { end as u64 };

        Ok(ScanPage {
            keys: page,
            cursor: next_cursor,
        })
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError> {
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError> {
        Ok(self
            .hashes
            .get(key)
            .and_then(|h| h.get(field).map(|v| v.clone())))
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, KvError> {
        Ok(self
            .hashes
            .get(key)
            .map(|h| h.remove(field).is_some())
            .unwrap_or(false))
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), KvError> {
        if let Some(mut subs) = self.subscribers.get_mut(channel) {
            let message = PubSubMessage {
                channel: channel.to_string(),
                payload: payload.to_string(),
            };
            subs.retain(|tx| tx.try_send(message.clone()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<PubSubMessage>, KvError> {
        let (tx, rx) = mpsc::channel(64);
        self.subscribers
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<(), KvError> {
        self.lists.entry(key.to_string()).or_default().push(value.to_string());
        Ok(())
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, KvError> {
        let Some(list) = self.lists.get(key) else {
            return Ok(Vec::new());
        };
        let len = list.len() as isize;
        let norm = |i: isize| -> isize {
            if i < 0 {
                (len + i).max(0)
            } else {
                i.min(len)
            }
        };
        let start = norm(start);
        let stop = (norm(stop) + 1).min(len);
        if start >= stop {
            return Ok(Vec::new());
        }
        Ok(list[start as usize..stop as usize].to_vec())
    }

    async fn llen(&self, key: &str) -> Result<usize, KvError> {
        Ok(self.lists.get(key).map(|l| l.len()).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::super::KvStore;
    use super::*;

    #[tokio::test]
    async fn setex_then_get_roundtrips() {
        let kv = InMemoryKv::new();
        kv.setex("k", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn expired_key_is_absent() {
        let kv = InMemoryKv::new();
        kv.setex("k", "v", Duration::from_millis(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
        assert!(!kv.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn set_nx_fails_when_key_already_live() {
        let kv = InMemoryKv::new();
        assert!(kv.set_nx("lock:1", "a").await.unwrap());
        assert!(!kv.set_nx("lock:1", "b").await.unwrap());
    }

    #[tokio::test]
    async fn hash_set_get_del() {
        let kv = InMemoryKv::new();
        kv.hset("h", "f", "v").await.unwrap();
        assert_eq!(kv.hget("h", "f").await.unwrap(), Some("v".to_string()));
        assert!(kv.hdel("h", "f").await.unwrap());
        assert_eq!(kv.hget("h", "f").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_push_range_len() {
        let kv = InMemoryKv::new();
        for v in ["a", "b", "c"] {
            kv.rpush("l", v).await.unwrap();
        }
        assert_eq!(kv.llen("l").await.unwrap(), 3);
        assert_eq!(kv.lrange("l", 0, -1).await.unwrap(), vec!["a", "b", "c"]);
        assert_eq!(kv.lrange("l", -2, -1).await.unwrap(), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn publish_delivers_to_subscriber() {
        let kv = InMemoryKv::new();
        let mut rx = kv.subscribe("chan").await.unwrap();
        kv.publish("chan", "hello").await.unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.payload, "hello");
        assert_eq!(msg.channel, "chan");
    }

    #[tokio::test]
    async fn scan_matches_trailing_star_prefix() {
        let kv = InMemoryKv::new();
        kv.setex("user:1:a", "x", Duration::from_secs(60)).await.unwrap();
        kv.setex("user:1:b", "x", Duration::from_secs(60)).await.unwrap();
        kv.setex("user:2:a", "x", Duration::from_secs(60)).await.unwrap();
        let page = kv.scan(0, "user:1:*", 100).await.unwrap();
        assert_eq!(page.keys.len(), 2);
        assert_eq!(page.cursor, 0);
    }

    #[tokio::test]
    async fn scan_matches_middle_wildcard() {
        let kv = InMemoryKv::new();
        kv.setex("chat:u1:c1:t1:history", "x", Duration::from_secs(60))
            .await
            .unwrap();
        kv.setex("chat:u1:c1:t2:history", "x", Duration::from_secs(60))
            .await
            .unwrap();
        kv.setex("chat:u1:c2:t1:history", "x", Duration::from_secs(60))
            .await
            .unwrap();
        let page = kv.scan(0, "chat:u1:c1:*:history", 100).await.unwrap();
        assert_eq!(page.keys.len(), 2);
    }
}
