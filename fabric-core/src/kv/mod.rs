//! All contact with the in-memory key/value store lives behind [`KvStore`].
//!
//! Connection parameters (host, port, password, TLS, DB index) are resolved
//! once at startup into [`fabric_config::KvSettings`] and handed to whatever
//! concrete implementation is built from them; callers never see a raw
//! connection. `setex` is used for every TTL-bearing key; raw `set` is only
//! for locks that need `NX` semantics. `scan` is always cursor-based with a
//! batch size of 100 — `keys` is never exposed, so a caller cannot accidentally
//! block the store on a large keyspace.

mod error;
mod in_memory;

pub use error::KvError;
pub use in_memory::InMemoryKv;

use async_trait::async_trait;
use std::time::Duration;

/// Default batch size for `scan` cursor iteration.
pub const SCAN_BATCH_SIZE: usize = 100;

/// Result of one `scan` cursor step: matched keys plus the next cursor.
/// `cursor == 0` signals iteration is complete (mirrors Redis SCAN semantics).
#[derive(Debug, Clone)]
pub struct ScanPage {
    pub keys: Vec<String>,
    pub cursor: u64,
}

/// A single message delivered to a subscriber of [`KvStore::subscribe`].
#[derive(Debug, Clone)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: String,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Sets a key with no expiry. Used only for `NX`-style locks; every other
    /// write goes through [`KvStore::setex`].
    async fn set_nx(&self, key: &str, value: &str) -> Result<bool, KvError>;

    /// Sets a key with an expiry, overwriting any existing value.
    async fn setex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError>;

    async fn delete(&self, key: &str) -> Result<bool, KvError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError>;

    async fn exists(&self, key: &str) -> Result<bool, KvError>;

    /// One cursor step of a `SCAN pattern` walk. `cursor == 0` starts a new scan.
    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<ScanPage, KvError>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError>;
    async fn hdel(&self, key: &str, field: &str) -> Result<bool, KvError>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), KvError>;
    async fn subscribe(&self, channel: &str) -> Result<tokio::sync::mpsc::Receiver<PubSubMessage>, KvError>;

    async fn rpush(&self, key: &str, value: &str) -> Result<(), KvError>;
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, KvError>;
    async fn llen(&self, key: &str) -> Result<usize, KvError>;
}

/// Exhaustively walks `scan` until `cursor` returns to 0, collecting all matched keys.
/// Every caller that needs "all keys matching a prefix" (session/chat listing,
/// cache invalidation) goes through this helper rather than re-implementing the loop.
pub async fn scan_all(store: &dyn KvStore, pattern: &str) -> Result<Vec<String>, KvError> {
    let mut cursor = 0u64;
    let mut keys = Vec::new();
    loop {
        let page = store.scan(cursor, pattern, SCAN_BATCH_SIZE).await?;
        keys.extend(page.keys);
        cursor = page.cursor;
        if cursor == 0 {
            break;
        }
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scan_all_collects_across_pages() {
        let kv = InMemoryKv::new();
        for i in 0..250 {
            kv.setex(&format!("user:1:{i}"), "x", Duration::from_secs(60))
                .await
                .unwrap();
        }
        let keys = scan_all(&kv, "user:1:*").await.unwrap();
        assert_eq!(keys.len(), 250);
    }
}
