//! Unified business cache manager, distinct from any response cache the
//! agent runtime keeps for LLM calls. Every entry lives under the canonical
//! `cache:{uid}:{cid}:{data_type}[:{sub}]` layout and is wrapped in a
//! `{data, cached_at, ttl_seconds, source}` envelope so callers can report
//! `dataFreshness`/`cachedAt` in a page handler's `meta` block.

mod error;

pub use error::CacheError;

use crate::kv::{self, KvStore};
use crate::namespace;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Keys are deleted in batches no larger than this during
/// `invalidate_module_cache`.
const MAX_BATCH_DELETE: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEnvelope {
    data: serde_json::Value,
    cached_at: DateTime<Utc>,
    ttl_seconds: u64,
    source: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CachedData {
    pub data: serde_json::Value,
    pub cached_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    pub source: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub total_keys: usize,
    pub by_type: HashMap<String, usize>,
}

pub struct CacheManager {
    kv: Arc<dyn KvStore>,
}

impl CacheManager {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Returns `None` on a genuine miss, on an expired/absent key, or when the
    /// cached payload is an empty JSON array.
    pub async fn get_cached_data(
        &self,
        uid: &str,
        company_id: &str,
        data_type: &str,
        sub_type: Option<&str>,
    ) -> Result<Option<CachedData>, CacheError> {
        let key = namespace::business_cache_key(uid, company_id, data_type, sub_type);
        let Some(raw) = self.kv.get(&key).await? else {
            return Ok(None);
        };
        let envelope: CacheEnvelope = serde_json::from_str(&raw)?;
        if matches!(&envelope.data, serde_json::Value::Array(items) if items.is_empty()) {
            self.kv.delete(&key).await?;
            return Ok(None);
        }
        Ok(Some(CachedData {
            data: envelope.data,
            cached_at: envelope.cached_at,
            ttl_seconds: envelope.ttl_seconds,
            source: envelope.source,
        }))
    }

    pub async fn set_cached_data(
        &self,
        uid: &str,
        company_id: &str,
        data_type: &str,
        sub_type: Option<&str>,
        data: serde_json::Value,
        ttl_seconds: u64,
        source: &str,
    ) -> Result<(), CacheError> {
        let key = namespace::business_cache_key(uid, company_id, data_type, sub_type);
        let envelope = CacheEnvelope {
            data,
            cached_at: Utc::now(),
            ttl_seconds,
            source: source.to_string(),
        };
        let payload = serde_json::to_string(&envelope)?;
        self.kv
            .setex(&key, &payload, Duration::from_secs(ttl_seconds))
            .await?;
        Ok(())
    }

    pub async fn invalidate_cache(
        &self,
        uid: &str,
        company_id: &str,
        data_type: &str,
        sub_type: Option<&str>,
    ) -> Result<bool, CacheError> {
        let key = namespace::business_cache_key(uid, company_id, data_type, sub_type);
        Ok(self.kv.delete(&key).await?)
    }

    /// Deletes every key (any `sub_type`) for one `data_type`, in batches of
    /// at most [`MAX_BATCH_DELETE`]. Returns the number of keys removed.
    pub async fn invalidate_module_cache(
        &self,
        uid: &str,
        company_id: &str,
        data_type: &str,
    ) -> Result<usize, CacheError> {
        let pattern = namespace::business_cache_scan_pattern(uid, company_id, data_type);
        let keys = kv::scan_all(self.kv.as_ref(), &pattern).await?;
        let mut deleted = 0usize;
        for batch in keys.chunks(MAX_BATCH_DELETE) {
            for key in batch {
                if self.kv.delete(key).await? {
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }

    /// Counts live keys, optionally restricted to one `data_type`; `by_type`
    /// breaks the total down by the `{data_type}` segment of each key.
    pub async fn get_cache_stats(
        &self,
        uid: &str,
        company_id: &str,
        data_type: Option<&str>,
    ) -> Result<CacheStats, CacheError> {
        let pattern = match data_type {
            Some(t) => namespace::business_cache_scan_pattern(uid, company_id, t),
            None => namespace::business_cache_all_pattern(uid, company_id),
        };
        let keys = kv::scan_all(self.kv.as_ref(), &pattern).await?;
        let prefix = format!("cache:{uid}:{company_id}:");
        let mut by_type: HashMap<String, usize> = HashMap::new();
        for key in &keys {
            if let Some(rest) = key.strip_prefix(&prefix) {
                let segment = rest.split(':').next().unwrap_or(rest);
                *by_type.entry(segment.to_string()).or_insert(0) += 1;
            }
        }
        Ok(CacheStats {
            total_keys: keys.len(),
            by_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKv;

    fn manager() -> CacheManager {
        CacheManager::new(Arc::new(InMemoryKv::new()))
    }

    #[tokio::test]
    async fn set_then_get_roundtrips_with_envelope_metadata() {
        let mgr = manager();
        mgr.set_cached_data(
            "u1",
            "c1",
            "coa",
            None,
            serde_json::json!({"accounts": ["1000"]}),
            3600,
            "erp_sync",
        )
        .await
        .unwrap();

        let cached = mgr.get_cached_data("u1", "c1", "coa", None).await.unwrap().unwrap();
        assert_eq!(cached.source, "erp_sync");
        assert_eq!(cached.ttl_seconds, 3600);
        assert_eq!(cached.data["accounts"][0], "1000");
    }

    #[tokio::test]
    async fn empty_list_payload_is_treated_as_miss_and_evicted() {
        let mgr = manager();
        mgr.set_cached_data("u1", "c1", "invoices", None, serde_json::json!([]), 1800, "dms")
            .await
            .unwrap();

        let cached = mgr.get_cached_data("u1", "c1", "invoices", None).await.unwrap();
        assert!(cached.is_none());
        assert!(!mgr.invalidate_cache("u1", "c1", "invoices", None).await.unwrap());
    }

    #[tokio::test]
    async fn sub_type_keys_are_independent() {
        let mgr = manager();
        mgr.set_cached_data("u1", "c1", "coa", Some("assets"), serde_json::json!(["a"]), 3600, "x")
            .await
            .unwrap();
        mgr.set_cached_data(
            "u1",
            "c1",
            "coa",
            Some("liabilities"),
            serde_json::json!(["l"]),
            3600,
            "x",
        )
        .await
        .unwrap();

        assert!(mgr.get_cached_data("u1", "c1", "coa", Some("assets")).await.unwrap().is_some());
        mgr.invalidate_cache("u1", "c1", "coa", Some("assets")).await.unwrap();
        assert!(mgr.get_cached_data("u1", "c1", "coa", Some("assets")).await.unwrap().is_none());
        assert!(mgr
            .get_cached_data("u1", "c1", "coa", Some("liabilities"))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn invalidate_module_cache_clears_every_sub_type() {
        let mgr = manager();
        for sub in ["assets", "liabilities", "equity"] {
            mgr.set_cached_data("u1", "c1", "coa", Some(sub), serde_json::json!(["x"]), 3600, "x")
                .await
                .unwrap();
        }
        let deleted = mgr.invalidate_module_cache("u1", "c1", "coa").await.unwrap();
        assert_eq!(deleted, 3);
        assert!(mgr.get_cached_data("u1", "c1", "coa", Some("assets")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cache_stats_breaks_down_by_data_type() {
        let mgr = manager();
        mgr.set_cached_data("u1", "c1", "coa", Some("assets"), serde_json::json!(["a"]), 3600, "x")
            .await
            .unwrap();
        mgr.set_cached_data("u1", "c1", "invoices", None, serde_json::json!(["i"]), 1800, "x")
            .await
            .unwrap();

        let stats = mgr.get_cache_stats("u1", "c1", None).await.unwrap();
        assert_eq!(stats.total_keys, 2);
        assert_eq!(stats.by_type.get("coa"), Some(&1));
        assert_eq!(stats.by_type.get("invoices"), Some(&1));

        let scoped = mgr.get_cache_stats("u1", "c1", Some("coa")).await.unwrap();
        assert_eq!(scoped.total_keys, 1);
    }
}
