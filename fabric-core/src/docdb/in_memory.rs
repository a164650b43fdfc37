use super::{DocDbError, DocDbStore, QueryFilter, SnapshotHandle};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Dropping this removes the watcher's sender from the subscriber table, so a
/// detach never requires the store to notice a closed channel on the next write.
pub struct SubscriptionGuard {
    target: String,
    id: u64,
    subscribers: Arc<DashMap<String, Vec<(u64, mpsc::Sender<()>)>>>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(mut list) = self.subscribers.get_mut(&self.target) {
            list.retain(|(id, _)| *id != self.id);
        }
    }
}

/// In-process document store keyed by full path (`"collection/doc/subcollection/doc"`).
/// Stands in for the real Firestore-style backend.
pub struct InMemoryDocDb {
    docs: DashMap<String, Value>,
    subscribers: Arc<DashMap<String, Vec<(u64, mpsc::Sender<()>)>>>,
    next_sub_id: std::sync::atomic::AtomicU64,
}

impl InMemoryDocDb {
    pub fn new() -> Self {
        Self {
            docs: DashMap::new(),
            subscribers: Arc::new(DashMap::new()),
            next_sub_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    fn notify(&self, path: &str) {
        for entry in self.subscribers.iter() {
            let target = entry.key();
            if path == target || path.starts_with(&format!("{target}/")) {
                for (_, tx) in entry.value() {
                    let _ = tx.try_send(());
                }
            }
        }
    }
}

impl Default for InMemoryDocDb {
    fn default() -> Self {
        Self::new()
    }
}

fn merge_json(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (k, v) in patch_map {
                merge_json(base_map.entry(k).or_insert(Value::Null), v);
            }
        }
        (base_slot, patch_value) => *base_slot = patch_value,
    }
}

#[async_trait]
impl DocDbStore for InMemoryDocDb {
    async fn get(&self, doc_path: &str) -> Result<Option<Value>, DocDbError> {
        Ok(self.docs.get(doc_path).map(|d| d.clone()))
    }

    async fn set(&self, doc_path: &str, data: Value, merge: bool) -> Result<(), DocDbError> {
        if merge {
            let mut entry = self.docs.entry(doc_path.to_string()).or_insert(Value::Object(Default::default()));
            merge_json(&mut entry, data);
        } else {
            self.docs.insert(doc_path.to_string(), data);
        }
        self.notify(doc_path);
        Ok(())
    }

    async fn add(&self, collection_path: &str, data: Value) -> Result<String, DocDbError> {
        let id = Uuid::new_v4().to_string();
        let path = format!("{collection_path}/{id}");
        self.docs.insert(path.clone(), data);
        self.notify(&path);
        Ok(id)
    }

    async fn delete(&self, doc_path: &str) -> Result<(), DocDbError> {
        self.docs.remove(doc_path);
        self.notify(doc_path);
        Ok(())
    }

    async fn delete_recursive(&self, doc_path: &str, subcollections: &[&str]) -> Result<(), DocDbError> {
        for sub in subcollections {
            let prefix = format!("{doc_path}/{sub}/");
            let matching: Vec<String> = self
                .docs
                .iter()
                .map(|e| e.key().clone())
                .filter(|k| k.starts_with(&prefix))
                .collect();
            for key in matching {
                self.docs.remove(&key);
            }
        }
        self.docs.remove(doc_path);
        self.notify(doc_path);
        Ok(())
    }

    async fn query(
        &self,
        collection_path: &str,
        filters: &[QueryFilter],
        order_by: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<(String, Value)>, DocDbError> {
        let prefix = format!("{collection_path}/");
        let mut matching: Vec<(String, Value)> = self
            .docs
            .iter()
            .filter(|e| {
                e.key().starts_with(&prefix) && !e.key()[prefix.len()..].contains('/')
            })
            .filter(|e| filters.iter().all(|f| f.matches(e.value())))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        if let Some(field) = order_by {
            matching.sort_by(|a, b| {
                let av = a.1.get(field).and_then(|v| v.as_str()).unwrap_or("");
                let bv = b.1.get(field).and_then(|v| v.as_str()).unwrap_or("");
                bv.cmp(av)
            });
        }
        if let Some(limit) = limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }

    fn on_snapshot(&self, target: &str) -> SnapshotHandle {
        let (tx, rx) = mpsc::channel(64);
        let id = self.next_sub_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.subscribers.entry(target.to_string()).or_default().push((id, tx));
        SnapshotHandle {
            _guard: SubscriptionGuard {
                target: target.to_string(),
                id,
                subscribers: self.subscribers.clone(),
            },
            changes: rx,
        }
    }
}
