use super::{RtdbError, RtdbEvent, RtdbEventType, RtdbListenerHandle, RtdbStore};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct RtdbSubscriptionGuard {
    root: String,
    id: u64,
    subscribers: Arc<DashMap<String, Vec<(u64, mpsc::Sender<RtdbEvent>)>>>,
}

impl Drop for RtdbSubscriptionGuard {
    fn drop(&mut self) {
        if let Some(mut list) = self.subscribers.get_mut(&self.root) {
            list.retain(|(id, _)| *id != self.id);
        }
    }
}

/// In-process tree keyed by full path. Stands in for the real RTDB-style
/// backend.
pub struct InMemoryRtdb {
    nodes: DashMap<String, Value>,
    subscribers: Arc<DashMap<String, Vec<(u64, mpsc::Sender<RtdbEvent>)>>>,
    next_sub_id: std::sync::atomic::AtomicU64,
}

impl InMemoryRtdb {
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
            subscribers: Arc::new(DashMap::new()),
            next_sub_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    fn notify(&self, path: &str, event_type: RtdbEventType, data: &Value) {
        for entry in self.subscribers.iter() {
            let root = entry.key();
            let relative = if path == root {
                "/".to_string()
            } else if let Some(rest) = path.strip_prefix(&format!("{root}/")) {
                format!("/{rest}")
            } else {
                continue;
            };
            for (_, tx) in entry.value() {
                let _ = tx.try_send(RtdbEvent {
                    event_type,
                    path: relative.clone(),
                    data: data.clone(),
                });
            }
        }
    }
}

impl Default for InMemoryRtdb {
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
impl RtdbStore for InMemoryRtdb {
    async fn get(&self, path: &str) -> Result<Option<Value>, RtdbError> {
        Ok(self.nodes.get(path).map(|d| d.clone()))
    }

    async fn put(&self, path: &str, data: Value) -> Result<(), RtdbError> {
        self.nodes.insert(path.to_string(), data.clone());
        self.notify(path, RtdbEventType::Put, &data);
        Ok(())
    }

    async fn patch(&self, path: &str, data: Value) -> Result<(), RtdbError> {
        let mut entry = self.nodes.entry(path.to_string()).or_insert(Value::Object(Default::default()));
        merge_json(&mut entry, data.clone());
        self.notify(path, RtdbEventType::Patch, &data);
        Ok(())
    }

    fn listen(&self, path: &str) -> RtdbListenerHandle {
        let (tx, rx) = mpsc::channel(128);
        let id = self.next_sub_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.subscribers.entry(path.to_string()).or_default().push((id, tx));
        RtdbListenerHandle {
            events: rx,
            _guard: RtdbSubscriptionGuard {
                root: path.to_string(),
                id,
                subscribers: self.subscribers.clone(),
            },
        }
    }
}
