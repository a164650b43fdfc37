//! Document database client: collections/subcollections, merge writes,
//! recursive delete, queries, and on-snapshot change subscriptions.
//!
//! No real Firestore-style wire client is in scope for this fabric --
//! the real collaborator lives outside the fabric and is reached through this
//! trait. [`InMemoryDocDb`] is the test double used by the listener supervisor
//! and agent runtime tests.

mod error;
mod in_memory;

pub use error::DocDbError;
pub use in_memory::InMemoryDocDb;

use async_trait::async_trait;
use serde_json::Value;

/// A single `field {op} value` predicate, as passed to [`DocDbStore::query`].
#[derive(Debug, Clone)]
pub struct QueryFilter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
}

impl QueryFilter {
    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Eq,
            value,
        }
    }

    pub fn ne(field: impl Into<String>, value: Value) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Ne,
            value,
        }
    }

    fn matches(&self, doc: &Value) -> bool {
        let field_value = doc.get(&self.field).cloned().unwrap_or(Value::Null);
        match self.op {
            FilterOp::Eq => field_value == self.value,
            FilterOp::Ne => field_value != self.value,
        }
    }
}

/// A live subscription to a collection or single document. Dropping or calling
/// [`SnapshotHandle::close`] detaches the watcher; detaching must be safe from
/// any thread, so it is just a channel close, not a blocking call.
pub struct SnapshotHandle {
    _guard: in_memory::SubscriptionGuard,
    pub changes: tokio::sync::mpsc::Receiver<()>,
}

impl SnapshotHandle {
    pub fn close(self) {
        drop(self);
    }
}

#[async_trait]
pub trait DocDbStore: Send + Sync {
    async fn get(&self, doc_path: &str) -> Result<Option<Value>, DocDbError>;

    /// `merge=true` shallow-merges `data` into the existing document (if any);
    /// `merge=false` overwrites it entirely.
    async fn set(&self, doc_path: &str, data: Value, merge: bool) -> Result<(), DocDbError>;

    /// Adds a new document under `collection_path` with a generated id, returning it.
    async fn add(&self, collection_path: &str, data: Value) -> Result<String, DocDbError>;

    async fn delete(&self, doc_path: &str) -> Result<(), DocDbError>;

    /// Deletes `doc_path` and, best-effort, every document under the named
    /// `subcollections` rooted at it. This is not transactional: each
    /// step's success/failure is independent and only the final document
    /// delete is treated as critical.
    async fn delete_recursive(&self, doc_path: &str, subcollections: &[&str]) -> Result<(), DocDbError>;

    async fn query(
        &self,
        collection_path: &str,
        filters: &[QueryFilter],
        order_by: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<(String, Value)>, DocDbError>;

    /// Subscribes to changes under `target` (a collection or document path).
    /// The returned handle's `changes` channel ticks on every write anywhere
    /// under `target`; callers re-`query`/`get` to obtain the new snapshot,
    /// matching the "callback only enqueues, never reenters with a nested
    /// write" contract every subscriber must honor.
    fn on_snapshot(&self, target: &str) -> SnapshotHandle;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let db = InMemoryDocDb::new();
        db.set("clients/u1/notifications/n1", serde_json::json!({"read": false}), false)
            .await
            .unwrap();
        let doc = db.get("clients/u1/notifications/n1").await.unwrap().unwrap();
        assert_eq!(doc["read"], false);
    }

    #[tokio::test]
    async fn merge_preserves_untouched_fields() {
        let db = InMemoryDocDb::new();
        db.set("d/1", serde_json::json!({"a": 1, "b": 2}), false).await.unwrap();
        db.set("d/1", serde_json::json!({"b": 3}), true).await.unwrap();
        let doc = db.get("d/1").await.unwrap().unwrap();
        assert_eq!(doc["a"], 1);
        assert_eq!(doc["b"], 3);
    }

    #[tokio::test]
    async fn query_filters_by_equality() {
        let db = InMemoryDocDb::new();
        db.set("clients/u1/notifications/n1", serde_json::json!({"read": false}), false).await.unwrap();
        db.set("clients/u1/notifications/n2", serde_json::json!({"read": true}), false).await.unwrap();
        let unread = db
            .query(
                "clients/u1/notifications",
                &[QueryFilter::eq("read", serde_json::json!(false))],
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].0, "clients/u1/notifications/n1");
    }

    #[tokio::test]
    async fn on_snapshot_ticks_on_write_under_target() {
        let db = InMemoryDocDb::new();
        let mut handle = db.on_snapshot("clients/u1/notifications");
        db.set("clients/u1/notifications/n1", serde_json::json!({"read": false}), false)
            .await
            .unwrap();
        tokio::time::timeout(std::time::Duration::from_millis(100), handle.changes.recv())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn delete_recursive_removes_doc_and_subcollections() {
        let db = InMemoryDocDb::new();
        db.set("mandates/m1", serde_json::json!({}), false).await.unwrap();
        db.set("mandates/m1/tasks/t1", serde_json::json!({}), false).await.unwrap();
        db.delete_recursive("mandates/m1", &["tasks"]).await.unwrap();
        assert!(db.get("mandates/m1").await.unwrap().is_none());
        assert!(db.get("mandates/m1/tasks/t1").await.unwrap().is_none());
    }
}
