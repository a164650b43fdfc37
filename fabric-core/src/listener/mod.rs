//! Listener supervisor: attaches/detaches per-user DocDB and RTDB
//! watchers on presence changes, multiplexes their events into the publication
//! rules below, and runs on-demand chat/workflow/transaction watchers.
//!
//! Publication rules:
//! - `workflow.*` events: WebSocket only, no KV publish.
//! - `chat.*` events: always published on `chat:{uid}:{space}:{thread}`; the
//!   WebSocket broadcast is additionally gated on
//!   `SessionStore::is_user_on_thread` (BACKEND mode skips the socket).
//! - everything else: published on `user:{uid}` AND broadcast to WebSocket.

mod error;
mod records;

pub use error::ListenerError;
pub use records::{ListenerRecord, ListenerRecordRegistry, ListenerType};

use crate::docdb::{DocDbStore, QueryFilter};
use crate::namespace;
use crate::presence;
use crate::rtdb::{RtdbEventType, RtdbStore};
use crate::session::SessionStore;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Delivers a formatted event to every WebSocket attached to `uid`. Implemented
/// by `fabric-serve`'s hub; kept as a trait so the supervisor (fabric-core)
/// never depends on axum.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn broadcast_to_user(&self, uid: &str, event: Value);
}

/// Routes a chat message carrying an `action` field to the agent runtime's
/// card-response entry point instead of broadcasting it as a normal message.
#[async_trait]
pub trait CardActionSink: Send + Sync {
    async fn send_card_response(&self, uid: &str, space_code: &str, thread_key: &str, message: Value);
}

/// 5s grace window before a detach actually tears down watchers.
pub const DETACH_GRACE_WINDOW: Duration = Duration::from_secs(5);

struct UserWatcherSet {
    _notif_task: JoinHandle<()>,
    _msg_task: JoinHandle<()>,
}

struct ChatWatcherState {
    _task: JoinHandle<()>,
}

struct WorkflowWatcherState {
    _task: JoinHandle<()>,
}

struct TransactionWatcherState {
    _task: JoinHandle<()>,
}

/// `(uid, job_id) -> last-seen substructure`, diffed on every workflow event
/// so only changed fields are published.
type WorkflowCache = Arc<DashMap<(String, String), (Value, Value)>>;

pub struct ListenerSupervisor {
    kv: Arc<dyn crate::kv::KvStore>,
    docdb: Arc<dyn DocDbStore>,
    rtdb: Arc<dyn RtdbStore>,
    sessions: Arc<SessionStore>,
    sink: Arc<dyn EventSink>,
    cards: Arc<dyn CardActionSink>,
    records: ListenerRecordRegistry,
    user_watchers: Arc<DashMap<String, UserWatcherSet>>,
    chat_watchers: Arc<DashMap<(String, String), ChatWatcherState>>,
    workflow_watchers: Arc<DashMap<(String, String), WorkflowWatcherState>>,
    transaction_watchers: Arc<DashMap<String, TransactionWatcherState>>,
    workflow_cache: WorkflowCache,
    pending_detach: Arc<DashMap<String, CancellationToken>>,
    grace_window: Duration,
}

impl ListenerSupervisor {
    pub fn new(
        kv: Arc<dyn crate::kv::KvStore>,
        docdb: Arc<dyn DocDbStore>,
        rtdb: Arc<dyn RtdbStore>,
        sessions: Arc<SessionStore>,
        sink: Arc<dyn EventSink>,
        cards: Arc<dyn CardActionSink>,
    ) -> Self {
        Self {
            records: ListenerRecordRegistry::new(kv.clone()),
            kv,
            docdb,
            rtdb,
            sessions,
            sink,
            cards,
            user_watchers: Arc::new(DashMap::new()),
            chat_watchers: Arc::new(DashMap::new()),
            workflow_watchers: Arc::new(DashMap::new()),
            transaction_watchers: Arc::new(DashMap::new()),
            workflow_cache: Arc::new(DashMap::new()),
            pending_detach: Arc::new(DashMap::new()),
            grace_window: DETACH_GRACE_WINDOW,
        }
    }

    #[cfg(test)]
    pub fn with_grace_window(mut self, grace: Duration) -> Self {
        self.grace_window = grace;
        self
    }

    /// Number of users with attached general-purpose watchers; surfaced on `/healthz`.
    pub fn attached_user_count(&self) -> usize {
        self.user_watchers.len()
    }

    pub fn workflow_watcher_count(&self) -> usize {
        self.workflow_watchers.len()
    }

    pub fn is_user_attached(&self, uid: &str) -> bool {
        self.user_watchers.contains_key(uid)
    }

    pub fn is_chat_attached(&self, uid: &str, thread_key: &str) -> bool {
        self.chat_watchers.contains_key(&(uid.to_string(), thread_key.to_string()))
    }

    /// algorithm entry point: called whenever a presence doc is observed
    /// to change (the caller -- typically a DocDB `on_snapshot` consumer loop
    /// in fabric-serve -- resolves `live` via `presence::is_live`).
    pub async fn on_presence_changed(&self, uid: &str, live: bool) {
        if live {
            if let Some((_, token)) = self.pending_detach.remove(uid) {
                token.cancel();
            }
            if !self.user_watchers.contains_key(uid) {
                self.ensure_user_watchers(uid).await;
            }
        } else {
            self.schedule_detach(uid.to_string(), "presence_expired");
        }
    }

    async fn ensure_user_watchers(&self, uid: &str) {
        let notif_target = format!("clients/{uid}/notifications");
        let mut notif_handle = self.docdb.on_snapshot(&notif_target);
        let notif_channel = namespace::user_channel(uid);
        if let Err(e) = self
            .records
            .register(uid, ListenerType::Notif, None, &notif_channel)
            .await
        {
            tracing::warn!(uid, error = %e, "failed to register notif listener record");
        }

        let docdb = self.docdb.clone();
        let kv = self.kv.clone();
        let sink = self.sink.clone();
        let uid_owned = uid.to_string();
        let notif_task = tokio::spawn(async move {
            while notif_handle.changes.recv().await.is_some() {
                let mut items = match docdb
                    .query(
                        &format!("clients/{uid_owned}/notifications"),
                        &[QueryFilter::eq("read", Value::Bool(false))],
                        Some("created_at"),
                        None,
                    )
                    .await
                {
                    Ok(items) => items,
                    Err(e) => {
                        tracing::warn!(uid = %uid_owned, error = %e, "notif snapshot query failed");
                        continue;
                    }
                };

                let authorized: Option<std::collections::HashSet<String>> = match docdb
                    .get(&presence::presence_doc_path(&uid_owned))
                    .await
                {
                    Ok(Some(doc)) => doc.get("authorized_companies_ids").and_then(|v| v.as_array()).map(|arr| {
                        arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()
                    }),
                    Ok(None) => None,
                    Err(e) => {
                        tracing::warn!(uid = %uid_owned, error = %e, "presence lookup for notif filter failed");
                        None
                    }
                };
                if let Some(authorized) = &authorized {
                    items.retain(|(_, doc)| match doc.get("company_id").and_then(Value::as_str) {
                        Some(cid) => authorized.contains(cid),
                        None => true,
                    });
                }
                // re-sort defensively: the store's `order_by` hint is not a
                // documented sort direction, so the descending-by-timestamp
                // requirement is enforced here regardless of backend behavior.
                items.sort_by(|a, b| {
                    let av = a.1.get("created_at").and_then(Value::as_str).unwrap_or("");
                    let bv = b.1.get("created_at").and_then(Value::as_str).unwrap_or("");
                    bv.cmp(av)
                });

                let notif_prefix = format!("clients/{uid_owned}/notifications/");
                let event = serde_json::json!({
                    "type": "notification.snapshot",
                    "items": items.into_iter().map(|(id, mut doc)| {
                        let id = id.strip_prefix(notif_prefix.as_str()).map(str::to_string).unwrap_or(id);
                        if let Some(obj) = doc.as_object_mut() {
                            obj.insert("id".to_string(), Value::String(id));
                        }
                        doc
                    }).collect::<Vec<_>>(),
                });
                let channel = namespace::user_channel(&uid_owned);
                if let Ok(payload) = serde_json::to_string(&event) {
                    let _ = kv.publish(&channel, &payload).await;
                }
                sink.broadcast_to_user(&uid_owned, event).await;
            }
        });

        let dm_path = format!("clients/{uid}/direct_message_notif");
        let mut dm_handle = self.rtdb.listen(&dm_path);
        let msg_channel = namespace::user_channel(uid);
        if let Err(e) = self
            .records
            .register(uid, ListenerType::Msg, None, &msg_channel)
            .await
        {
            tracing::warn!(uid, error = %e, "failed to register msg listener record");
        }
        let rtdb = self.rtdb.clone();
        let kv = self.kv.clone();
        let sink = self.sink.clone();
        let uid_owned = uid.to_string();
        let dm_path_owned = dm_path.clone();
        let msg_task = tokio::spawn(async move {
            while let Some(ev) = dm_handle.events.recv().await {
                if ev.path == "/" {
                    continue; // initial snapshot ignored
                }
                if ev.event_type != RtdbEventType::Put {
                    continue;
                }
                let snapshot = rtdb.get(&dm_path_owned).await.unwrap_or(None).unwrap_or(Value::Null);
                let event = serde_json::json!({
                    "type": "direct_message.snapshot",
                    "data": snapshot,
                });
                let channel = namespace::user_channel(&uid_owned);
                if let Ok(payload) = serde_json::to_string(&event) {
                    let _ = kv.publish(&channel, &payload).await;
                }
                sink.broadcast_to_user(&uid_owned, event).await;
            }
        });

        self.user_watchers.insert(
            uid.to_string(),
            UserWatcherSet {
                _notif_task: notif_task,
                _msg_task: msg_task,
            },
        );
    }

    fn schedule_detach(&self, uid: String, reason: &'static str) {
        if self.pending_detach.contains_key(&uid) {
            return; // already scheduled
        }
        let token = CancellationToken::new();
        self.pending_detach.insert(uid.clone(), token.clone());
        let grace = self.grace_window;

        let user_watchers = self.user_watchers.clone();
        let chat_watchers = self.chat_watchers.clone();
        let kv = self.kv.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(grace) => {
                    tracing::info!(uid = %uid, reason, "detaching user watchers after grace window");
                    user_watchers.remove(&uid);
                    chat_watchers.retain(|(u, _), _| u != &uid);
                    let notif_key = namespace::listener_record_key(&uid, "notif", None);
                    let msg_key = namespace::listener_record_key(&uid, "msg", None);
                    let _ = kv.delete(&notif_key).await;
                    let _ = kv.delete(&msg_key).await;
                }
                _ = token.cancelled() => {
                    tracing::debug!(uid = %uid, "detach cancelled, user reconnected within grace window");
                }
            }
        });
    }

    /// Attaches a chat watcher on demand. Translates each RTDB message
    /// into `chat.message`, routing card-action messages to [`CardActionSink`]
    /// instead.
    pub async fn attach_chat_watcher(
        &self,
        uid: &str,
        company_id: &str,
        space_code: &str,
        thread_key: &str,
        rtdb_path: &str,
    ) {
        let watcher_key = (uid.to_string(), thread_key.to_string());
        if self.chat_watchers.contains_key(&watcher_key) {
            return;
        }
        let channel = namespace::chat_channel(uid, company_id, thread_key);
        if let Err(e) = self
            .records
            .register(uid, ListenerType::Chat, Some((space_code, thread_key)), &channel)
            .await
        {
            tracing::warn!(uid, thread_key, error = %e, "failed to register chat listener record");
        }

        let mut handle = self.rtdb.listen(rtdb_path);
        let kv = self.kv.clone();
        let sink = self.sink.clone();
        let sessions = self.sessions.clone();
        let cards = self.cards.clone();
        let uid_owned = uid.to_string();
        let cid_owned = company_id.to_string();
        let space_owned = space_code.to_string();
        let thread_owned = thread_key.to_string();
        let channel_owned = channel.clone();
        let task = tokio::spawn(async move {
            while let Some(ev) = handle.events.recv().await {
                if ev.path == "/" {
                    continue; // initial snapshot ignored
                }
                let message_id = ev.path.trim_start_matches('/').to_string();
                if ev.data.get("action").is_some() {
                    cards
                        .send_card_response(&uid_owned, &space_owned, &thread_owned, ev.data.clone())
                        .await;
                    continue;
                }
                let event = serde_json::json!({
                    "type": "chat.message",
                    "thread_key": thread_owned,
                    "message_id": message_id,
                    "role": ev.data.get("role").cloned().unwrap_or(Value::Null),
                    "content": ev.data,
                });
                if let Ok(payload) = serde_json::to_string(&event) {
                    let _ = kv.publish(&channel_owned, &payload).await;
                }
                let on_thread = sessions
                    .is_user_on_thread(&uid_owned, &cid_owned, &thread_owned)
                    .await
                    .unwrap_or(false);
                if on_thread {
                    sink.broadcast_to_user(&uid_owned, event).await;
                }
            }
        });
        self.chat_watchers.insert(watcher_key, ChatWatcherState { _task: task });
    }

    /// Attaches an on-demand workflow watcher for `(uid, job_id)`.
    /// Diffs `document.initial_data` and `APBookeeper_step_status` against the
    /// per-`(uid, job_id)` cache; only changed fields are published, WebSocket
    /// only (per the publication rules).
    pub async fn attach_workflow_watcher(&self, uid: &str, job_id: &str) {
        let key = (uid.to_string(), job_id.to_string());
        if self.workflow_watchers.contains_key(&key) {
            return;
        }
        let target = format!("clients/{uid}/task_manager/{job_id}");
        let mut handle = self.docdb.on_snapshot(&target);
        if let Err(e) = self
            .records
            .register(uid, ListenerType::Workflow, None, &target)
            .await
        {
            tracing::warn!(uid, job_id, error = %e, "failed to register workflow listener record");
        }
        let docdb = self.docdb.clone();
        let sink = self.sink.clone();
        let cache = self.workflow_cache.clone();
        let uid_owned = uid.to_string();
        let job_owned = job_id.to_string();
        let target_owned = target.clone();
        let task = tokio::spawn(async move {
            while handle.changes.recv().await.is_some() {
                let doc = match docdb.get(&target_owned).await {
                    Ok(Some(d)) => d,
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::warn!(uid = %uid_owned, job_id = %job_owned, error = %e, "workflow snapshot get failed");
                        continue;
                    }
                };
                let initial_data = doc
                    .get("document")
                    .and_then(|d| d.get("initial_data"))
                    .cloned()
                    .unwrap_or(Value::Null);
                let step_status = doc.get("APBookeeper_step_status").cloned().unwrap_or(Value::Null);

                let cache_key = (uid_owned.clone(), job_owned.clone());
                let previous = cache
                    .get(&cache_key)
                    .map(|v| v.clone())
                    .unwrap_or((Value::Null, Value::Null));

                if initial_data != previous.0 {
                    let event = serde_json::json!({
                        "type": "workflow.invoice_update",
                        "job_id": job_owned,
                        "fields": initial_data,
                    });
                    sink.broadcast_to_user(&uid_owned, event).await;
                }
                if step_status != previous.1 {
                    let event = serde_json::json!({
                        "type": "workflow.step_update",
                        "job_id": job_owned,
                        "step_status": step_status,
                    });
                    sink.broadcast_to_user(&uid_owned, event).await;
                }
                cache.insert(cache_key, (initial_data, step_status));
            }
        });
        self.workflow_watchers.insert(key, WorkflowWatcherState { _task: task });
    }

    /// Attaches a per-batch transaction-status watcher. Diffs
    /// `jobs_data[0].transactions[*].status` against an initial+acknowledged
    /// table, publishing only changed transactions.
    pub async fn attach_transaction_watcher(&self, uid: &str, batch_id: &str) {
        if self.transaction_watchers.contains_key(batch_id) {
            return;
        }
        let target = format!("task_manager/{batch_id}");
        let mut handle = self.docdb.on_snapshot(&target);
        let docdb = self.docdb.clone();
        let kv = self.kv.clone();
        let sink = self.sink.clone();
        let uid_owned = uid.to_string();
        let batch_owned = batch_id.to_string();
        let target_owned = target.clone();
        let mut acknowledged: std::collections::HashMap<String, Value> = std::collections::HashMap::new();
        let task = tokio::spawn(async move {
            while handle.changes.recv().await.is_some() {
                let doc = match docdb.get(&target_owned).await {
                    Ok(Some(d)) => d,
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::warn!(uid = %uid_owned, batch_id = %batch_owned, error = %e, "transaction snapshot get failed");
                        continue;
                    }
                };
                let transactions = doc
                    .get("jobs_data")
                    .and_then(|j| j.get(0))
                    .and_then(|j| j.get("transactions"))
                    .and_then(|t| t.as_array())
                    .cloned()
                    .unwrap_or_default();

                let mut changed = Vec::new();
                for tx in &transactions {
                    let Some(id) = tx.get("id").and_then(|v| v.as_str()) else { continue };
                    let status = tx.get("status").cloned().unwrap_or(Value::Null);
                    if acknowledged.get(id) != Some(&status) {
                        changed.push(tx.clone());
                        acknowledged.insert(id.to_string(), status);
                    }
                }
                if changed.is_empty() {
                    continue;
                }
                let event = serde_json::json!({
                    "type": "transaction.status_change",
                    "batch_id": batch_owned,
                    "changed": changed,
                });
                let channel = namespace::user_channel(&uid_owned);
                if let Ok(payload) = serde_json::to_string(&event) {
                    let _ = kv.publish(&channel, &payload).await;
                }
                sink.broadcast_to_user(&uid_owned, event).await;
            }
        });
        self.transaction_watchers
            .insert(batch_id.to_string(), TransactionWatcherState { _task: task });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docdb::InMemoryDocDb;
    use crate::kv::InMemoryKv;
    use crate::rtdb::InMemoryRtdb;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct CapturingSink {
        tx: mpsc::UnboundedSender<(String, Value)>,
    }

    #[async_trait]
    impl EventSink for CapturingSink {
        async fn broadcast_to_user(&self, uid: &str, event: Value) {
            let _ = self.tx.send((uid.to_string(), event));
        }
    }

    struct NoopCardSink {
        captured: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl CardActionSink for NoopCardSink {
        async fn send_card_response(&self, uid: &str, _space_code: &str, _thread_key: &str, message: Value) {
            self.captured.lock().unwrap().push((uid.to_string(), message));
        }
    }

    fn harness() -> (
        ListenerSupervisor,
        Arc<InMemoryDocDb>,
        Arc<InMemoryRtdb>,
        mpsc::UnboundedReceiver<(String, Value)>,
    ) {
        let kv = Arc::new(InMemoryKv::new());
        let docdb = Arc::new(InMemoryDocDb::new());
        let rtdb = Arc::new(InMemoryRtdb::new());
        let sessions = Arc::new(SessionStore::new(kv.clone()));
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Arc::new(CapturingSink { tx });
        let cards = Arc::new(NoopCardSink { captured: Mutex::new(Vec::new()) });
        let supervisor = ListenerSupervisor::new(kv, docdb.clone(), rtdb.clone(), sessions, sink, cards)
            .with_grace_window(Duration::from_millis(50));
        (supervisor, docdb, rtdb, rx)
    }

    #[tokio::test]
    async fn presence_live_attaches_and_absent_detaches_after_grace() {
        let (sup, _docdb, _rtdb, _rx) = harness();
        sup.on_presence_changed("u1", true).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(sup.is_user_attached("u1"));

        sup.on_presence_changed("u1", false).await;
        assert!(sup.is_user_attached("u1"), "still attached during grace window");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!sup.is_user_attached("u1"));
    }

    #[tokio::test]
    async fn reconnect_within_grace_window_cancels_detach() {
        let (sup, _docdb, _rtdb, _rx) = harness();
        sup.on_presence_changed("u1", true).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        sup.on_presence_changed("u1", false).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        sup.on_presence_changed("u1", true).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sup.is_user_attached("u1"), "reconnect within grace window should cancel detach");
    }

    #[tokio::test]
    async fn notif_watcher_republishes_unread_snapshot() {
        let (sup, docdb, _rtdb, mut rx) = harness();
        sup.on_presence_changed("u1", true).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        docdb
            .set("clients/u1/notifications/n1", serde_json::json!({"read": false, "created_at": "2026-01-01"}), false)
            .await
            .unwrap();

        let (uid, event) = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(uid, "u1");
        assert_eq!(event["type"], "notification.snapshot");
        assert_eq!(event["items"][0]["id"], "n1");
    }

    #[tokio::test]
    async fn notif_watcher_filters_unauthorized_companies_and_sorts_descending() {
        let (sup, docdb, _rtdb, mut rx) = harness();
        docdb
            .set(
                &presence::presence_doc_path("u1"),
                serde_json::json!({"authorized_companies_ids": ["c1"]}),
                false,
            )
            .await
            .unwrap();
        sup.on_presence_changed("u1", true).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        docdb
            .set(
                "clients/u1/notifications/older",
                serde_json::json!({"read": false, "created_at": "2026-01-01T00:00:00Z", "company_id": "c1"}),
                false,
            )
            .await
            .unwrap();
        docdb
            .set(
                "clients/u1/notifications/newer",
                serde_json::json!({"read": false, "created_at": "2026-02-01T00:00:00Z", "company_id": "c1"}),
                false,
            )
            .await
            .unwrap();
        docdb
            .set(
                "clients/u1/notifications/other_company",
                serde_json::json!({"read": false, "created_at": "2026-03-01T00:00:00Z", "company_id": "c2"}),
                false,
            )
            .await
            .unwrap();

        // Each `set` above ticks the snapshot watcher independently; drain to
        // the last republished snapshot, which reflects all three writes.
        let mut event = None;
        while let Ok(Some((_, e))) = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
            event = Some(e);
        }
        let event = event.expect("at least one notification.snapshot event");
        let ids: Vec<&str> = event["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|i| i["id"].as_str().unwrap())
            .collect();
        assert!(!ids.contains(&"other_company"), "unauthorized company must be filtered out");
        let newer_pos = ids.iter().position(|id| *id == "newer").unwrap();
        let older_pos = ids.iter().position(|id| *id == "older").unwrap();
        assert!(newer_pos < older_pos, "items must be sorted by created_at descending");
    }

    #[tokio::test]
    async fn chat_watcher_routes_card_actions_away_from_broadcast() {
        let (sup, _docdb, rtdb, mut rx) = harness();
        let path = "space1/active_chats/t1/messages";
        sup.attach_chat_watcher("u1", "c1", "space1", "t1", path).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        rtdb.put(&format!("{path}/m1"), serde_json::json!({"action": "approve", "text": "yes"}))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err(), "card action must not be broadcast as chat.message");
    }

    #[tokio::test]
    async fn chat_watcher_skips_broadcast_when_user_not_on_thread() {
        let (sup, _docdb, rtdb, mut rx) = harness();
        let path = "space1/active_chats/t1/messages";
        sup.attach_chat_watcher("u1", "c1", "space1", "t1", path).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        rtdb.put(&format!("{path}/m1"), serde_json::json!({"role": "assistant", "text": "hi"}))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err(), "BACKEND mode (not on thread) must skip the websocket");
    }

    #[tokio::test]
    async fn workflow_watcher_publishes_only_changed_fields() {
        let (sup, docdb, _rtdb, mut rx) = harness();
        sup.attach_workflow_watcher("u1", "job1").await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        docdb
            .set(
                "clients/u1/task_manager/job1",
                serde_json::json!({"document": {"initial_data": {"amount": 100}}}),
                false,
            )
            .await
            .unwrap();

        let (_uid, event) = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event["type"], "workflow.invoice_update");
        assert_eq!(event["fields"]["amount"], 100);
    }
}
