//! WebSocket connection registry: `user_id -> [sockets]`, broadcasting
//! fans out to every socket for a user and evicts dead ones on send error.
//! Implements fabric-core's [`EventSink`] so the listener supervisor and the
//! agent runtime can reach sockets without depending on axum.

use axum::extract::ws::Message;
use dashmap::DashMap;
use fabric_core::EventSink;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

struct Socket {
    conn_id: Uuid,
    tx: UnboundedSender<Message>,
}

/// Single event-loop cooperative per socket;
/// `broadcast_to_user` itself is thread-safe so listener callbacks running
/// outside any one socket's task can still deliver events.
#[derive(Default)]
pub struct ConnectionHub {
    sockets: DashMap<String, Vec<Socket>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new socket's outbound channel under `uid`, returning the
    /// connection id the caller must pass to [`Self::unregister`] on close.
    pub fn register(&self, uid: &str, tx: UnboundedSender<Message>) -> Uuid {
        let conn_id = Uuid::new_v4();
        self.sockets
            .entry(uid.to_string())
            .or_default()
            .push(Socket { conn_id, tx });
        conn_id
    }

    pub fn unregister(&self, uid: &str, conn_id: Uuid) {
        if let Some(mut sockets) = self.sockets.get_mut(uid) {
            sockets.retain(|s| s.conn_id != conn_id);
            if sockets.is_empty() {
                drop(sockets);
                self.sockets.remove(uid);
            }
        }
    }

    pub fn is_attached(&self, uid: &str) -> bool {
        self.sockets.get(uid).map(|s| !s.is_empty()).unwrap_or(false)
    }

    pub fn attached_user_count(&self) -> usize {
        self.sockets.len()
    }

    /// Sends one frame to every socket for `uid`; a socket whose receiver has
    /// gone away (the task exited) is pruned on the spot.
    pub fn send_to_user(&self, uid: &str, message: Message) {
        if let Some(mut sockets) = self.sockets.get_mut(uid) {
            sockets.retain(|s| s.tx.send(message.clone()).is_ok());
        }
    }
}

#[async_trait::async_trait]
impl EventSink for ConnectionHub {
    async fn broadcast_to_user(&self, uid: &str, event: Value) {
        let Ok(text) = serde_json::to_string(&event) else {
            tracing::warn!(uid, "failed to serialize event for broadcast");
            return;
        };
        self.send_to_user(uid, Message::Text(text));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn broadcast_fans_out_to_every_socket_for_user() {
        let hub = ConnectionHub::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        hub.register("u1", tx1);
        hub.register("u1", tx2);

        hub.broadcast_to_user("u1", serde_json::json!({"type": "ping"})).await;

        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
    }

    #[tokio::test]
    async fn dead_socket_is_evicted_on_send_error() {
        let hub = ConnectionHub::new();
        let (tx, rx) = mpsc::unbounded_channel();
        hub.register("u1", tx);
        drop(rx);

        hub.broadcast_to_user("u1", serde_json::json!({"type": "ping"})).await;

        assert!(!hub.is_attached("u1"));
    }

    #[tokio::test]
    async fn unregister_removes_only_that_connection() {
        let hub = ConnectionHub::new();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let id1 = hub.register("u1", tx1);
        hub.register("u1", tx2);

        hub.unregister("u1", id1);

        assert!(hub.is_attached("u1"));
        assert_eq!(hub.attached_user_count(), 1);
    }
}
