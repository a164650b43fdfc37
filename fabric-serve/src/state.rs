//! Process-wide shared state: every fabric-core service wired together with
//! this crate's transport-facing collaborators (hub, ws metrics, stub
//! providers). One `AppState` is built at startup and cloned (cheaply, behind
//! `Arc`s) into every axum handler.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use fabric_config::FabricSettings;
use fabric_core::{
    AgentRuntime, CacheManager, CardActionSink, ChatHistoryStore, DocDbStore, InMemoryDocDb,
    InMemoryKv, InMemoryRtdb, KvStore, ListenerSupervisor, LptCallbackProcessor, PlannedTaskStore,
    PresenceRegistry, RpcRouter, RtdbStore, Scheduler, SessionStore, WorkflowStateStore,
};
use serde_json::Value;

use crate::hub::ConnectionHub;
use crate::methods::register_methods;
use crate::providers::{StubContextProvider, StubLlmProvider};
use crate::ws_metrics::WsMetrics;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Routes a card-action chat message into the agent runtime's
/// `send_card_response` entry point.
/// `space_code` is accepted only to satisfy the trait; company resolution
/// happens inside the agent runtime by scanning the user's live sessions.
struct AgentCardSink {
    agent: Arc<AgentRuntime>,
}

#[async_trait]
impl CardActionSink for AgentCardSink {
    async fn send_card_response(&self, uid: &str, _space_code: &str, thread_key: &str, message: Value) {
        if let Err(e) = self.agent.send_card_response(uid, thread_key, message).await {
            tracing::warn!(uid, thread_key, error = %e, "card response turn failed");
        }
    }
}

pub struct AppState {
    pub settings: FabricSettings,
    pub kv: Arc<dyn KvStore>,
    pub docdb: Arc<dyn DocDbStore>,
    pub rtdb: Arc<dyn RtdbStore>,
    pub presence: Arc<PresenceRegistry>,
    pub listeners: Arc<ListenerSupervisor>,
    pub sessions: Arc<SessionStore>,
    pub chats: Arc<ChatHistoryStore>,
    pub workflows: Arc<WorkflowStateStore>,
    pub agent: Arc<AgentRuntime>,
    pub cache: Arc<CacheManager>,
    pub rpc: Arc<RpcRouter>,
    pub lpt: Arc<LptCallbackProcessor>,
    pub hub: Arc<ConnectionHub>,
    pub ws_metrics: Arc<WsMetrics>,
    pub tasks: Arc<PlannedTaskStore>,
    pub scheduler: Arc<Scheduler>,
    pub started_at: Instant,
}

impl AppState {
    /// Wires every in-memory store double, the agent runtime with stub
    /// LLM/context providers, and registers every known RPC method. Real
    /// deployments would swap the `InMemory*` stores and stub providers for
    /// their Redis/Firestore/RTDB/LLM clients without touching anything else,
    /// since every collaborator here is reached only through its trait.
    pub fn new(settings: FabricSettings) -> Arc<Self> {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
        let docdb: Arc<dyn DocDbStore> = Arc::new(InMemoryDocDb::new());
        let rtdb: Arc<dyn RtdbStore> = Arc::new(InMemoryRtdb::new());

        let presence = Arc::new(PresenceRegistry::new(kv.clone(), docdb.clone()));
        let sessions = Arc::new(SessionStore::new(kv.clone()));
        let chats = Arc::new(ChatHistoryStore::new(kv.clone()));
        let workflows = Arc::new(WorkflowStateStore::new(kv.clone()));

        let hub = Arc::new(ConnectionHub::new());
        let ws_metrics = Arc::new(WsMetrics::new());

        // No ToolHandlers are registered by default; a deployment that wires
        // real DMS/ERP tools calls `AgentRuntime::register_tool` here before
        // wrapping the runtime in `Arc`.
        let agent = Arc::new(AgentRuntime::new(
            sessions.clone(),
            chats.clone(),
            workflows.clone(),
            rtdb.clone(),
            Arc::new(StubLlmProvider),
            Arc::new(StubContextProvider),
            hub.clone(),
        ));

        let listeners = Arc::new(ListenerSupervisor::new(
            kv.clone(),
            docdb.clone(),
            rtdb.clone(),
            sessions.clone(),
            hub.clone(),
            Arc::new(AgentCardSink { agent: agent.clone() }),
        ));

        let cache = Arc::new(CacheManager::new(kv.clone()));

        let tasks = Arc::new(PlannedTaskStore::new(docdb.clone()));

        let bearer_token = settings.service_token.clone();
        let mut rpc = RpcRouter::new(kv.clone(), bearer_token.clone());
        register_methods(&mut rpc, agent.clone(), cache.clone(), tasks.clone(), &settings);
        let rpc = Arc::new(rpc);

        let lpt = Arc::new(LptCallbackProcessor::new(docdb.clone(), agent.clone()));

        let scheduler = Arc::new(Scheduler::new(kv.clone(), tasks.clone(), agent.clone()));

        Arc::new(Self {
            settings,
            kv,
            docdb,
            rtdb,
            presence,
            listeners,
            sessions,
            chats,
            workflows,
            agent,
            cache,
            rpc,
            lpt,
            hub,
            ws_metrics,
            tasks,
            scheduler,
            started_at: Instant::now(),
        })
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Bearer-token check shared by `/rpc` and `/lpt/callback`. Returns `true` when no token is configured (auth optional).
    pub fn check_bearer(&self, header_value: Option<&str>) -> bool {
        match &self.settings.service_token {
            None => true,
            Some(expected) => header_value
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(|token| token == expected)
                .unwrap_or(false),
        }
    }
}
