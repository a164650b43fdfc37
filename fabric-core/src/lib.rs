//! # fabric-core
//!
//! The real-time event and RPC fabric that sits between a multi-tenant
//! accounting/automation front-end, its agent workflows, and the external
//! services they lean on (a Redis-shaped KV store, a Firestore-shaped
//! document database, a Firebase Realtime-Database-shaped RTDB, and an
//! external LLM/LPT worker tier). `fabric-serve` is the axum binary that
//! exposes this crate's services over HTTP and WebSocket; this crate holds
//! every stateful component and none of the transport.
//!
//! ## Layout
//!
//! - [`kv`] / [`docdb`] / [`rtdb`]: thin async traits over the three external
//!   stores, each with an in-memory test double, grounded by the original's
//!   Redis/Firestore/RTDB client wrappers.
//! - [`namespace`]: the single source of truth for every Redis-style key
//!   format and TTL constant.
//! - [`presence`]: `UserPresence` + the online/live invariant, mirrored to KV
//!   and DocDB.
//! - [`listener`]: the WebSocket hub's backing supervisor -- per-user
//!   watchers, grace-window detach, on-demand chat/workflow/transaction
//!   watchers, and the publication rules that decide KV-only vs. KV+WS.
//! - [`session`] / [`chat`] / [`workflow`]: the three KV-backed stores an
//!   agent turn rehydrates from on every invocation.
//! - [`agent`]: the stateless `AgentRuntime` that runs one unified workflow
//!   turn, in UI or BACKEND mode, with or without streaming.
//! - [`lpt`]: dispatch of long-running-task requests to an external worker,
//!   and processing of its callback.
//! - [`rpc`]: the `POST /rpc` namespace router with idempotency and a fixed
//!   error-code contract.
//! - [`cache`]: the generic business-data cache layered on KV, with
//!   empty-list eviction and module-scoped invalidation.
//! - [`scheduler`]: the planned-task executor that reuses `AgentRuntime` in
//!   BACKEND mode on a timer.

pub mod agent;
pub mod cache;
pub mod chat;
pub mod docdb;
pub mod kv;
pub mod listener;
pub mod lpt;
pub mod namespace;
pub mod presence;
pub mod rpc;
pub mod rtdb;
pub mod scheduler;
pub mod session;
pub mod workflow;

pub use agent::{
    wait_on_lpt_tool_schema, AgentError, AgentRuntime, ContextProvider, LlmProvider, LlmTurn,
    ToolCall, ToolHandler, TurnOutcome, EXPECTED_LPT_VALUES, WAIT_ON_LPT_TOOL_NAME,
};
pub use cache::{CacheError, CacheManager, CacheStats, CachedData};
pub use chat::{ChatHistory, ChatHistoryError, ChatHistoryStore, ChatStats, ChatStatus};
pub use docdb::{DocDbError, DocDbStore, FilterOp, InMemoryDocDb, QueryFilter, SnapshotHandle};
pub use kv::{InMemoryKv, KvError, KvStore, PubSubMessage, ScanPage};
pub use listener::{
    CardActionSink, EventSink, ListenerError, ListenerRecord, ListenerRecordRegistry,
    ListenerSupervisor, ListenerType,
};
pub use lpt::{
    CallbackAck, HttpLptTransport, LptCallbackPayload, LptCallbackProcessor, LptError, LptRequest,
    LptResponse, LptResponseStatus, LptTransport, Traceability,
};
pub use presence::{PresenceError, PresenceRegistry, PresenceStatus, UserPresence};
pub use rpc::{
    MethodRegistration, RpcContext, RpcError, RpcErrorCode, RpcErrorPayload, RpcFailure, RpcMethod,
    RpcRequest, RpcResponse, RpcRouter, KNOWN_NAMESPACES,
};
pub use rtdb::{
    attach_with_fallback, chat_thread_candidates, InMemoryRtdb, RtdbError, RtdbEvent,
    RtdbEventType, RtdbListenerHandle, RtdbStore,
};
pub use scheduler::{PlannedTask, PlannedTaskStore, Scheduler, SchedulerError, TaskRunOutcome, TaskStatus};
pub use session::{SessionState, SessionStats, SessionStore, SessionStoreError};
pub use workflow::{
    QueueMessageResult, UserEnteredResult, UserLeftResult, WaitingLptInfo, WorkflowMode,
    WorkflowState, WorkflowStateError, WorkflowStateStore, WorkflowStatus,
};

/// Initializes tracing from `RUST_LOG` so unit tests across every module can
/// print logs with `--nocapture`.
#[cfg(test)]
mod test_logging {
    use ctor::ctor;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::Layer;

    #[ctor]
    fn init() {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_test_writer()
                    .with_filter(filter),
            )
            .try_init();
    }
}
