//! HTTP + WebSocket transport for the real-time event and RPC fabric built in
//! `fabric-core`. This crate owns every axum route, the WebSocket connection
//! hub, and the stub collaborators (LLM provider, company context) a running
//! process needs that fabric-core deliberately leaves as trait objects.
//!
//! `fabric-core` holds every stateful component and none of the transport;
//! this crate is the other half.

mod admin;
mod error;
mod health;
mod hub;
mod lpt_http;
pub mod methods;
mod providers;
mod rpc_http;
mod router;
mod state;
mod ws;
mod ws_metrics;

pub use error::ServeError;
pub use hub::ConnectionHub;
pub use providers::{StubContextProvider, StubLlmProvider};
pub use router::{build_router, run};
pub use state::AppState;
pub use ws_metrics::WsMetrics;

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
