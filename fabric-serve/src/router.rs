//! Builds the axum `Router` for every HTTP/WS route and runs it to
//! completion with graceful shutdown on SIGINT, following the
//! `run_serve`/`run_serve_on_listener` split so tests can bind to
//! `127.0.0.1:0` and production can bind a configured address.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use fabric_config::FabricSettings;
use tokio::net::TcpListener;
use tracing::info;

use crate::admin::{invalidate_cache, invalidate_context};
use crate::health::{debug, healthz, readyz, version, ws_metrics};
use crate::lpt_http::{hr_callback, lpt_callback};
use crate::rpc_http::rpc_handler;
use crate::state::AppState;
use crate::ws::ws_handler;

/// OAuth exchange endpoint expected to exist on the route table but out of
/// core scope; returns a stub acknowledgement since no identity provider is
/// wired into this fabric.
async fn google_auth_callback() -> &'static str {
    "google_auth_callback is handled by the identity provider integration, not this fabric"
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/version", get(version))
        .route("/readyz", get(readyz))
        .route("/debug", get(debug))
        .route("/ws-metrics", get(ws_metrics))
        .route("/rpc", post(rpc_handler))
        .route("/lpt/callback", post(lpt_callback))
        .route("/hr/callback", post(hr_callback))
        .route("/invalidate-context", post(invalidate_context))
        .route("/admin/invalidate_cache", post(invalidate_cache))
        .route("/google_auth_callback/", get(google_auth_callback))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// Runs the fabric on an existing listener. Used by tests (bind to
/// `127.0.0.1:0`, then pass the listener so the ephemeral port is known).
pub async fn run_on_listener(
    listener: TcpListener,
    settings: FabricSettings,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = listener.local_addr()?;
    info!("fabric listening on http://{}", addr);

    let state = AppState::new(settings);
    let scheduler_shutdowns = spawn_schedulers(&state);
    let app = build_router(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    for tx in scheduler_shutdowns {
        let _ = tx.send(());
    }
    Ok(())
}

/// Spawns one `Scheduler::run_forever` task per configured mandates path.
/// `FABRIC_SCHEDULER_MANDATES_PATHS` is a comma-separated list of
/// collection paths; unset means no company has opted into scheduled tasks
/// yet and the tick loop simply never runs.
fn spawn_schedulers(state: &Arc<AppState>) -> Vec<tokio::sync::oneshot::Sender<()>> {
    let paths = std::env::var("FABRIC_SCHEDULER_MANDATES_PATHS").unwrap_or_default();
    paths
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|path| {
            let (tx, rx) = tokio::sync::oneshot::channel();
            let scheduler = state.scheduler.clone();
            let path = path.to_string();
            tokio::spawn(scheduler.run_forever(path, rx));
            tx
        })
        .collect()
}

/// Binds `addr` (default `0.0.0.0:8080`) and runs until SIGINT/SIGTERM.
pub async fn run(addr: Option<&str>, settings: FabricSettings) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = addr.unwrap_or("0.0.0.0:8080");
    let listener = TcpListener::bind(addr).await?;
    run_on_listener(listener, settings).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received, draining connections");
}
