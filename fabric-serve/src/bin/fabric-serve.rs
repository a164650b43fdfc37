//! Process entry point: load env/config, resolve settings, start the axum
//! fabric and run until SIGINT/SIGTERM.

use fabric_config::FabricSettings;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = fabric_config::load_and_apply("fabric", None) {
        tracing::warn!(error = %e, "failed to load .env/XDG config, continuing with process env only");
    }

    let settings = FabricSettings::from_env();
    let addr = std::env::var("FABRIC_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

    fabric_serve::run(Some(&addr), settings).await
}
