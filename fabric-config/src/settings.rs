//! Process-wide settings resolved once at startup from the environment.
//!
//! Built after [`crate::load_and_apply`] has merged `.env`/XDG config into the process
//! environment, so every field below only ever reads `std::env::var`. No lazy global:
//! the caller owns a `FabricSettings` and threads it through `AppState`.

use std::time::Duration;

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// KV store connection parameters (component A).
#[derive(Clone, Debug)]
pub struct KvSettings {
    pub use_local: bool,
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub tls: bool,
    pub tls_verify: bool,
    pub db: u8,
}

impl KvSettings {
    fn from_env() -> Self {
        Self {
            use_local: env_bool("USE_LOCAL_REDIS", false),
            host: env_string("LISTENERS_REDIS_HOST", "127.0.0.1"),
            port: env_u64("LISTENERS_REDIS_PORT", 6379) as u16,
            password: std::env::var("LISTENERS_REDIS_PASSWORD").ok(),
            tls: env_bool("LISTENERS_REDIS_TLS", false),
            tls_verify: env_bool("LISTENERS_REDIS_TLS_VERIFY", true),
            db: env_u64("LISTENERS_REDIS_DB", 0) as u8,
        }
    }
}

/// Settings resolved once at process start, threaded through `AppState` by value.
#[derive(Clone, Debug)]
pub struct FabricSettings {
    pub kv: KvSettings,
    pub channel_prefix: String,
    pub chat_channel_prefix: String,
    pub heartbeat_interval: Duration,
    pub presence_ttl: Duration,
    pub keepalive_interval: Duration,
    pub rpc_api_version: String,
    pub rpc_idempotency_disabled: bool,
    pub rpc_idempotency_disabled_methods: Vec<String>,
    pub rpc_idempotency_ttl: Duration,
    pub service_token: Option<String>,
    pub workflow_listener_enabled: bool,
    pub transaction_listener_enabled: bool,
    pub unified_registry_enabled: bool,
    pub registry_debug: bool,
}

impl FabricSettings {
    /// Reads every recognised env var, falling back to its documented default.
    pub fn from_env() -> Self {
        let disabled_methods = std::env::var("RPC_IDEMP_DISABLE_METHODS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            kv: KvSettings::from_env(),
            channel_prefix: env_string("LISTENERS_CHANNEL_PREFIX", "user:"),
            chat_channel_prefix: env_string("LISTENERS_CHAT_CHANNEL_PREFIX", "chat:"),
            heartbeat_interval: Duration::from_secs(env_u64("LISTENERS_HEARTBEAT_INTERVAL", 45)),
            presence_ttl: Duration::from_secs(env_u64("LISTENERS_TTL_SECONDS", 90)),
            keepalive_interval: Duration::from_secs(env_u64("WEBSOCKET_KEEPALIVE_INTERVAL", 30)),
            rpc_api_version: env_string("RPC_API_VERSION", "v1"),
            rpc_idempotency_disabled: env_bool("RPC_IDEMP_DISABLE", false),
            rpc_idempotency_disabled_methods: disabled_methods,
            rpc_idempotency_ttl: Duration::from_secs(env_u64("RPC_IDEMP_TTL", 900)),
            service_token: std::env::var("LISTENERS_SERVICE_TOKEN").ok(),
            workflow_listener_enabled: env_bool("WORKFLOW_LISTENER_ENABLED", true),
            transaction_listener_enabled: env_bool("TRANSACTION_LISTENER_ENABLED", true),
            unified_registry_enabled: env_bool("UNIFIED_REGISTRY_ENABLED", false),
            registry_debug: env_bool("REGISTRY_DEBUG", false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_table() {
        for key in [
            "USE_LOCAL_REDIS",
            "LISTENERS_HEARTBEAT_INTERVAL",
            "LISTENERS_TTL_SECONDS",
            "WEBSOCKET_KEEPALIVE_INTERVAL",
            "RPC_API_VERSION",
            "RPC_IDEMP_TTL",
        ] {
            std::env::remove_var(key);
        }
        let settings = FabricSettings::from_env();
        assert_eq!(settings.heartbeat_interval, Duration::from_secs(45));
        assert_eq!(settings.presence_ttl, Duration::from_secs(90));
        assert_eq!(settings.keepalive_interval, Duration::from_secs(30));
        assert_eq!(settings.rpc_api_version, "v1");
        assert_eq!(settings.rpc_idempotency_ttl, Duration::from_secs(900));
    }

    #[test]
    fn idemp_disabled_methods_parses_csv() {
        std::env::set_var("RPC_IDEMP_DISABLE_METHODS", "ERP.invalidate_connection, TASK.list");
        let settings = FabricSettings::from_env();
        std::env::remove_var("RPC_IDEMP_DISABLE_METHODS");
        assert_eq!(
            settings.rpc_idempotency_disabled_methods,
            vec!["ERP.invalidate_connection".to_string(), "TASK.list".to_string()]
        );
    }
}
