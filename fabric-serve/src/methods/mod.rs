//! Registers every `RpcMethod` this process knows about onto an
//! [`RpcRouter`].
//! fabric-core ships the router and the namespace list; the concrete
//! per-namespace handlers live here since they're the seam where this binary's
//! stores meet the wire contract.

mod llm;
mod pages;
mod tasks;

use std::sync::Arc;

use fabric_config::FabricSettings;
use fabric_core::{
    AgentRuntime, CacheManager, MethodRegistration, PlannedTaskStore, RpcContext, RpcErrorCode, RpcFailure, RpcRouter,
};
use serde_json::Value;

/// A method is idempotency-checked unless idempotency is globally disabled or
/// this specific name is listed in `RPC_IDEMP_DISABLE_METHODS`.
fn idempotent_for(settings: &FabricSettings, name: &str, default: bool) -> bool {
    if settings.rpc_idempotency_disabled {
        return false;
    }
    if settings.rpc_idempotency_disabled_methods.iter().any(|m| m == name) {
        return false;
    }
    default
}

pub(crate) fn require_user_id(ctx: &RpcContext) -> Result<&str, RpcFailure> {
    ctx.user_id
        .as_deref()
        .ok_or_else(|| RpcFailure::new(RpcErrorCode::InvalidArgs, "user_id is required"))
}

pub(crate) fn require_company_id(ctx: &RpcContext) -> Result<&str, RpcFailure> {
    ctx.company_id
        .as_deref()
        .ok_or_else(|| RpcFailure::new(RpcErrorCode::InvalidArgs, "company_id is required"))
}

pub(crate) fn require_kwarg_str<'a>(ctx: &'a RpcContext, field: &str) -> Result<&'a str, RpcFailure> {
    ctx.kwargs
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| RpcFailure::new(RpcErrorCode::InvalidArgs, format!("{field} is required")))
}

pub(crate) fn optional_kwarg_str<'a>(ctx: &'a RpcContext, field: &str) -> Option<&'a str> {
    ctx.kwargs.get(field).and_then(Value::as_str)
}

pub(crate) fn optional_kwarg_bool(ctx: &RpcContext, field: &str, default: bool) -> bool {
    ctx.kwargs.get(field).and_then(Value::as_bool).unwrap_or(default)
}

pub fn register_methods(
    router: &mut RpcRouter,
    agent: Arc<AgentRuntime>,
    cache: Arc<CacheManager>,
    tasks: Arc<PlannedTaskStore>,
    settings: &FabricSettings,
) {
    llm::register(router, agent.clone(), settings);
    pages::register(router, cache, settings);
    tasks::register(router, tasks, agent, settings);
}
