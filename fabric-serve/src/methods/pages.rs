//! Representative page handlers honouring the contract: cache-first
//! read, partial-failure-tolerant composition, write-through, and the
//! `{success, data}` / `{success:false, error}` response envelope. Page
//! handlers are not individually re-specified; `DASHBOARD.full_data` and
//! `FIREBASE_CACHE.invalidate_module` stand in for the family.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use fabric_config::FabricSettings;
use fabric_core::{CacheManager, MethodRegistration, RpcContext, RpcErrorCode, RpcFailure, RpcMethod, RpcRouter};
use serde_json::{json, Value};
use uuid::Uuid;

use super::{idempotent_for, require_company_id, require_kwarg_str, require_user_id};

const DASHBOARD_CACHE_TYPE: &str = "dashboard";
const DASHBOARD_TTL_SECONDS: u64 = 1800;

fn internal(e: impl std::fmt::Display) -> RpcFailure {
    RpcFailure::new(RpcErrorCode::Internal, e.to_string())
}

/// `DASHBOARD.full_data(user_id, company_id, force_refresh?)`.
/// There is no live ERP/DMS sub-fetch wired into this binary, so the composed payload is the documented empty-widgets default;
/// the cache-first/write-through/meta contract is what this handler exists
/// to demonstrate.
struct DashboardFullData(Arc<CacheManager>);

#[async_trait]
impl RpcMethod for DashboardFullData {
    async fn invoke(&self, ctx: RpcContext) -> Result<Value, RpcFailure> {
        let start = Instant::now();
        let user_id = require_user_id(&ctx)?;
        let company_id = require_company_id(&ctx)?;
        let force_refresh = ctx.kwargs.get("force_refresh").and_then(Value::as_bool).unwrap_or(false);
        let request_id = ctx.trace_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());

        if !force_refresh {
            if let Some(cached) = self
                .0
                .get_cached_data(user_id, company_id, DASHBOARD_CACHE_TYPE, Some("full_data"))
                .await
                .map_err(internal)?
            {
                return Ok(json!({
                    "success": true,
                    "data": cached.data,
                    "meta": {
                        "requestId": request_id,
                        "cachedAt": cached.cached_at,
                        "cacheHit": true,
                        "cacheTTL": cached.ttl_seconds,
                        "durationMs": start.elapsed().as_millis() as u64,
                        "dataFreshness": "cached",
                    },
                }));
            }
        }

        // Documented default for a sub-fetch this binary has no live
        // collaborator for.
        let data = json!({"widgets": [], "invoices_due": 0, "tasks_pending": 0});

        self.0
            .set_cached_data(
                user_id,
                company_id,
                DASHBOARD_CACHE_TYPE,
                Some("full_data"),
                data.clone(),
                DASHBOARD_TTL_SECONDS,
                "dashboard_page_handler",
            )
            .await
            .map_err(internal)?;

        Ok(json!({
            "success": true,
            "data": data,
            "meta": {
                "requestId": request_id,
                "cachedAt": Utc::now(),
                "cacheHit": false,
                "cacheTTL": DASHBOARD_TTL_SECONDS,
                "durationMs": start.elapsed().as_millis() as u64,
                "dataFreshness": "live",
            },
        }))
    }
}

/// `FIREBASE_CACHE.invalidate_module(user_id, company_id, data_type)`: the
/// operator-facing counterpart of the cache-first contract.
struct InvalidateModule(Arc<CacheManager>);

#[async_trait]
impl RpcMethod for InvalidateModule {
    async fn invoke(&self, ctx: RpcContext) -> Result<Value, RpcFailure> {
        let user_id = require_user_id(&ctx)?;
        let company_id = require_company_id(&ctx)?;
        let data_type = require_kwarg_str(&ctx, "data_type")?;
        let deleted = self
            .0
            .invalidate_module_cache(user_id, company_id, data_type)
            .await
            .map_err(internal)?;
        Ok(json!({"success": true, "data": {"deleted_count": deleted}}))
    }
}

pub(super) fn register(router: &mut RpcRouter, cache: Arc<CacheManager>, settings: &FabricSettings) {
    router.register(MethodRegistration {
        name: "DASHBOARD.full_data",
        method: Arc::new(DashboardFullData(cache.clone())),
        idempotent: idempotent_for(settings, "DASHBOARD.full_data", false),
    });
    router.register(MethodRegistration {
        name: "FIREBASE_CACHE.invalidate_module",
        method: Arc::new(InvalidateModule(cache)),
        idempotent: idempotent_for(settings, "FIREBASE_CACHE.invalidate_module", false),
    });
}
