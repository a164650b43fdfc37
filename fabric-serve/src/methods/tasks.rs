//! `TASK.*` RPC methods: the planned-task CRUD surface the WebSocket hub's
//! `task.list/execute/toggle_enabled/update` frames dispatch into (see
//! `ws.rs`). Each method operates on the same `{mandates_path}/tasks`
//! collection the scheduler ticks over, so enabling/disabling or editing a
//! task here is immediately visible to the next tick.

use std::sync::Arc;

use async_trait::async_trait;
use fabric_config::FabricSettings;
use fabric_core::{
    AgentRuntime, MethodRegistration, PlannedTaskStore, RpcContext, RpcErrorCode, RpcFailure, RpcMethod, RpcRouter,
};
use serde_json::{json, Value};

use super::{idempotent_for, optional_kwarg_str, require_company_id, require_kwarg_str, require_user_id};

fn internal(e: impl std::fmt::Display) -> RpcFailure {
    RpcFailure::new(RpcErrorCode::Internal, e.to_string())
}

fn not_found(task_id: &str) -> RpcFailure {
    RpcFailure::new(RpcErrorCode::InvalidArgs, format!("no planned task {task_id:?}"))
}

fn tasks_collection(ctx: &RpcContext) -> Result<String, RpcFailure> {
    let mandates_path = require_kwarg_str(ctx, "mandates_path")?;
    Ok(format!("{mandates_path}/tasks"))
}

fn task_json(task: &fabric_core::PlannedTask) -> Value {
    serde_json::to_value(task).unwrap_or(Value::Null)
}

struct ListTasks(Arc<PlannedTaskStore>);

#[async_trait]
impl RpcMethod for ListTasks {
    async fn invoke(&self, ctx: RpcContext) -> Result<Value, RpcFailure> {
        require_user_id(&ctx)?;
        require_company_id(&ctx)?;
        let collection = tasks_collection(&ctx)?;
        let tasks = self.0.list_all(&collection).await.map_err(internal)?;
        Ok(json!({"success": true, "data": {"tasks": tasks.iter().map(task_json).collect::<Vec<_>>()}}))
    }
}

struct ExecuteTask {
    tasks: Arc<PlannedTaskStore>,
    agent: Arc<AgentRuntime>,
}

#[async_trait]
impl RpcMethod for ExecuteTask {
    async fn invoke(&self, ctx: RpcContext) -> Result<Value, RpcFailure> {
        let user_id = require_user_id(&ctx)?;
        let company_id = require_company_id(&ctx)?;
        let collection = tasks_collection(&ctx)?;
        let task_id = require_kwarg_str(&ctx, "task_id")?;
        let task = self
            .tasks
            .load(&collection, task_id)
            .await
            .map_err(internal)?
            .ok_or_else(|| not_found(task_id))?;

        let outcome = self
            .agent
            .execute_task_now(user_id, company_id, &task.thread_key, &task.mission)
            .await
            .map_err(internal)?;
        Ok(json!({
            "success": true,
            "data": {
                "task_id": task_id,
                "waiting_on_lpt": outcome.waiting_on_lpt,
                "mode": match outcome.mode {
                    fabric_core::WorkflowMode::Ui => "ui",
                    fabric_core::WorkflowMode::Backend => "backend",
                },
                "current_turn": outcome.current_turn,
            },
        }))
    }
}

struct ToggleEnabled(Arc<PlannedTaskStore>);

#[async_trait]
impl RpcMethod for ToggleEnabled {
    async fn invoke(&self, ctx: RpcContext) -> Result<Value, RpcFailure> {
        require_user_id(&ctx)?;
        require_company_id(&ctx)?;
        let collection = tasks_collection(&ctx)?;
        let task_id = require_kwarg_str(&ctx, "task_id")?;
        let enabled = ctx
            .kwargs
            .get("enabled")
            .and_then(Value::as_bool)
            .ok_or_else(|| RpcFailure::new(RpcErrorCode::InvalidArgs, "enabled is required"))?;
        self.0
            .load(&collection, task_id)
            .await
            .map_err(internal)?
            .ok_or_else(|| not_found(task_id))?;
        self.0.set_enabled(&collection, task_id, enabled).await.map_err(internal)?;
        Ok(json!({"success": true, "data": {"task_id": task_id, "enabled": enabled}}))
    }
}

struct UpdateTask(Arc<PlannedTaskStore>);

#[async_trait]
impl RpcMethod for UpdateTask {
    async fn invoke(&self, ctx: RpcContext) -> Result<Value, RpcFailure> {
        require_user_id(&ctx)?;
        require_company_id(&ctx)?;
        let collection = tasks_collection(&ctx)?;
        let task_id = require_kwarg_str(&ctx, "task_id")?;
        self.0
            .load(&collection, task_id)
            .await
            .map_err(internal)?
            .ok_or_else(|| not_found(task_id))?;

        let mission = optional_kwarg_str(&ctx, "mission");
        let schedule = optional_kwarg_str(&ctx, "schedule");
        let priority = ctx.kwargs.get("priority").and_then(Value::as_i64);
        self.0
            .update_fields(&collection, task_id, mission, schedule, priority)
            .await
            .map_err(internal)?;
        Ok(json!({"success": true, "data": {"task_id": task_id}}))
    }
}

pub(super) fn register(
    router: &mut RpcRouter,
    tasks: Arc<PlannedTaskStore>,
    agent: Arc<AgentRuntime>,
    settings: &FabricSettings,
) {
    let reg = |name: &'static str, method: Arc<dyn RpcMethod>, default_idempotent: bool| MethodRegistration {
        name,
        method,
        idempotent: idempotent_for(settings, name, default_idempotent),
    };

    router.register(reg("TASK.list", Arc::new(ListTasks(tasks.clone())), false));
    router.register(reg(
        "TASK.execute",
        Arc::new(ExecuteTask { tasks: tasks.clone(), agent }),
        true,
    ));
    router.register(reg("TASK.toggle_enabled", Arc::new(ToggleEnabled(tasks.clone())), true));
    router.register(reg("TASK.update", Arc::new(UpdateTask(tasks)), true));
}
