//! `LLM.*` RPC methods, each a thin `RpcMethod` wrapper
//! around the corresponding `AgentRuntime` call.

use std::sync::Arc;

use async_trait::async_trait;
use fabric_config::FabricSettings;
use fabric_core::{AgentRuntime, MethodRegistration, RpcContext, RpcErrorCode, RpcFailure, RpcMethod, RpcRouter};
use serde_json::{json, Value};

use super::{idempotent_for, optional_kwarg_bool, optional_kwarg_str, require_company_id, require_kwarg_str, require_user_id};

fn turn_outcome_json(outcome: &fabric_core::TurnOutcome) -> Value {
    json!({
        "waiting_on_lpt": outcome.waiting_on_lpt,
        "mode": match outcome.mode {
            fabric_core::WorkflowMode::Ui => "ui",
            fabric_core::WorkflowMode::Backend => "backend",
        },
        "current_turn": outcome.current_turn,
        "user_message_id": outcome.user_message_id,
        "assistant_message_id": outcome.assistant_message_id,
    })
}

fn internal(e: impl std::fmt::Display) -> RpcFailure {
    RpcFailure::new(RpcErrorCode::Internal, e.to_string())
}

struct InitializeSession(Arc<AgentRuntime>);

#[async_trait]
impl RpcMethod for InitializeSession {
    async fn invoke(&self, ctx: RpcContext) -> Result<Value, RpcFailure> {
        let user_id = require_user_id(&ctx)?;
        let company_id = require_company_id(&ctx)?;
        let dms_system = optional_kwarg_str(&ctx, "dms_system").unwrap_or("");
        let dms_mode = optional_kwarg_str(&ctx, "dms_mode").unwrap_or("");
        let chat_mode = optional_kwarg_str(&ctx, "chat_mode").unwrap_or("");
        self.0
            .initialize_session(user_id, company_id, dms_system, dms_mode, chat_mode)
            .await
            .map_err(internal)?;
        Ok(json!({"initialized": true}))
    }
}

struct SendMessage(Arc<AgentRuntime>);

#[async_trait]
impl RpcMethod for SendMessage {
    async fn invoke(&self, ctx: RpcContext) -> Result<Value, RpcFailure> {
        let user_id = require_user_id(&ctx)?;
        let company_id = require_company_id(&ctx)?;
        let thread_key = require_kwarg_str(&ctx, "thread_key")?;
        let message = require_kwarg_str(&ctx, "message")?;
        let outcome = self
            .0
            .send_message(user_id, company_id, thread_key, message)
            .await
            .map_err(internal)?;
        let mut data = turn_outcome_json(&outcome);
        data["success"] = json!(true);
        Ok(data)
    }
}

struct EnterChat(Arc<AgentRuntime>);

#[async_trait]
impl RpcMethod for EnterChat {
    async fn invoke(&self, ctx: RpcContext) -> Result<Value, RpcFailure> {
        let user_id = require_user_id(&ctx)?;
        let company_id = require_company_id(&ctx)?;
        let thread_key = require_kwarg_str(&ctx, "thread_key")?;
        self.0.enter_chat(user_id, company_id, thread_key).await.map_err(internal)?;
        Ok(json!({"ok": true}))
    }
}

struct LeaveChat(Arc<AgentRuntime>);

#[async_trait]
impl RpcMethod for LeaveChat {
    async fn invoke(&self, ctx: RpcContext) -> Result<Value, RpcFailure> {
        let user_id = require_user_id(&ctx)?;
        let company_id = require_company_id(&ctx)?;
        let thread_key = require_kwarg_str(&ctx, "thread_key")?;
        self.0.leave_chat(user_id, company_id, thread_key).await.map_err(internal)?;
        Ok(json!({"ok": true}))
    }
}

struct FlushChatHistory(Arc<AgentRuntime>);

#[async_trait]
impl RpcMethod for FlushChatHistory {
    async fn invoke(&self, ctx: RpcContext) -> Result<Value, RpcFailure> {
        let user_id = require_user_id(&ctx)?;
        let company_id = require_company_id(&ctx)?;
        let thread_key = require_kwarg_str(&ctx, "thread_key")?;
        let keep_system_prompt = optional_kwarg_bool(&ctx, "keep_system_prompt", true);
        self.0
            .flush_chat_history(user_id, company_id, thread_key, keep_system_prompt)
            .await
            .map_err(internal)?;
        Ok(json!({"ok": true}))
    }
}

struct StopStreaming(Arc<AgentRuntime>);

#[async_trait]
impl RpcMethod for StopStreaming {
    async fn invoke(&self, ctx: RpcContext) -> Result<Value, RpcFailure> {
        let user_id = require_user_id(&ctx)?;
        let thread_key = require_kwarg_str(&ctx, "thread_key")?;
        self.0.stop_streaming(user_id, thread_key);
        Ok(json!({"ok": true}))
    }
}

struct ApprovePlan(Arc<AgentRuntime>);

#[async_trait]
impl RpcMethod for ApprovePlan {
    async fn invoke(&self, ctx: RpcContext) -> Result<Value, RpcFailure> {
        let user_id = require_user_id(&ctx)?;
        let company_id = require_company_id(&ctx)?;
        let thread_key = require_kwarg_str(&ctx, "thread_key")?;
        let approved = optional_kwarg_bool(&ctx, "approved", false);
        let outcome = self
            .0
            .approve_plan(user_id, company_id, thread_key, approved)
            .await
            .map_err(internal)?;
        Ok(turn_outcome_json(&outcome))
    }
}

struct SendCardResponse(Arc<AgentRuntime>);

#[async_trait]
impl RpcMethod for SendCardResponse {
    async fn invoke(&self, ctx: RpcContext) -> Result<Value, RpcFailure> {
        let user_id = require_user_id(&ctx)?;
        let thread_key = require_kwarg_str(&ctx, "thread_key")?;
        let card_message = ctx.kwargs.get("card_message").cloned().unwrap_or(json!({}));
        let outcome = self
            .0
            .send_card_response(user_id, thread_key, card_message)
            .await
            .map_err(internal)?;
        Ok(match outcome {
            Some(o) => turn_outcome_json(&o),
            None => json!({"resolved": false}),
        })
    }
}

struct InvalidateUserContext(Arc<AgentRuntime>);

#[async_trait]
impl RpcMethod for InvalidateUserContext {
    async fn invoke(&self, ctx: RpcContext) -> Result<Value, RpcFailure> {
        let user_id = require_user_id(&ctx)?;
        let company_id = require_company_id(&ctx)?;
        self.0.invalidate_user_context(user_id, company_id).await.map_err(internal)?;
        Ok(json!({"ok": true}))
    }
}

struct ExecuteTaskNow(Arc<AgentRuntime>);

#[async_trait]
impl RpcMethod for ExecuteTaskNow {
    async fn invoke(&self, ctx: RpcContext) -> Result<Value, RpcFailure> {
        let user_id = require_user_id(&ctx)?;
        let company_id = require_company_id(&ctx)?;
        let thread_key = require_kwarg_str(&ctx, "thread_key")?;
        let mission = optional_kwarg_str(&ctx, "mission").unwrap_or("");
        let outcome = self
            .0
            .execute_task_now(user_id, company_id, thread_key, mission)
            .await
            .map_err(internal)?;
        Ok(turn_outcome_json(&outcome))
    }
}

pub(super) fn register(router: &mut RpcRouter, agent: Arc<AgentRuntime>, settings: &FabricSettings) {
    let reg = |name: &'static str, method: Arc<dyn RpcMethod>, default_idempotent: bool| MethodRegistration {
        name,
        method,
        idempotent: idempotent_for(settings, name, default_idempotent),
    };

    router.register(reg("LLM.initialize_session", Arc::new(InitializeSession(agent.clone())), true));
    router.register(reg("LLM.send_message", Arc::new(SendMessage(agent.clone())), true));
    router.register(reg("LLM.enter_chat", Arc::new(EnterChat(agent.clone())), false));
    router.register(reg("LLM.leave_chat", Arc::new(LeaveChat(agent.clone())), false));
    router.register(reg("LLM.flush_chat_history", Arc::new(FlushChatHistory(agent.clone())), true));
    router.register(reg("LLM.stop_streaming", Arc::new(StopStreaming(agent.clone())), false));
    router.register(reg("LLM.approve_plan", Arc::new(ApprovePlan(agent.clone())), true));
    router.register(reg("LLM.send_card_response", Arc::new(SendCardResponse(agent.clone())), true));
    router.register(reg("LLM.invalidate_user_context", Arc::new(InvalidateUserContext(agent.clone())), true));
    router.register(reg("LLM.execute_task_now", Arc::new(ExecuteTaskNow(agent)), true));
}
