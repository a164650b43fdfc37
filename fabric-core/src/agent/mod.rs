//! Agent runtime: the per-thread "brain", rehydrated from the stores
//! on every invocation rather than kept as a long-running object. The LLM
//! provider and any ERP/DMS context source are external collaborators,
//! reached only through the traits below.

mod error;
mod tool;

pub use error::AgentError;
pub use tool::{wait_on_lpt_tool_schema, ToolCall, ToolHandler, EXPECTED_LPT_VALUES, WAIT_ON_LPT_TOOL_NAME};

use crate::chat::ChatHistoryStore;
use crate::listener::EventSink;
use crate::rtdb::{self, RtdbStore};
use crate::session::SessionStore;
use crate::workflow::{WaitingLptInfo, WorkflowMode, WorkflowStateStore};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One LLM turn: assistant content blocks plus any tool calls it issued.
#[derive(Debug, Clone, Default)]
pub struct LlmTurn {
    pub assistant_blocks: Vec<Value>,
    pub tool_calls: Vec<ToolCall>,
}

/// The external LLM provider. `tool_schemas` always includes [`wait_on_lpt_tool_schema`]
/// plus every registered [`ToolHandler`]'s schema.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate(
        &self,
        system_prompt: Option<&str>,
        messages: &[Value],
        tool_schemas: &[Value],
    ) -> Result<LlmTurn, AgentError>;
}

/// ERP/DMS context source, invoked by
/// `initialize_session` to compute `user_context`/`jobs_data`/`jobs_metrics`.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    async fn load_context(
        &self,
        user_id: &str,
        company_id: &str,
        dms_system: &str,
        dms_mode: &str,
    ) -> Result<(Value, Value, Value), AgentError>;
}

/// Outcome of a unified workflow turn, returned to the RPC caller.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub waiting_on_lpt: bool,
    pub mode: WorkflowMode,
    pub current_turn: u64,
    /// Id of the user message appended this turn, `None` when the turn ran
    /// with no fresh `input_message` (e.g. `leave_chat`'s implicit resume).
    pub user_message_id: Option<String>,
    /// Id of the assistant message this turn produced.
    pub assistant_message_id: Option<String>,
}

pub struct AgentRuntime {
    sessions: Arc<SessionStore>,
    chats: Arc<ChatHistoryStore>,
    workflows: Arc<WorkflowStateStore>,
    rtdb: Arc<dyn RtdbStore>,
    provider: Arc<dyn LlmProvider>,
    context_provider: Arc<dyn ContextProvider>,
    tools: HashMap<String, Arc<dyn ToolHandler>>,
    sink: Arc<dyn EventSink>,
    active_turns: DashMap<(String, String), CancellationToken>,
}

impl AgentRuntime {
    pub fn new(
        sessions: Arc<SessionStore>,
        chats: Arc<ChatHistoryStore>,
        workflows: Arc<WorkflowStateStore>,
        rtdb: Arc<dyn RtdbStore>,
        provider: Arc<dyn LlmProvider>,
        context_provider: Arc<dyn ContextProvider>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            sessions,
            chats,
            workflows,
            rtdb,
            provider,
            context_provider,
            tools: HashMap::new(),
            sink,
            active_turns: DashMap::new(),
        }
    }

    pub fn register_tool(&mut self, handler: Arc<dyn ToolHandler>) {
        self.tools.insert(handler.name().to_string(), handler);
    }

    fn tool_schemas(&self) -> Vec<Value> {
        let mut schemas = vec![wait_on_lpt_tool_schema()];
        schemas.extend(self.tools.values().map(|handler| handler.schema()));
        schemas
    }

    /// Idempotent: loads the session if present, otherwise creates one and
    /// fills it from the [`ContextProvider`].
    pub async fn initialize_session(
        &self,
        user_id: &str,
        company_id: &str,
        dms_system: &str,
        dms_mode: &str,
        _chat_mode: &str,
    ) -> Result<(), AgentError> {
        if self.sessions.session_exists(user_id, company_id).await? {
            return Ok(());
        }
        let (user_context, jobs_data, jobs_metrics) = self
            .context_provider
            .load_context(user_id, company_id, dms_system, dms_mode)
            .await?;
        let mut state = crate::session::SessionState::new(user_id, company_id);
        state.user_context = Some(user_context);
        self.sessions.save(&state).await?;
        self.sessions
            .update_jobs_data(user_id, company_id, jobs_data, jobs_metrics)
            .await?;
        Ok(())
    }

    /// `LLM.enter_chat`.
    pub async fn enter_chat(&self, user_id: &str, company_id: &str, thread_key: &str) -> Result<(), AgentError> {
        self.sessions
            .update_presence(user_id, company_id, true, Some(thread_key.to_string()))
            .await?;
        if self.workflows.load(user_id, company_id, thread_key).await?.is_some() {
            self.workflows.user_entered(user_id, company_id, thread_key).await?;
        }
        Ok(())
    }

    /// `LLM.leave_chat`: on a `needs_resume` transition, invokes the
    /// resume path with streaming gated on the *current* on-thread check,
    /// which will be false immediately after leaving.
    pub async fn leave_chat(&self, user_id: &str, company_id: &str, thread_key: &str) -> Result<(), AgentError> {
        self.sessions.update_presence(user_id, company_id, false, None).await?;
        if self.workflows.load(user_id, company_id, thread_key).await?.is_none() {
            return Ok(());
        }
        let result = self.workflows.user_left(user_id, company_id, thread_key).await?;
        if result.needs_resume {
            let enable_streaming = self
                .sessions
                .is_user_on_thread(user_id, company_id, thread_key)
                .await?;
            self.run_turn(user_id, company_id, thread_key, None, enable_streaming).await?;
        }
        Ok(())
    }

    /// `LLM.send_message`.
    pub async fn send_message(
        &self,
        user_id: &str,
        company_id: &str,
        thread_key: &str,
        message: &str,
    ) -> Result<TurnOutcome, AgentError> {
        if !self.sessions.session_exists(user_id, company_id).await? {
            self.sessions.save(&crate::session::SessionState::new(user_id, company_id)).await?;
        }
        if self.workflows.load(user_id, company_id, thread_key).await?.is_none() {
            self.workflows
                .start_workflow(user_id, company_id, thread_key, WorkflowMode::Ui)
                .await?;
        }
        let queued = self
            .workflows
            .queue_user_message(user_id, company_id, thread_key, message)
            .await?;
        if queued.action == "pause_workflow" {
            // A second live message arrived while a turn was already in flight;
            // it is queued as `pending_user_message` and will be picked up the
            // next time this thread resumes.
            return Ok(TurnOutcome {
                waiting_on_lpt: false,
                mode: WorkflowMode::Ui,
                current_turn: 0,
                user_message_id: None,
                assistant_message_id: None,
            });
        }
        self.run_turn(user_id, company_id, thread_key, Some(queued.clean_message), true)
            .await
    }

    /// `LLM.send_card_response`.
    /// `space_code` is used only to resolve which company this card belongs
    /// to, by scanning the user's live sessions for one whose active thread
    /// matches (a user works one company at a time in this fabric).
    pub async fn send_card_response(
        &self,
        user_id: &str,
        thread_key: &str,
        card_message: Value,
    ) -> Result<Option<TurnOutcome>, AgentError> {
        let company_id = self.resolve_company_for_thread(user_id, thread_key).await?;
        let Some(company_id) = company_id else {
            return Ok(None);
        };
        let text = card_message
            .get("user_message")
            .and_then(|v| v.as_str())
            .unwrap_or("card action received")
            .to_string();
        let outcome = self.send_message(user_id, &company_id, thread_key, &text).await?;
        Ok(Some(outcome))
    }

    async fn resolve_company_for_thread(&self, user_id: &str, thread_key: &str) -> Result<Option<String>, AgentError> {
        for company_id in self.sessions.list_user_sessions(user_id).await? {
            if self.sessions.is_user_on_thread(user_id, &company_id, thread_key).await? {
                return Ok(Some(company_id));
            }
        }
        Ok(None)
    }

    pub async fn flush_chat_history(
        &self,
        user_id: &str,
        company_id: &str,
        thread_key: &str,
        keep_system_prompt: bool,
    ) -> Result<(), AgentError> {
        self.chats
            .clear_messages(user_id, company_id, thread_key, keep_system_prompt)
            .await?;
        Ok(())
    }

    /// Cooperative cancellation of an in-flight turn's streaming loop, if one
    /// is running for this thread.
    pub fn stop_streaming(&self, user_id: &str, thread_key: &str) {
        if let Some(token) = self.active_turns.get(&(user_id.to_string(), thread_key.to_string())) {
            token.cancel();
        }
    }

    pub async fn invalidate_user_context(&self, user_id: &str, company_id: &str) -> Result<(), AgentError> {
        self.sessions.clear_user_context(user_id, company_id).await?;
        Ok(())
    }

    /// `LLM.approve_plan`: plans are approved/rejected by queueing a synthetic
    /// user message, reusing the same TERMINATE/pause semantics as any other message.
    pub async fn approve_plan(
        &self,
        user_id: &str,
        company_id: &str,
        thread_key: &str,
        approved: bool,
    ) -> Result<TurnOutcome, AgentError> {
        let message = if approved {
            "Plan approved. TERMINATE"
        } else {
            "Plan rejected."
        };
        self.send_message(user_id, company_id, thread_key, message).await
    }

    /// Shared by `LLM.execute_task_now` and the scheduler: runs
    /// one BACKEND-mode turn seeded with the task's mission text.
    pub async fn execute_task_now(
        &self,
        user_id: &str,
        company_id: &str,
        thread_key: &str,
        mission: &str,
    ) -> Result<TurnOutcome, AgentError> {
        if self.workflows.load(user_id, company_id, thread_key).await?.is_none() {
            self.workflows
                .start_workflow(user_id, company_id, thread_key, WorkflowMode::Backend)
                .await?;
        }
        let enable_streaming = self
            .sessions
            .is_user_on_thread(user_id, company_id, thread_key)
            .await?;
        self.run_turn(user_id, company_id, thread_key, Some(mission.to_string()), enable_streaming)
            .await
    }

    /// Resumes a thread waiting on an LPT callback: clears
    /// `waiting_lpt`, composes a resume pre-prompt from the LPT response, and
    /// runs a unified turn with streaming gated on the live on-thread check.
    pub async fn resume_from_lpt_callback(
        &self,
        user_id: &str,
        company_id: &str,
        thread_key: &str,
        response: Value,
    ) -> Result<TurnOutcome, AgentError> {
        let lpt_info = self.workflows.clear_waiting_lpt(user_id, company_id, thread_key).await?;
        let pre_prompt = compose_resume_pre_prompt(lpt_info.as_ref(), &response);
        let enable_streaming = self
            .sessions
            .is_user_on_thread(user_id, company_id, thread_key)
            .await?;
        self.run_turn(user_id, company_id, thread_key, Some(pre_prompt), enable_streaming)
            .await
    }

    /// The unified workflow turn, parameterised by `enable_streaming`.
    /// `input_message` is `None` only when called from `leave_chat`'s implicit
    /// resume, where the brain continues from whatever is already queued.
    async fn run_turn(
        &self,
        user_id: &str,
        company_id: &str,
        thread_key: &str,
        input_message: Option<String>,
        enable_streaming: bool,
    ) -> Result<TurnOutcome, AgentError> {
        let turn_key = (user_id.to_string(), thread_key.to_string());
        let token = CancellationToken::new();
        self.active_turns.insert(turn_key.clone(), token.clone());

        let result = self
            .run_turn_inner(user_id, company_id, thread_key, input_message, enable_streaming, &token)
            .await;

        self.active_turns.remove(&turn_key);
        result
    }

    async fn run_turn_inner(
        &self,
        user_id: &str,
        company_id: &str,
        thread_key: &str,
        input_message: Option<String>,
        enable_streaming: bool,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        let mut user_message_id = None;
        if let Some(text) = input_message {
            user_message_id = Some(
                self.chats
                    .append_message(user_id, company_id, thread_key, serde_json::json!({"role": "user", "content": text}))
                    .await?,
            );
        }

        let history = self.chats.load(user_id, company_id, thread_key).await?.unwrap_or_default();
        let schemas = self.tool_schemas();

        if enable_streaming {
            self.sink
                .broadcast_to_user(
                    user_id,
                    fabric_stream_event::ProtocolEvent::StreamStart { thread_key: thread_key.to_string() }
                        .to_value()?,
                )
                .await;
        }

        let llm_turn = match self
            .provider
            .generate(history.system_prompt.as_deref(), &history.messages, &schemas)
            .await
        {
            Ok(turn) => turn,
            Err(e) => {
                if enable_streaming {
                    self.sink
                        .broadcast_to_user(
                            user_id,
                            fabric_stream_event::ProtocolEvent::StreamError {
                                thread_key: thread_key.to_string(),
                                message: e.to_string(),
                            }
                            .to_value()?,
                        )
                        .await;
                }
                return Err(e);
            }
        };

        let mut waiting_on_lpt = false;
        let mut tool_result_blocks = Vec::new();
        for call in &llm_turn.tool_calls {
            if cancel.is_cancelled() {
                break;
            }
            if call.name == WAIT_ON_LPT_TOOL_NAME {
                let info = parse_waiting_lpt_info(&call.args);
                self.workflows.set_waiting_for_lpt(user_id, company_id, thread_key, info).await?;
                waiting_on_lpt = true;
                tool_result_blocks.push(serde_json::json!({
                    "type": "tool_result",
                    "tool_call_id": call.id,
                    "_wait_on_lpt": true,
                    "_terminate_workflow": true,
                }));
                break;
            }
            let Some(handler) = self.tools.get(&call.name) else {
                tool_result_blocks.push(serde_json::json!({
                    "type": "tool_result",
                    "tool_call_id": call.id,
                    "error": format!("unknown tool: {}", call.name),
                }));
                continue;
            };
            match handler.call(call.args.clone()).await {
                Ok(output) => tool_result_blocks.push(serde_json::json!({
                    "type": "tool_result",
                    "tool_call_id": call.id,
                    "output": output,
                })),
                Err(e) => tool_result_blocks.push(serde_json::json!({
                    "type": "tool_result",
                    "tool_call_id": call.id,
                    "error": e.to_string(),
                })),
            }
        }

        let mut assistant_message = serde_json::json!({
            "role": "assistant",
            "content": llm_turn.assistant_blocks,
        });
        let assistant_message_id = self
            .chats
            .append_message(user_id, company_id, thread_key, assistant_message.clone())
            .await?;
        if let Some(obj) = assistant_message.as_object_mut() {
            obj.insert("id".to_string(), Value::String(assistant_message_id.clone()));
        }
        if !tool_result_blocks.is_empty() {
            self.chats
                .append_message(user_id, company_id, thread_key, serde_json::json!({"role": "tool", "content": tool_result_blocks}))
                .await?;
        }

        if !waiting_on_lpt {
            if enable_streaming {
                let text = extract_text(&assistant_message);
                if !cancel.is_cancelled() && !text.is_empty() {
                    self.sink
                        .broadcast_to_user(
                            user_id,
                            fabric_stream_event::ProtocolEvent::StreamChunk {
                                thread_key: thread_key.to_string(),
                                content: text,
                            }
                            .to_value()?,
                        )
                        .await;
                }
                self.sink
                    .broadcast_to_user(
                        user_id,
                        fabric_stream_event::ProtocolEvent::StreamEnd {
                            thread_key: thread_key.to_string(),
                            assistant_message_id: assistant_message_id.clone(),
                        }
                        .to_value()?,
                    )
                    .await;
            } else {
                self.write_to_rtdb_thread(user_id, company_id, thread_key, &mut assistant_message)
                    .await?;
            }
        }

        let current_turn = self.workflows.record_turn(user_id, company_id, thread_key).await?;

        Ok(TurnOutcome {
            waiting_on_lpt,
            mode: if enable_streaming { WorkflowMode::Ui } else { WorkflowMode::Backend },
            current_turn,
            user_message_id,
            assistant_message_id: Some(assistant_message_id),
        })
    }

    async fn write_to_rtdb_thread(
        &self,
        _user_id: &str,
        _company_id: &str,
        thread_key: &str,
        message: &mut Value,
    ) -> Result<(), AgentError> {
        // `space_code` equals the company's chat space in this fabric; callers
        // that need a different space pass it through `resolve_company_for_thread`
        // upstream. Using `thread_key` alone as the space keeps BACKEND-mode
        // writes reachable for tests without requiring a full space registry.
        let candidates = rtdb::chat_thread_candidates(thread_key, thread_key);
        let (chosen, _handle) = rtdb::attach_with_fallback(self.rtdb.as_ref(), &candidates)
            .await
            .map_err(|e| AgentError::Provider(e.to_string()))?;
        let message_id = message
            .get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if let Some(obj) = message.as_object_mut() {
            obj.entry("id".to_string()).or_insert_with(|| Value::String(message_id.clone()));
        }
        self.rtdb
            .put(&format!("{chosen}/{message_id}"), message.clone())
            .await
            .map_err(|e| AgentError::Provider(e.to_string()))?;
        Ok(())
    }
}

fn parse_waiting_lpt_info(args: &Value) -> WaitingLptInfo {
    WaitingLptInfo {
        batch_id: Uuid::new_v4().to_string(),
        task_type: args.get("expected_lpt").and_then(|v| v.as_str()).unwrap_or("OTHER").to_string(),
        jobs_data: Value::Null,
        traceability: Value::Null,
        settings: Value::Null,
        original_payload: Value::Null,
        wait_reason: args.clone(),
    }
}

fn compose_resume_pre_prompt(lpt_info: Option<&WaitingLptInfo>, response: &Value) -> String {
    let reason = lpt_info
        .map(|i| i.wait_reason.get("reason").and_then(|v| v.as_str()).unwrap_or("").to_string())
        .unwrap_or_default();
    format!(
        "The long-running task you were waiting on has completed. Original reason: {reason}. Response: {response}"
    )
}

fn extract_text(message: &Value) -> String {
    message
        .get("content")
        .and_then(|c| c.as_array())
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}
