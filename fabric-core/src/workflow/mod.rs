//! Workflow state store, key
//! `workflow:{uid}:{cid}:{thread_key}:state`, TTL 1h live / 5min completed.
//!
//! The state machine transitions are implemented as pure
//! functions over [`WorkflowState`]; [`WorkflowStateStore`] wraps them in the
//! store's load-mutate-save pattern so every transition is atomic from the
//! caller's point of view.

mod error;

pub use error::WorkflowStateError;

use crate::kv::KvStore;
use crate::namespace::{self, WORKFLOW_TTL_ACTIVE, WORKFLOW_TTL_COMPLETED};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Paused,
    WaitingLpt,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowMode {
    Ui,
    Backend,
}

/// PendingLPT, stored inline as `waiting_lpt_info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitingLptInfo {
    pub batch_id: String,
    pub task_type: String,
    #[serde(default)]
    pub jobs_data: serde_json::Value,
    #[serde(default)]
    pub traceability: serde_json::Value,
    #[serde(default)]
    pub settings: serde_json::Value,
    #[serde(default)]
    pub original_payload: serde_json::Value,
    /// The raw tool-call reason/expected_lpt/step_waiting the agent supplied
    /// to `WAIT_ON_LPT`, kept verbatim for the
    /// resume pre-prompt.
    #[serde(default)]
    pub wait_reason: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub user_id: String,
    pub company_id: String,
    pub thread_key: String,
    pub status: WorkflowStatus,
    pub mode: WorkflowMode,
    pub user_present: bool,
    #[serde(default)]
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pause_reason: Option<String>,
    #[serde(default)]
    pub pending_user_message: Option<String>,
    #[serde(default)]
    pub current_turn: u64,
    #[serde(default)]
    pub waiting_lpt_info: Option<WaitingLptInfo>,
    #[serde(default)]
    pub waiting_lpt_since: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl WorkflowState {
    pub fn start(user_id: &str, company_id: &str, thread_key: &str, initial_mode: WorkflowMode) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.to_string(),
            company_id: company_id.to_string(),
            thread_key: thread_key.to_string(),
            status: WorkflowStatus::Running,
            mode: initial_mode,
            user_present: initial_mode == WorkflowMode::Ui,
            paused_at: None,
            pause_reason: None,
            pending_user_message: None,
            current_turn: 0,
            waiting_lpt_info: None,
            waiting_lpt_since: None,
            started_at: now,
            last_activity: now,
        }
    }

    /// Flips the workflow back to UI mode on reconnect, reporting whether it
    /// was paused so the caller knows whether a resume is implied.
    pub fn user_entered(&mut self) -> UserEnteredResult {
        let was_paused = self.status == WorkflowStatus::Paused;
        self.mode = WorkflowMode::Ui;
        self.user_present = true;
        if was_paused {
            // "running (implicit resume on next message)": the state flips to
            // running immediately but no turn executes here -- the caller
            // still has to send a message for the brain to actually resume.
            self.status = WorkflowStatus::Running;
        }
        self.last_activity = Utc::now();
        UserEnteredResult {
            workflow_paused: was_paused,
        }
    }

    /// Switches the workflow to BACKEND mode, resuming it if it was paused
    /// waiting on the user who just left.
    pub fn user_left(&mut self) -> UserLeftResult {
        self.user_present = false;
        self.mode = WorkflowMode::Backend;
        self.last_activity = Utc::now();
        match self.status {
            WorkflowStatus::Paused => {
                self.status = WorkflowStatus::Running;
                self.pause_reason = Some("user_left".to_string());
                UserLeftResult {
                    needs_resume: true,
                    resume_reason: Some("user_left".to_string()),
                    new_mode: WorkflowMode::Backend,
                }
            }
            WorkflowStatus::Running | WorkflowStatus::WaitingLpt => UserLeftResult {
                needs_resume: false,
                resume_reason: None,
                new_mode: WorkflowMode::Backend,
            },
            WorkflowStatus::Completed => UserLeftResult {
                needs_resume: false,
                resume_reason: None,
                new_mode: WorkflowMode::Backend,
            },
        }
    }

    /// Distinguishes a `TERMINATE`-suffixed message (resumes the workflow in
    /// UI mode immediately) from a plain message (pauses the workflow until
    /// the brain picks it up). `message` is the raw chat text.
    pub fn queue_user_message(&mut self, message: &str) -> QueueMessageResult {
        let trimmed = message.trim();
        let is_terminate = trimmed.to_uppercase().ends_with("TERMINATE");
        self.last_activity = Utc::now();

        if is_terminate {
            let clean = strip_terminate_suffix(trimmed);
            self.status = WorkflowStatus::Running;
            self.mode = WorkflowMode::Ui;
            self.user_present = true;
            self.pending_user_message = Some(clean.clone());
            QueueMessageResult {
                queued: true,
                is_terminate: true,
                clean_message: clean,
                action: "resume_workflow_ui",
                mode: WorkflowMode::Ui,
            }
        } else {
            self.status = WorkflowStatus::Paused;
            self.pause_reason = Some("user_message".to_string());
            self.paused_at = Some(Utc::now());
            self.pending_user_message = Some(trimmed.to_string());
            QueueMessageResult {
                queued: true,
                is_terminate: false,
                clean_message: trimmed.to_string(),
                action: "pause_workflow",
                mode: self.mode,
            }
        }
    }

    pub fn set_waiting_for_lpt(&mut self, info: WaitingLptInfo) {
        self.status = WorkflowStatus::WaitingLpt;
        self.waiting_lpt_info = Some(info);
        self.waiting_lpt_since = Some(Utc::now());
        self.last_activity = Utc::now();
    }

    /// Returns the stored LPT info, clearing it, and transitions back to running.
    pub fn clear_waiting_lpt(&mut self) -> Option<WaitingLptInfo> {
        self.status = WorkflowStatus::Running;
        self.waiting_lpt_since = None;
        self.last_activity = Utc::now();
        self.waiting_lpt_info.take()
    }

    pub fn end_workflow(&mut self, _status_note: Option<String>) {
        self.status = WorkflowStatus::Completed;
        self.last_activity = Utc::now();
    }

    fn ttl(&self) -> std::time::Duration {
        match self.status {
            WorkflowStatus::Completed => WORKFLOW_TTL_COMPLETED,
            _ => WORKFLOW_TTL_ACTIVE,
        }
    }
}

fn strip_terminate_suffix(trimmed: &str) -> String {
    let upper = trimmed.to_uppercase();
    debug_assert!(upper.ends_with("TERMINATE"));
    let cut = trimmed.len() - "TERMINATE".len();
    trimmed[..cut].trim_end().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UserEnteredResult {
    pub workflow_paused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserLeftResult {
    pub needs_resume: bool,
    pub resume_reason: Option<String>,
    pub new_mode: WorkflowMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueMessageResult {
    pub queued: bool,
    pub is_terminate: bool,
    pub clean_message: String,
    pub action: &'static str,
    pub mode: WorkflowMode,
}

pub struct WorkflowStateStore {
    kv: Arc<dyn KvStore>,
}

impl WorkflowStateStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    async fn write(&self, state: &WorkflowState) -> Result<(), WorkflowStateError> {
        let key = namespace::workflow_state_key(&state.user_id, &state.company_id, &state.thread_key);
        let payload = serde_json::to_string(state)?;
        self.kv.setex(&key, &payload, state.ttl()).await?;
        Ok(())
    }

    pub async fn load(
        &self,
        uid: &str,
        cid: &str,
        thread_key: &str,
    ) -> Result<Option<WorkflowState>, WorkflowStateError> {
        let key = namespace::workflow_state_key(uid, cid, thread_key);
        match self.kv.get(&key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn start_workflow(
        &self,
        uid: &str,
        cid: &str,
        thread_key: &str,
        initial_mode: WorkflowMode,
    ) -> Result<WorkflowState, WorkflowStateError> {
        let state = WorkflowState::start(uid, cid, thread_key, initial_mode);
        self.write(&state).await?;
        Ok(state)
    }

    async fn mutate<F, R>(
        &self,
        uid: &str,
        cid: &str,
        thread_key: &str,
        f: F,
    ) -> Result<(WorkflowState, R), WorkflowStateError>
    where
        F: FnOnce(&mut WorkflowState) -> R,
    {
        let mut state = self
            .load(uid, cid, thread_key)
            .await?
            .ok_or(WorkflowStateError::NotFound)?;
        let result = f(&mut state);
        self.write(&state).await?;
        Ok((state, result))
    }

    pub async fn user_entered(
        &self,
        uid: &str,
        cid: &str,
        thread_key: &str,
    ) -> Result<UserEnteredResult, WorkflowStateError> {
        let (_, result) = self.mutate(uid, cid, thread_key, |s| s.user_entered()).await?;
        Ok(result)
    }

    pub async fn user_left(
        &self,
        uid: &str,
        cid: &str,
        thread_key: &str,
    ) -> Result<UserLeftResult, WorkflowStateError> {
        let (_, result) = self.mutate(uid, cid, thread_key, |s| s.user_left()).await?;
        Ok(result)
    }

    pub async fn queue_user_message(
        &self,
        uid: &str,
        cid: &str,
        thread_key: &str,
        message: &str,
    ) -> Result<QueueMessageResult, WorkflowStateError> {
        let (_, result) = self
            .mutate(uid, cid, thread_key, |s| s.queue_user_message(message))
            .await?;
        Ok(result)
    }

    pub async fn set_waiting_for_lpt(
        &self,
        uid: &str,
        cid: &str,
        thread_key: &str,
        info: WaitingLptInfo,
    ) -> Result<(), WorkflowStateError> {
        self.mutate(uid, cid, thread_key, |s| s.set_waiting_for_lpt(info)).await?;
        Ok(())
    }

    pub async fn clear_waiting_lpt(
        &self,
        uid: &str,
        cid: &str,
        thread_key: &str,
    ) -> Result<Option<WaitingLptInfo>, WorkflowStateError> {
        let (_, info) = self.mutate(uid, cid, thread_key, |s| s.clear_waiting_lpt()).await?;
        Ok(info)
    }

    pub async fn end_workflow(
        &self,
        uid: &str,
        cid: &str,
        thread_key: &str,
    ) -> Result<(), WorkflowStateError> {
        self.mutate(uid, cid, thread_key, |s| s.end_workflow(None)).await?;
        Ok(())
    }

    /// Increments `current_turn` and refreshes `last_activity`.
    pub async fn record_turn(
        &self,
        uid: &str,
        cid: &str,
        thread_key: &str,
    ) -> Result<u64, WorkflowStateError> {
        let (state, _) = self
            .mutate(uid, cid, thread_key, |s| {
                s.current_turn += 1;
                s.last_activity = Utc::now();
            })
            .await?;
        Ok(state.current_turn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKv;

    fn store() -> WorkflowStateStore {
        WorkflowStateStore::new(Arc::new(InMemoryKv::new()))
    }

    #[tokio::test]
    async fn terminate_suffix_resumes_ui_and_strips_sentinel() {
        let store = store();
        store.start_workflow("u1", "c1", "t1", WorkflowMode::Ui).await.unwrap();
        store
            .mutate("u1", "c1", "t1", |s| s.status = WorkflowStatus::Paused)
            .await
            .unwrap();

        let result = store
            .queue_user_message("u1", "c1", "t1", "OK continue TERMINATE")
            .await
            .unwrap();
        assert!(result.is_terminate);
        assert_eq!(result.clean_message, "OK continue");
        assert_eq!(result.action, "resume_workflow_ui");

        let state = store.load("u1", "c1", "t1").await.unwrap().unwrap();
        assert_eq!(state.status, WorkflowStatus::Running);
        assert_eq!(state.mode, WorkflowMode::Ui);
        assert!(state.user_present);
    }

    #[tokio::test]
    async fn non_terminate_message_pauses_without_changing_mode() {
        let store = store();
        store.start_workflow("u1", "c1", "t1", WorkflowMode::Ui).await.unwrap();
        let result = store.queue_user_message("u1", "c1", "t1", "just a question").await.unwrap();
        assert!(!result.is_terminate);
        assert_eq!(result.action, "pause_workflow");

        let state = store.load("u1", "c1", "t1").await.unwrap().unwrap();
        assert_eq!(state.status, WorkflowStatus::Paused);
        assert_eq!(state.mode, WorkflowMode::Ui);
    }

    #[tokio::test]
    async fn user_left_while_paused_requires_resume_exactly_once() {
        let store = store();
        store.start_workflow("u1", "c1", "t1", WorkflowMode::Ui).await.unwrap();
        store.queue_user_message("u1", "c1", "t1", "hold on").await.unwrap();

        let result = store.user_left("u1", "c1", "t1").await.unwrap();
        assert!(result.needs_resume);
        assert_eq!(result.resume_reason.as_deref(), Some("user_left"));
        assert_eq!(result.new_mode, WorkflowMode::Backend);

        let state = store.load("u1", "c1", "t1").await.unwrap().unwrap();
        assert_eq!(state.status, WorkflowStatus::Running);
        assert_eq!(state.mode, WorkflowMode::Backend);
    }

    #[tokio::test]
    async fn user_left_while_running_does_not_request_resume() {
        let store = store();
        store.start_workflow("u1", "c1", "t1", WorkflowMode::Ui).await.unwrap();
        let result = store.user_left("u1", "c1", "t1").await.unwrap();
        assert!(!result.needs_resume);
        let state = store.load("u1", "c1", "t1").await.unwrap().unwrap();
        assert_eq!(state.status, WorkflowStatus::Running);
        assert_eq!(state.mode, WorkflowMode::Backend);
    }

    #[tokio::test]
    async fn waiting_lpt_round_trip() {
        let store = store();
        store.start_workflow("u1", "c1", "t1", WorkflowMode::Backend).await.unwrap();
        let info = WaitingLptInfo {
            batch_id: "b1".to_string(),
            task_type: "LPT_APBookkeeper".to_string(),
            jobs_data: serde_json::json!([]),
            traceability: serde_json::json!({"thread_key": "t1"}),
            settings: serde_json::json!({}),
            original_payload: serde_json::json!({}),
            wait_reason: serde_json::json!({"reason": "booking invoices"}),
        };
        store.set_waiting_for_lpt("u1", "c1", "t1", info).await.unwrap();
        let state = store.load("u1", "c1", "t1").await.unwrap().unwrap();
        assert_eq!(state.status, WorkflowStatus::WaitingLpt);

        let recovered = store.clear_waiting_lpt("u1", "c1", "t1").await.unwrap().unwrap();
        assert_eq!(recovered.batch_id, "b1");
        let state = store.load("u1", "c1", "t1").await.unwrap().unwrap();
        assert_eq!(state.status, WorkflowStatus::Running);
        assert!(state.waiting_lpt_info.is_none());
    }

    #[tokio::test]
    async fn at_most_one_running_workflow_per_thread() {
        // property 3: a second concurrent non-terminate message pauses
        // rather than spawning a second live turn.
        let store = store();
        store.start_workflow("u1", "c1", "t1", WorkflowMode::Ui).await.unwrap();
        store.queue_user_message("u1", "c1", "t1", "first").await.unwrap();
        let state = store.load("u1", "c1", "t1").await.unwrap().unwrap();
        assert_eq!(state.status, WorkflowStatus::Paused);
    }
}
