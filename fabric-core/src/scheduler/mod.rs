//! Scheduled-task executor: periodically scans `PlannedTask` documents,
//! claims due ones with a distributed lock, and runs them through the agent
//! runtime in BACKEND mode.
//!
//! The original `cron_scheduler` module wasn't available for direct grounding
//! (see DESIGN.md); this follows the documented tick-loop design, reusing the
//! KV `SET NX` + TTL lock idiom already established for RPC idempotency
//! (`rpc::RpcRouter::dispatch_inner`) and the periodic-task/non-halting-failure
//! shape of `task_service.py`'s Celery beat schedule.

mod error;

pub use error::SchedulerError;

use crate::agent::AgentRuntime;
use crate::docdb::{DocDbStore, QueryFilter};
use crate::kv::KvStore;
use crate::namespace::{self, CRON_LOCK_TTL};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// How often the scheduler scans for due tasks.
pub const TICK_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Idle,
    Running,
    Failed,
}

/// One scheduled mission. Lives at `{collection_path}/{task_id}` in DocDB, with
/// `collection_path` rooted under the owning company's mandates path so the
/// same document a human edits (enable/disable, change the mission text) is
/// the one the scheduler reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedTask {
    pub task_id: String,
    pub user_id: String,
    pub company_id: String,
    pub thread_key: String,
    pub mission: String,
    /// Cron-like schedule expression; the scheduler only cares about
    /// `next_execution_utc`, which whatever wrote the schedule keeps current.
    pub schedule: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub status: TaskStatusOpt,
    #[serde(default)]
    pub priority: i64,
    pub next_execution_utc: DateTime<Utc>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

fn default_true() -> bool {
    true
}

/// `status` is absent on a freshly-created task, so model it as an `Option`
/// without forcing every caller to match on a dedicated `NotRun` variant.
pub type TaskStatusOpt = Option<TaskStatus>;

pub struct PlannedTaskStore {
    docdb: Arc<dyn DocDbStore>,
}

impl PlannedTaskStore {
    pub fn new(docdb: Arc<dyn DocDbStore>) -> Self {
        Self { docdb }
    }

    pub async fn upsert(&self, collection_path: &str, task: &PlannedTask) -> Result<(), SchedulerError> {
        let path = format!("{collection_path}/{}", task.task_id);
        let value = serde_json::to_value(task)?;
        self.docdb.set(&path, value, false).await?;
        Ok(())
    }

    pub async fn load(&self, collection_path: &str, task_id: &str) -> Result<Option<PlannedTask>, SchedulerError> {
        let path = format!("{collection_path}/{task_id}");
        match self.docdb.get(&path).await? {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    /// Every enabled task in the collection, regardless of due-ness; due
    /// filtering happens in Rust since `next_execution_utc <= now` isn't an
    /// equality filter the `DocDbStore::query` contract supports.
    pub async fn list_enabled(&self, collection_path: &str) -> Result<Vec<PlannedTask>, SchedulerError> {
        let rows = self
            .docdb
            .query(collection_path, &[QueryFilter::eq("enabled", serde_json::Value::Bool(true))], None, None)
            .await?;
        rows.into_iter()
            .map(|(_, v)| serde_json::from_value(v).map_err(SchedulerError::from))
            .collect()
    }

    /// Every task in the collection, enabled or not -- the `TASK.list` RPC
    /// surface over the same documents the tick loop scans.
    pub async fn list_all(&self, collection_path: &str) -> Result<Vec<PlannedTask>, SchedulerError> {
        let rows = self.docdb.query(collection_path, &[], Some("priority"), None).await?;
        rows.into_iter()
            .map(|(_, v)| serde_json::from_value(v).map_err(SchedulerError::from))
            .collect()
    }

    /// Flips `enabled` on an existing task, leaving every other field as-is.
    pub async fn set_enabled(&self, collection_path: &str, task_id: &str, enabled: bool) -> Result<(), SchedulerError> {
        let path = format!("{collection_path}/{task_id}");
        self.docdb.set(&path, serde_json::json!({"enabled": enabled}), true).await?;
        Ok(())
    }

    /// Merges `mission`/`schedule`/`priority` into an existing task document;
    /// fields left `None` by the caller are untouched.
    pub async fn update_fields(
        &self,
        collection_path: &str,
        task_id: &str,
        mission: Option<&str>,
        schedule: Option<&str>,
        priority: Option<i64>,
    ) -> Result<(), SchedulerError> {
        let mut patch = serde_json::Map::new();
        if let Some(mission) = mission {
            patch.insert("mission".to_string(), serde_json::Value::String(mission.to_string()));
        }
        if let Some(schedule) = schedule {
            patch.insert("schedule".to_string(), serde_json::Value::String(schedule.to_string()));
        }
        if let Some(priority) = priority {
            patch.insert("priority".to_string(), serde_json::json!(priority));
        }
        if patch.is_empty() {
            return Ok(());
        }
        let path = format!("{collection_path}/{task_id}");
        self.docdb.set(&path, serde_json::Value::Object(patch), true).await?;
        Ok(())
    }

    async fn mark_running(&self, collection_path: &str, task_id: &str) -> Result<(), SchedulerError> {
        let path = format!("{collection_path}/{task_id}");
        self.docdb
            .set(&path, serde_json::json!({"status": "running"}), true)
            .await?;
        Ok(())
    }

    async fn record_success(
        &self,
        collection_path: &str,
        task_id: &str,
        ran_at: DateTime<Utc>,
        next_execution_utc: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let path = format!("{collection_path}/{task_id}");
        self.docdb
            .set(
                &path,
                serde_json::json!({
                    "status": "idle",
                    "last_run_at": ran_at.to_rfc3339(),
                    "last_error": serde_json::Value::Null,
                    "next_execution_utc": next_execution_utc.to_rfc3339(),
                }),
                true,
            )
            .await?;
        Ok(())
    }

    async fn record_failure(
        &self,
        collection_path: &str,
        task_id: &str,
        ran_at: DateTime<Utc>,
        next_execution_utc: DateTime<Utc>,
        error: &str,
    ) -> Result<(), SchedulerError> {
        let path = format!("{collection_path}/{task_id}");
        self.docdb
            .set(
                &path,
                serde_json::json!({
                    "status": "failed",
                    "last_run_at": ran_at.to_rfc3339(),
                    "last_error": error,
                    "next_execution_utc": next_execution_utc.to_rfc3339(),
                }),
                true,
            )
            .await?;
        Ok(())
    }
}

/// Advances a task's `next_execution_utc` by the interval implied by its
/// `schedule` string. Recognises `"@every_{n}s"`/`"@every_{n}m"`/`"@every_{n}h"`
/// (the only forms this crate's callers produce); anything else falls back to
/// a 1-hour interval rather than refusing to reschedule, since an enabled task
/// with a next-execution that never advances would otherwise tick forever.
fn advance_schedule(schedule: &str, from: DateTime<Utc>) -> DateTime<Utc> {
    let fallback = Duration::from_secs(3600);
    let step = schedule
        .strip_prefix("@every_")
        .and_then(|rest| {
            let (digits, unit) = rest.split_at(rest.len().saturating_sub(1));
            let n: u64 = digits.parse().ok()?;
            match unit {
                "s" => Some(Duration::from_secs(n)),
                "m" => Some(Duration::from_secs(n * 60)),
                "h" => Some(Duration::from_secs(n * 3600)),
                _ => None,
            }
        })
        .unwrap_or(fallback);
    from + chrono::Duration::from_std(step).unwrap_or(chrono::Duration::hours(1))
}

/// Runs the periodic tick described in: scan enabled tasks across a set
/// of collections, claim due ones with `lock:cron:{task_id}`, execute via
/// [`AgentRuntime::execute_task_now`], and reschedule. A task whose lock is
/// already held (another replica got there first) or whose execution fails is
/// skipped without halting the tick -- one bad mission never blocks the rest.
pub struct Scheduler {
    kv: Arc<dyn KvStore>,
    tasks: Arc<PlannedTaskStore>,
    agent: Arc<AgentRuntime>,
}

/// Outcome of claiming and (attempting to) run one due task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskRunOutcome {
    Ran,
    Skipped,
    LockContended,
    Failed(String),
}

impl Scheduler {
    pub fn new(kv: Arc<dyn KvStore>, tasks: Arc<PlannedTaskStore>, agent: Arc<AgentRuntime>) -> Self {
        Self { kv, tasks, agent }
    }

    /// One tick over a single company's task collection.
    /// Callers with multiple companies/mandates paths call this once per
    /// collection; fabric-serve's background loop sweeps all known paths.
    pub async fn tick(&self, collection_path: &str) -> Result<Vec<(String, TaskRunOutcome)>, SchedulerError> {
        let now = Utc::now();
        let due: Vec<PlannedTask> = self
            .tasks
            .list_enabled(collection_path)
            .await?
            .into_iter()
            .filter(|t| t.next_execution_utc <= now)
            .collect();

        let mut outcomes = Vec::with_capacity(due.len());
        for task in due {
            let outcome = self.run_one(collection_path, &task, now).await;
            outcomes.push((task.task_id.clone(), outcome));
        }
        Ok(outcomes)
    }

    async fn run_one(&self, collection_path: &str, task: &PlannedTask, now: DateTime<Utc>) -> TaskRunOutcome {
        let lock_key = namespace::cron_lock_key(&task.task_id);
        match self.kv.set_nx(&lock_key, "1").await {
            Ok(true) => {
                let _ = self.kv.expire(&lock_key, CRON_LOCK_TTL).await;
            }
            Ok(false) => return TaskRunOutcome::LockContended,
            Err(e) => return TaskRunOutcome::Failed(e.to_string()),
        }

        let next_execution_utc = advance_schedule(&task.schedule, now);
        if let Err(e) = self.tasks.mark_running(collection_path, &task.task_id).await {
            tracing::warn!(task_id = %task.task_id, error = %e, "failed to mark planned task running");
        }

        let result = self
            .agent
            .execute_task_now(&task.user_id, &task.company_id, &task.thread_key, &task.mission)
            .await;

        let outcome = match result {
            Ok(_) => {
                if let Err(e) = self
                    .tasks
                    .record_success(collection_path, &task.task_id, now, next_execution_utc)
                    .await
                {
                    tracing::warn!(task_id = %task.task_id, error = %e, "failed to record planned task success");
                }
                TaskRunOutcome::Ran
            }
            Err(e) => {
                let message = e.to_string();
                if let Err(record_err) = self
                    .tasks
                    .record_failure(collection_path, &task.task_id, now, next_execution_utc, &message)
                    .await
                {
                    tracing::warn!(task_id = %task.task_id, error = %record_err, "failed to record planned task failure");
                }
                tracing::warn!(task_id = %task.task_id, error = %message, "planned task execution failed");
                TaskRunOutcome::Failed(message)
            }
        };

        let _ = self.kv.delete(&lock_key).await;
        outcome
    }

    /// Runs [`Self::tick`] on a fixed interval until `shutdown` resolves.
    /// fabric-serve spawns this as a background task per known mandates path;
    /// errors scanning a collection are logged and the loop keeps ticking,
    /// since a transient DocDB outage on one tick shouldn't end the schedule.
    pub async fn run_forever(
        self: Arc<Self>,
        collection_path: String,
        mut shutdown: tokio::sync::oneshot::Receiver<()>,
    ) {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick(&collection_path).await {
                        tracing::warn!(collection_path = %collection_path, error = %e, "scheduler tick failed");
                    }
                }
                _ = &mut shutdown => {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ChatHistoryStore;
    use crate::docdb::InMemoryDocDb;
    use crate::kv::InMemoryKv;
    use crate::listener::EventSink;
    use crate::rtdb::InMemoryRtdb;
    use crate::session::SessionStore;
    use crate::workflow::WorkflowStateStore;
    use async_trait::async_trait;
    use serde_json::Value;

    struct NoopSink;
    #[async_trait]
    impl EventSink for NoopSink {
        async fn broadcast_to_user(&self, _uid: &str, _event: Value) {}
    }

    struct NoopContext;
    #[async_trait]
    impl crate::agent::ContextProvider for NoopContext {
        async fn load_context(
            &self,
            _u: &str,
            _c: &str,
            _s: &str,
            _m: &str,
        ) -> Result<(Value, Value, Value), crate::agent::AgentError> {
            Ok((Value::Null, Value::Null, Value::Null))
        }
    }

    struct EchoProvider;
    #[async_trait]
    impl crate::agent::LlmProvider for EchoProvider {
        async fn generate(
            &self,
            _s: Option<&str>,
            _m: &[Value],
            _schemas: &[Value],
        ) -> Result<crate::agent::LlmTurn, crate::agent::AgentError> {
            Ok(crate::agent::LlmTurn {
                assistant_blocks: vec![serde_json::json!({"type": "text", "text": "done"})],
                tool_calls: Vec::new(),
            })
        }
    }

    struct FailingProvider;
    #[async_trait]
    impl crate::agent::LlmProvider for FailingProvider {
        async fn generate(
            &self,
            _s: Option<&str>,
            _m: &[Value],
            _schemas: &[Value],
        ) -> Result<crate::agent::LlmTurn, crate::agent::AgentError> {
            Err(crate::agent::AgentError::Provider("boom".to_string()))
        }
    }

    fn task(task_id: &str, next_execution_utc: DateTime<Utc>) -> PlannedTask {
        PlannedTask {
            task_id: task_id.to_string(),
            user_id: "u1".to_string(),
            company_id: "c1".to_string(),
            thread_key: format!("cron-{task_id}"),
            mission: "reconcile overdue invoices".to_string(),
            schedule: "@every_60s".to_string(),
            enabled: true,
            status: None,
            priority: 0,
            next_execution_utc,
            last_run_at: None,
            last_error: None,
        }
    }

    fn scheduler(provider: Arc<dyn crate::agent::LlmProvider>) -> (Scheduler, Arc<dyn DocDbStore>, Arc<dyn KvStore>) {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
        let docdb: Arc<dyn DocDbStore> = Arc::new(InMemoryDocDb::new());
        let sessions = Arc::new(SessionStore::new(kv.clone()));
        let chats = Arc::new(ChatHistoryStore::new(kv.clone()));
        let workflows = Arc::new(WorkflowStateStore::new(kv.clone()));
        let rtdb = Arc::new(InMemoryRtdb::new());
        let agent = Arc::new(AgentRuntime::new(
            sessions,
            chats,
            workflows,
            rtdb,
            provider,
            Arc::new(NoopContext),
            Arc::new(NoopSink),
        ));
        let tasks = Arc::new(PlannedTaskStore::new(docdb.clone()));
        (Scheduler::new(kv.clone(), tasks, agent), docdb, kv)
    }

    #[tokio::test]
    async fn due_task_runs_and_reschedules_forward() {
        let (scheduler, docdb, _kv) = scheduler(Arc::new(EchoProvider));
        let t = task("t1", Utc::now() - chrono::Duration::seconds(5));
        scheduler.tasks.upsert("mandates/m1/planned_tasks", &t).await.unwrap();

        let outcomes = scheduler.tick("mandates/m1/planned_tasks").await.unwrap();
        assert_eq!(outcomes, vec![("t1".to_string(), TaskRunOutcome::Ran)]);

        let doc = docdb.get("mandates/m1/planned_tasks/t1").await.unwrap().unwrap();
        assert_eq!(doc["status"], "idle");
        let next: DateTime<Utc> = doc["next_execution_utc"].as_str().unwrap().parse().unwrap();
        assert!(next > Utc::now());
    }

    #[tokio::test]
    async fn not_yet_due_task_is_ignored() {
        let (scheduler, _docdb, _kv) = scheduler(Arc::new(EchoProvider));
        let t = task("t2", Utc::now() + chrono::Duration::hours(1));
        scheduler.tasks.upsert("mandates/m1/planned_tasks", &t).await.unwrap();

        let outcomes = scheduler.tick("mandates/m1/planned_tasks").await.unwrap();
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn disabled_task_is_ignored() {
        let (scheduler, _docdb, _kv) = scheduler(Arc::new(EchoProvider));
        let mut t = task("t3", Utc::now() - chrono::Duration::seconds(5));
        t.enabled = false;
        scheduler.tasks.upsert("mandates/m1/planned_tasks", &t).await.unwrap();

        let outcomes = scheduler.tick("mandates/m1/planned_tasks").await.unwrap();
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn held_lock_skips_without_failing_the_tick() {
        let (scheduler, _docdb, kv) = scheduler(Arc::new(EchoProvider));
        let t = task("t4", Utc::now() - chrono::Duration::seconds(5));
        scheduler.tasks.upsert("mandates/m1/planned_tasks", &t).await.unwrap();
        kv.set_nx(&namespace::cron_lock_key("t4"), "1").await.unwrap();

        let outcomes = scheduler.tick("mandates/m1/planned_tasks").await.unwrap();
        assert_eq!(outcomes, vec![("t4".to_string(), TaskRunOutcome::LockContended)]);
    }

    #[tokio::test]
    async fn execution_failure_is_recorded_and_rescheduled() {
        let (scheduler, docdb, _kv) = scheduler(Arc::new(FailingProvider));
        let t = task("t5", Utc::now() - chrono::Duration::seconds(5));
        scheduler.tasks.upsert("mandates/m1/planned_tasks", &t).await.unwrap();

        let outcomes = scheduler.tick("mandates/m1/planned_tasks").await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0].1, TaskRunOutcome::Failed(_)));

        let doc = docdb.get("mandates/m1/planned_tasks/t5").await.unwrap().unwrap();
        assert_eq!(doc["status"], "failed");
        assert!(doc["last_error"].as_str().unwrap().contains("boom"));
        let next: DateTime<Utc> = doc["next_execution_utc"].as_str().unwrap().parse().unwrap();
        assert!(next > Utc::now());
    }

    #[tokio::test]
    async fn lock_is_released_after_run_so_the_next_tick_can_reclaim_it() {
        let (scheduler, _docdb, kv) = scheduler(Arc::new(EchoProvider));
        let t = task("t6", Utc::now() - chrono::Duration::seconds(5));
        scheduler.tasks.upsert("mandates/m1/planned_tasks", &t).await.unwrap();
        scheduler.tick("mandates/m1/planned_tasks").await.unwrap();
        assert!(!kv.exists(&namespace::cron_lock_key("t6")).await.unwrap());
    }

    #[tokio::test]
    async fn list_all_includes_disabled_tasks() {
        let (scheduler, _docdb, _kv) = scheduler(Arc::new(EchoProvider));
        let mut disabled = task("t7", Utc::now());
        disabled.enabled = false;
        scheduler.tasks.upsert("mandates/m1/planned_tasks", &disabled).await.unwrap();

        let all = scheduler.tasks.list_all("mandates/m1/planned_tasks").await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(!all[0].enabled);
    }

    #[tokio::test]
    async fn set_enabled_flips_flag_without_touching_other_fields() {
        let (scheduler, _docdb, _kv) = scheduler(Arc::new(EchoProvider));
        let t = task("t8", Utc::now());
        scheduler.tasks.upsert("mandates/m1/planned_tasks", &t).await.unwrap();

        scheduler.tasks.set_enabled("mandates/m1/planned_tasks", "t8", false).await.unwrap();
        let reloaded = scheduler.tasks.load("mandates/m1/planned_tasks", "t8").await.unwrap().unwrap();
        assert!(!reloaded.enabled);
        assert_eq!(reloaded.mission, "reconcile overdue invoices");
    }

    #[tokio::test]
    async fn update_fields_merges_only_provided_values() {
        let (scheduler, _docdb, _kv) = scheduler(Arc::new(EchoProvider));
        let t = task("t9", Utc::now());
        scheduler.tasks.upsert("mandates/m1/planned_tasks", &t).await.unwrap();

        scheduler
            .tasks
            .update_fields("mandates/m1/planned_tasks", "t9", Some("new mission"), None, Some(5))
            .await
            .unwrap();
        let reloaded = scheduler.tasks.load("mandates/m1/planned_tasks", "t9").await.unwrap().unwrap();
        assert_eq!(reloaded.mission, "new mission");
        assert_eq!(reloaded.priority, 5);
        assert_eq!(reloaded.schedule, "@every_60s");
    }
}
