use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SchedulerError {
    #[error("docdb: {0}")]
    DocDb(#[from] crate::docdb::DocDbError),
    #[error("kv: {0}")]
    Kv(#[from] crate::kv::KvError),
    #[error("agent runtime: {0}")]
    Agent(#[from] crate::agent::AgentError),
    #[error("serialize/deserialize: {0}")]
    Serde(#[from] serde_json::Error),
}
