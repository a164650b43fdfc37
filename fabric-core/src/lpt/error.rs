use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum LptError {
    #[error("docdb: {0}")]
    DocDb(#[from] crate::docdb::DocDbError),
    #[error("serialize/deserialize: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("agent runtime: {0}")]
    Agent(#[from] crate::agent::AgentError),
    #[error("lpt transport: {0}")]
    Transport(String),
}
