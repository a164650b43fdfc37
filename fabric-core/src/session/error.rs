use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SessionStoreError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Kv(#[from] crate::kv::KvError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
