use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChatHistoryError {
    #[error("chat history not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Kv(#[from] crate::kv::KvError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
