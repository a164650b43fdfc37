//! KV-store errors.

use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KvError {
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("backend error: {0}")]
    Backend(String),
}
