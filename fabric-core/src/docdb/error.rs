use thiserror::Error;

/// All failures surfaced by [`super::DocDbStore`] collapse to this one kind;
/// callers decide whether to retry, log-and-default, or bubble up.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DocDbError {
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("serialize/deserialize: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("backend: {0}")]
    Backend(String),
}
