use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RtdbError {
    #[error("serialize/deserialize: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("backend: {0}")]
    Backend(String),
}
