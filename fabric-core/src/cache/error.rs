use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CacheError {
    #[error("kv: {0}")]
    Kv(#[from] crate::kv::KvError),
    #[error("serialize/deserialize: {0}")]
    Serde(#[from] serde_json::Error),
}
