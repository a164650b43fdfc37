use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ListenerError {
    #[error("kv: {0}")]
    Kv(#[from] crate::kv::KvError),
    #[error("docdb: {0}")]
    DocDb(#[from] crate::docdb::DocDbError),
    #[error("serialize/deserialize: {0}")]
    Serde(#[from] serde_json::Error),
}
