use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AgentError {
    #[error("session: {0}")]
    Session(#[from] crate::session::SessionStoreError),
    #[error("chat history: {0}")]
    Chat(#[from] crate::chat::ChatHistoryError),
    #[error("workflow state: {0}")]
    Workflow(#[from] crate::workflow::WorkflowStateError),
    #[error("serialize/deserialize: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("llm provider: {0}")]
    Provider(String),
    #[error("no such tool: {0}")]
    UnknownTool(String),
    #[error("tool {0}: {1}")]
    ToolFailed(String, String),
    #[error("no workflow for thread, call start_workflow first")]
    WorkflowMissing,
}
