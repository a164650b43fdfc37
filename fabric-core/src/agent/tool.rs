//! Tool schemas and the dispatch trait for the agent runtime.

use async_trait::async_trait;
use serde_json::Value;

use super::AgentError;

/// One LLM-issued tool call, as returned by [`super::LlmProvider::generate`].
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

/// A non-`WAIT_ON_LPT` tool the brain can invoke synchronously.
/// `WAIT_ON_LPT` itself is handled inline by [`super::AgentRuntime`] since it
/// needs direct access to `WorkflowStateStore`.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &str;
    fn schema(&self) -> Value;
    async fn call(&self, args: Value) -> Result<Value, AgentError>;
}

pub const WAIT_ON_LPT_TOOL_NAME: &str = "WAIT_ON_LPT";

/// `expected_lpt` enum as declared in `wait_on_lpt.py`.
pub const EXPECTED_LPT_VALUES: [&str; 5] = [
    "LPT_APBookkeeper",
    "LPT_Router",
    "LPT_Banker",
    "LPT_FileManager",
    "OTHER",
];

/// JSON schema for the `WAIT_ON_LPT` tool, handed to [`super::LlmProvider::generate`]
/// alongside every registered [`ToolHandler`]'s schema.
pub fn wait_on_lpt_tool_schema() -> Value {
    serde_json::json!({
        "name": WAIT_ON_LPT_TOOL_NAME,
        "description": "Suspend the current workflow turn while a long-running external task (LPT) completes.",
        "input_schema": {
            "type": "object",
            "properties": {
                "reason": {"type": "string"},
                "expected_lpt": {"type": "string", "enum": EXPECTED_LPT_VALUES},
                "step_waiting": {"type": "string"},
                "task_ids": {"type": "array", "items": {"type": "string"}},
                "additional_context": {"type": "object"}
            },
            "required": ["reason", "expected_lpt", "step_waiting"]
        }
    })
}
