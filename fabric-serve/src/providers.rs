//! Stub implementations of fabric-core's external-collaborator traits. The
//! real LLM and ERP/DMS context sources are out of scope; these stand in so the binary can boot and exercise the rest of the
//! fabric without a live model or back-office integration configured.

use async_trait::async_trait;
use fabric_core::{AgentError, ContextProvider, LlmProvider, LlmTurn};
use serde_json::{json, Value};

/// Answers every turn with a fixed acknowledgement and no tool calls. Good
/// enough to drive the hub/RPC/listener plumbing end to end in development;
/// a production deployment wires a real provider in its place.
#[derive(Debug, Default)]
pub struct StubLlmProvider;

#[async_trait]
impl LlmProvider for StubLlmProvider {
    async fn generate(
        &self,
        _system_prompt: Option<&str>,
        messages: &[Value],
        _tool_schemas: &[Value],
    ) -> Result<LlmTurn, AgentError> {
        let last_user_text = messages
            .iter()
            .rev()
            .find(|m| m.get("role").and_then(|r| r.as_str()) == Some("user"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .unwrap_or("");
        Ok(LlmTurn {
            assistant_blocks: vec![json!({
                "type": "text",
                "text": format!("acknowledged: {last_user_text}"),
            })],
            tool_calls: Vec::new(),
        })
    }
}

/// Returns empty context/jobs/metrics for every user. A real deployment backs
/// this with its ERP/DMS connectors.
#[derive(Debug, Default)]
pub struct StubContextProvider;

#[async_trait]
impl ContextProvider for StubContextProvider {
    async fn load_context(
        &self,
        _user_id: &str,
        _company_id: &str,
        _dms_system: &str,
        _dms_mode: &str,
    ) -> Result<(Value, Value, Value), AgentError> {
        Ok((json!({}), json!([]), json!({})))
    }
}
