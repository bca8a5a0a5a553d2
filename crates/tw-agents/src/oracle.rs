use tw_core::{AgentMessage, ToolCall};
use tw_harness::ToolDefinition;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("oracle unavailable: {0}")]
    Unavailable(String),
    #[error("malformed oracle reply: {0}")]
    Malformed(String),
}

// ---------------------------------------------------------------------------
// OracleReply
// ---------------------------------------------------------------------------

/// What the decision oracle produced for one turn: free text, tool calls, or
/// both. An empty reply is treated as malformed by callers.
#[derive(Debug, Clone, Default)]
pub struct OracleReply {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl OracleReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            text: None,
            tool_calls: calls,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

// ---------------------------------------------------------------------------
// DecisionOracle
// ---------------------------------------------------------------------------

/// The opaque language-model boundary. The runtime never sees transport
/// details; it hands over a system prompt, the conversation so far, and the
/// advertised tool definitions, and gets back a structured reply.
#[async_trait::async_trait]
pub trait DecisionOracle: Send + Sync {
    async fn complete(
        &self,
        system_prompt: &str,
        messages: &[AgentMessage],
        tools: &[ToolDefinition],
    ) -> Result<OracleReply, OracleError>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
