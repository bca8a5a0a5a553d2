//! Agent conversation messages and the bounded message history.
//!
//! Messages are append-only within a single conversation; trimming removes
//! interior messages but always preserves the first (seed) message and the
//! most recent tail.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

/// A tool invocation requested by the oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

/// The outcome of one tool invocation, mirrored back to the oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub output: serde_json::Value,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
}

impl ToolResult {
    pub fn ok(tool_call_id: impl Into<String>, output: serde_json::Value) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            output,
            is_error: false,
            error: None,
            execution_time_ms: None,
        }
    }

    pub fn err(tool_call_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            output: serde_json::Value::Null,
            is_error: true,
            error: Some(error.into()),
            execution_time_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_results: Option<Vec<ToolResult>>,
}

impl AgentMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            tool_calls: None,
            tool_results: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            tool_calls: None,
            tool_results: None,
        }
    }

    pub fn assistant_with_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            tool_calls: Some(calls),
            tool_results: None,
        }
    }

    /// Rough token estimate: one token per four characters of content plus a
    /// flat allowance per attached call/result payload.
    pub fn estimated_tokens(&self) -> usize {
        let mut tokens = self.content.len() / 4;
        if let Some(calls) = &self.tool_calls {
            tokens += calls
                .iter()
                .map(|c| c.name.len() / 4 + c.input.to_string().len() / 4)
                .sum::<usize>();
        }
        if let Some(results) = &self.tool_results {
            tokens += results
                .iter()
                .map(|r| r.output.to_string().len() / 4)
                .sum::<usize>();
        }
        tokens
    }
}

// ---------------------------------------------------------------------------
// MessageHistory
// ---------------------------------------------------------------------------

/// Bounded conversation buffer with a seed-preserving trim policy.
///
/// Trimming keeps the first message (the seed prompt) and the last K
/// messages, where K is `max_messages - 1`. `needs_trim` fires once the
/// buffer reaches 80% of `max_messages` so the caller can trim before the
/// next oracle round.
#[derive(Debug, Clone)]
pub struct MessageHistory {
    messages: Vec<AgentMessage>,
    max_messages: usize,
    estimated_tokens: usize,
}

impl MessageHistory {
    pub fn new(max_messages: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_messages: max_messages.max(2),
            estimated_tokens: 0,
        }
    }

    pub fn add(&mut self, message: AgentMessage) {
        self.estimated_tokens += message.estimated_tokens();
        self.messages.push(message);
    }

    /// Attach tool results as a single user-role message whose results mirror
    /// the originating calls, in call order.
    pub fn add_tool_results(&mut self, results: Vec<ToolResult>) {
        let message = AgentMessage {
            role: MessageRole::User,
            content: String::new(),
            tool_calls: None,
            tool_results: Some(results),
        };
        self.add(message);
    }

    pub fn pop_last(&mut self) -> Option<AgentMessage> {
        let popped = self.messages.pop();
        if let Some(m) = &popped {
            self.estimated_tokens = self.estimated_tokens.saturating_sub(m.estimated_tokens());
        }
        popped
    }

    pub fn messages(&self) -> &[AgentMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn estimated_tokens(&self) -> usize {
        self.estimated_tokens
    }

    pub fn max_messages(&self) -> usize {
        self.max_messages
    }

    /// True once the buffer has reached 80% of `max_messages`.
    pub fn needs_trim(&self) -> bool {
        self.messages.len() * 10 >= self.max_messages * 8
    }

    /// Trim to the seed message plus the last `max_messages - 1` messages.
    /// Returns the number of interior messages removed.
    pub fn trim(&mut self) -> usize {
        let keep_tail = self.max_messages - 1;
        if self.messages.len() <= keep_tail + 1 {
            return 0;
        }
        let tail_start = self.messages.len() - keep_tail;
        let mut kept: Vec<AgentMessage> = Vec::with_capacity(self.max_messages);
        kept.push(self.messages[0].clone());
        kept.extend_from_slice(&self.messages[tail_start..]);

        let removed = self.messages.len() - kept.len();
        self.messages = kept;
        self.estimated_tokens = self
            .messages
            .iter()
            .map(AgentMessage::estimated_tokens)
            .sum();
        removed
    }

    /// Trim only when [`needs_trim`](Self::needs_trim) fires.
    pub fn trim_if_needed(&mut self) -> usize {
        if self.needs_trim() {
            self.trim()
        } else {
            0
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
