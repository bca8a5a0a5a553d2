//! Token-budget compression of conversation context.
//!
//! Keeps the most recent messages intact (modulo a per-message cap), fills
//! the remaining budget with older messages newest-to-oldest, and replaces
//! anything dropped with a single synthetic continuity note.

use crate::message::{AgentMessage, MessageRole};

/// Appended to a message that was cut at the per-message cap.
pub const TRUNCATION_MARKER: &str = " …[truncated]";

#[derive(Debug, Clone)]
pub struct CompressorConfig {
    /// Total token budget for the compressed list.
    pub token_budget: usize,
    /// Number of most-recent messages always retained.
    pub keep_recent: usize,
    /// Per-message token cap; longer messages are prefix-truncated.
    pub per_message_cap: usize,
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self {
            token_budget: 8_000,
            keep_recent: 6,
            per_message_cap: 2_000,
        }
    }
}

pub struct ContextCompressor {
    config: CompressorConfig,
}

impl ContextCompressor {
    pub fn new(config: CompressorConfig) -> Self {
        Self { config }
    }

    /// Compress `messages` down to the configured budget.
    ///
    /// Idempotent: an omission note produced by a previous pass is carried
    /// through outside the budget, so re-compressing already-compressed
    /// input under the same budget is a no-op.
    pub fn compress(&self, messages: &[AgentMessage]) -> Vec<AgentMessage> {
        if messages.is_empty() {
            return Vec::new();
        }

        let (carried_omissions, body) = match messages
            .first()
            .filter(|m| m.role == MessageRole::User)
            .and_then(|m| parse_omission_note(&m.content))
        {
            Some(count) => (count, &messages[1..]),
            None => (0, messages),
        };

        let recent_start = body.len().saturating_sub(self.config.keep_recent);

        // Recent tail, individually capped.
        let mut tail: Vec<AgentMessage> = body[recent_start..]
            .iter()
            .map(|m| self.cap_message(m))
            .collect();
        let mut used: usize = tail.iter().map(AgentMessage::estimated_tokens).sum();

        // Fill the remaining budget with older messages, newest first.
        let mut kept_older: Vec<AgentMessage> = Vec::new();
        let mut omitted = 0usize;
        for message in body[..recent_start].iter().rev() {
            let capped = self.cap_message(message);
            let cost = capped.estimated_tokens();
            if omitted == 0 && used + cost <= self.config.token_budget {
                used += cost;
                kept_older.push(capped);
            } else {
                // Once one message is dropped, everything older goes too so
                // the surviving prefix stays contiguous.
                omitted += 1;
            }
        }
        kept_older.reverse();

        let total_omitted = carried_omissions + omitted;
        let mut out = Vec::with_capacity(kept_older.len() + tail.len() + 1);
        if total_omitted > 0 {
            out.push(AgentMessage {
                role: MessageRole::User,
                content: format!("[{total_omitted} previous messages omitted]"),
                tool_calls: None,
                tool_results: None,
            });
        }
        out.extend(kept_older);
        out.append(&mut tail);
        out
    }

    /// Prefix-truncate a message that exceeds the per-message cap, appending
    /// a visible marker. Messages within the cap are returned as-is.
    fn cap_message(&self, message: &AgentMessage) -> AgentMessage {
        if message.estimated_tokens() <= self.config.per_message_cap {
            return message.clone();
        }
        let keep_chars = self
            .config
            .per_message_cap
            .saturating_mul(4)
            .saturating_sub(TRUNCATION_MARKER.len());
        let cut = floor_char_boundary(&message.content, keep_chars);
        let mut content = message.content[..cut].to_string();
        content.push_str(TRUNCATION_MARKER);
        AgentMessage {
            role: message.role,
            content,
            tool_calls: message.tool_calls.clone(),
            tool_results: message.tool_results.clone(),
        }
    }
}

/// Recognise a synthetic "[N previous messages omitted]" note.
fn parse_omission_note(content: &str) -> Option<usize> {
    content
        .strip_prefix('[')?
        .strip_suffix(" previous messages omitted]")?
        .parse()
        .ok()
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
