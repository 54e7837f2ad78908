//! Conversation turn domain types.
//!
//! These are the value objects persisted in a session transcript and replayed
//! to the provider on every iteration:
//! user asks → assistant requests tools → tool results → assistant answers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;

use crate::tool::{ToolCallRequest, ToolCallResult, ToolOutcome};

/// The role of a turn's author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions
    System,
    /// The caller (business-logic layer or end user)
    User,
    /// The AI backend
    Assistant,
    /// Tool execution result
    Tool,
}

/// Input/output token counts reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
    }
}

/// A single turn in a session transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// Who produced this turn
    pub role: Role,

    /// The text content (for tool turns: the rendered result payload or error)
    pub content: String,

    /// Tool calls requested by the assistant (assistant turns only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,

    /// The result this turn carries (tool turns only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolCallResult>,

    /// Tokens spent producing this turn (assistant turns only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,

    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_result: None,
            token_usage: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a system turn.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a user turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create a final-answer assistant turn.
    pub fn assistant(content: impl Into<String>, usage: Option<TokenUsage>) -> Self {
        Self {
            token_usage: usage,
            ..Self::new(Role::Assistant, content)
        }
    }

    /// Create an assistant turn that requests tool calls.
    pub fn assistant_tool_calls(
        preamble: impl Into<String>,
        calls: Vec<ToolCallRequest>,
        usage: Option<TokenUsage>,
    ) -> Self {
        Self {
            tool_calls: calls,
            token_usage: usage,
            ..Self::new(Role::Assistant, preamble)
        }
    }

    /// Create a tool turn from a dispatch result.
    pub fn tool(result: ToolCallResult) -> Self {
        let content = result.render();
        Self {
            tool_result: Some(result),
            ..Self::new(Role::Tool, content)
        }
    }

    /// The call id a tool turn answers.
    pub fn call_id(&self) -> Option<&str> {
        self.tool_result.as_ref().map(|r| r.call_id.as_str())
    }

    /// Whether this tool turn carries an error outcome.
    pub fn is_error(&self) -> bool {
        matches!(
            self.tool_result.as_ref().map(|r| &r.outcome),
            Some(ToolOutcome::Error { .. })
        )
    }

    /// Rough token estimate (4 chars ≈ 1 token).
    pub fn estimated_tokens(&self) -> usize {
        self.content.len() / 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ToolExecutionError;

    #[test]
    fn create_user_turn() {
        let turn = ConversationTurn::user("Why is my pod crashlooping?");
        assert_eq!(turn.role, Role::User);
        assert!(turn.tool_calls.is_empty());
        assert!(turn.call_id().is_none());
    }

    #[test]
    fn tool_turn_renders_error_outcome() {
        let result = ToolCallResult::error(
            "call_1",
            "kubectl_get",
            ToolExecutionError::PluginUnreachable {
                plugin: "kubernetes".into(),
                reason: "connection refused".into(),
            },
        );
        let turn = ConversationTurn::tool(result);
        assert_eq!(turn.role, Role::Tool);
        assert_eq!(turn.call_id(), Some("call_1"));
        assert!(turn.is_error());
        assert!(turn.content.contains("plugin unreachable"));
    }

    #[test]
    fn usage_accumulates() {
        let mut total = TokenUsage::default();
        total += TokenUsage::new(10, 5);
        total += TokenUsage::new(3, 2);
        assert_eq!(total, TokenUsage::new(13, 7));
        assert_eq!(total.total(), 20);
    }

    #[test]
    fn turn_serialization_skips_empty_fields() {
        let turn = ConversationTurn::user("hello");
        let json = serde_json::to_value(&turn).unwrap();
        assert_eq!(json["role"], "user");
        assert!(json.get("tool_calls").is_none());
        assert!(json.get("tool_result").is_none());
    }
}
