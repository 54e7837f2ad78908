//! Provider trait: the abstraction over AI backends.
//!
//! A provider takes the conversation so far plus the visible toolset and
//! decides the next step: either a batch of tool calls or a final answer.
//! Each backend translates this common shape to and from its own wire format.
//!
//! Implementations: Anthropic Messages API, OpenAI-compatible chat completions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::message::{ConversationTurn, TokenUsage};
use crate::session::StateMap;
use crate::tool::{ToolCallRequest, ToolDefinition};

/// Everything a provider needs to make one decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// The model to use (e.g., "claude-sonnet-4-20250514", "gpt-4o")
    pub model: String,

    /// Task instructions
    pub system_prompt: String,

    /// The session transcript, oldest first
    pub turns: Vec<ConversationTurn>,

    /// Tools the model may call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    /// Current merged session state
    #[serde(default, skip_serializing_if = "StateMap::is_empty")]
    pub state: StateMap,

    /// Temperature (0.0 = deterministic)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

fn default_temperature() -> f32 {
    0.2
}

impl ProviderRequest {
    /// System prompt with the session state appended, for backends that take
    /// a single instruction string.
    pub fn system_with_state(&self) -> String {
        if self.state.is_empty() {
            return self.system_prompt.clone();
        }
        let rendered =
            serde_json::to_string_pretty(&self.state).unwrap_or_else(|_| "{}".to_string());
        format!(
            "{}\n\n## Session state\n```json\n{}\n```",
            self.system_prompt, rendered
        )
    }
}

/// What the provider decided to do next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Decision {
    /// Run these tools, then ask again.
    ToolCalls {
        calls: Vec<ToolCallRequest>,
        /// Any text the model emitted alongside the calls
        #[serde(default)]
        preamble: String,
        usage: TokenUsage,
    },
    /// The model is done.
    Final { text: String, usage: TokenUsage },
}

impl Decision {
    pub fn usage(&self) -> TokenUsage {
        match self {
            Self::ToolCalls { usage, .. } | Self::Final { usage, .. } => *usage,
        }
    }
}

/// The core Provider trait.
///
/// Every AI backend implements this trait. The loop controller calls
/// `decide()` without knowing which backend is behind it; the backend is
/// chosen once, at construction, from an explicit provider-type tag.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "anthropic").
    fn name(&self) -> &str;

    /// Ask the backend for its next decision.
    async fn decide(&self, request: ProviderRequest) -> std::result::Result<Decision, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> ProviderRequest {
        ProviderRequest {
            model: "test-model".into(),
            system_prompt: "You investigate cluster incidents.".into(),
            turns: vec![ConversationTurn::user("pods are pending")],
            tools: vec![],
            state: StateMap::new(),
            temperature: default_temperature(),
            max_tokens: None,
        }
    }

    #[test]
    fn system_prompt_without_state_is_unchanged() {
        let req = request();
        assert_eq!(req.system_with_state(), "You investigate cluster incidents.");
    }

    #[test]
    fn system_prompt_renders_state_block() {
        let mut req = request();
        req.state.insert("namespace".into(), json!("payments"));
        let system = req.system_with_state();
        assert!(system.contains("## Session state"));
        assert!(system.contains("\"namespace\": \"payments\""));
    }

    #[test]
    fn decision_usage_accessor() {
        let decision = Decision::Final {
            text: "done".into(),
            usage: TokenUsage::new(4, 2),
        };
        assert_eq!(decision.usage().total(), 6);
    }
}
