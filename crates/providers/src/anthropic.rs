//! Anthropic native provider implementation.
//!
//! Uses Anthropic's Messages API directly (not an OpenAI-compatible proxy).
//!
//! Features:
//! - `x-api-key` header authentication (not Bearer)
//! - `anthropic-version` header
//! - System prompt (plus rendered session state) as top-level field
//! - Native tool use with `tool_use` / `tool_result` content blocks

use async_trait::async_trait;
use opsloop_core::error::ProviderError;
use opsloop_core::message::{ConversationTurn, Role, TokenUsage};
use opsloop_core::provider::{Decision, Provider, ProviderRequest};
use opsloop_core::tool::{ToolCallRequest, ToolDefinition};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::http::{status_error, transport_error};

const ANTHROPIC_VERSION: &str = "2023-06-01";
pub(crate) const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub(crate) const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Anthropic native Messages API provider.
pub struct AnthropicProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    /// Create a new Anthropic provider.
    pub fn new(api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            name: "anthropic".into(),
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            client,
        }
    }

    /// Create with a custom base URL (e.g., for testing or proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Register under a different name (the `[providers.<name>]` key).
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Anthropic takes the system prompt as a top-level field. Any system turns
    /// recorded in the transcript are appended to it.
    fn build_system(request: &ProviderRequest) -> String {
        let mut system = request.system_with_state();
        for turn in request.turns.iter().filter(|t| t.role == Role::System) {
            system.push_str("\n\n");
            system.push_str(&turn.content);
        }
        system
    }

    /// Convert turns to Anthropic content-block messages.
    ///
    /// Consecutive tool turns collapse into a single user message so that
    /// every `tool_use` in an assistant message is answered by the next one.
    fn to_api_messages(turns: &[ConversationTurn]) -> Vec<AnthropicMessage> {
        let mut result: Vec<AnthropicMessage> = Vec::new();

        for turn in turns {
            match turn.role {
                Role::User => {
                    result.push(AnthropicMessage {
                        role: "user".into(),
                        content: AnthropicContent::Text(turn.content.clone()),
                    });
                }
                Role::Assistant => {
                    if turn.tool_calls.is_empty() {
                        if turn.content.is_empty() {
                            continue;
                        }
                        result.push(AnthropicMessage {
                            role: "assistant".into(),
                            content: AnthropicContent::Text(turn.content.clone()),
                        });
                    } else {
                        let mut blocks: Vec<ContentBlock> = Vec::new();
                        if !turn.content.is_empty() {
                            blocks.push(ContentBlock::Text {
                                text: turn.content.clone(),
                            });
                        }
                        for call in &turn.tool_calls {
                            blocks.push(ContentBlock::ToolUse {
                                id: call.id.clone(),
                                name: call.tool_name.clone(),
                                input: call.arguments.clone(),
                            });
                        }
                        result.push(AnthropicMessage {
                            role: "assistant".into(),
                            content: AnthropicContent::Blocks(blocks),
                        });
                    }
                }
                Role::Tool => {
                    let block = ContentBlock::ToolResult {
                        tool_use_id: turn.call_id().unwrap_or_default().to_string(),
                        content: turn.content.clone(),
                        is_error: turn.is_error(),
                    };
                    match result.last_mut() {
                        Some(AnthropicMessage {
                            role,
                            content: AnthropicContent::Blocks(blocks),
                        }) if role.as_str() == "user" => blocks.push(block),
                        _ => result.push(AnthropicMessage {
                            role: "user".into(),
                            content: AnthropicContent::Blocks(vec![block]),
                        }),
                    }
                }
                Role::System => {}
            }
        }

        result
    }

    /// Convert tool definitions to Anthropic format.
    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<AnthropicTool> {
        tools
            .iter()
            .map(|t| AnthropicTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.input_schema.clone(),
            })
            .collect()
    }

    /// Convert an Anthropic API response into a decision.
    fn response_to_decision(resp: AnthropicResponse) -> Result<Decision, ProviderError> {
        let mut text = String::new();
        let mut calls = Vec::new();

        for block in resp.content {
            match block {
                ResponseContentBlock::Text { text: t } => {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(&t);
                }
                ResponseContentBlock::ToolUse { id, name, input } => {
                    if id.is_empty() || name.is_empty() {
                        return Err(ProviderError::malformed(
                            "tool_use block without id or name",
                        ));
                    }
                    let arguments = match input {
                        serde_json::Value::Null => serde_json::json!({}),
                        v @ serde_json::Value::Object(_) => v,
                        other => {
                            return Err(ProviderError::malformed(format!(
                                "tool_use input for '{name}' is not an object: {other}"
                            )));
                        }
                    };
                    calls.push(ToolCallRequest {
                        id,
                        tool_name: name,
                        arguments,
                    });
                }
                ResponseContentBlock::Other => {}
            }
        }

        let usage = TokenUsage::new(resp.usage.input_tokens, resp.usage.output_tokens);

        if calls.is_empty() {
            Ok(Decision::Final { text, usage })
        } else {
            Ok(Decision::ToolCalls {
                calls,
                preamble: text,
                usage,
            })
        }
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn decide(&self, request: ProviderRequest) -> Result<Decision, ProviderError> {
        let url = format!("{}/v1/messages", self.base_url);
        let system = Self::build_system(&request);
        let api_messages = Self::to_api_messages(&request.turns);

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": api_messages,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "temperature": request.temperature,
        });

        if !system.is_empty() {
            body["system"] = serde_json::json!(system);
        }

        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&request.tools));
        }

        debug!(
            provider = %self.name,
            model = %request.model,
            turns = request.turns.len(),
            tools = request.tools.len(),
            "Sending messages request"
        );

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(&self.name, e))?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let headers = response.headers().clone();
            let error_body = response.text().await.unwrap_or_default();
            return Err(status_error(&self.name, status, &headers, error_body));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport_error(&self.name, e))?;
        let api_resp: AnthropicResponse = serde_json::from_slice(&bytes).map_err(|e| {
            ProviderError::malformed(format!("Failed to parse Anthropic response: {e}"))
        })?;

        Self::response_to_decision(api_resp)
    }
}

// --- Anthropic API types ---

#[derive(Debug, Serialize, Deserialize)]
struct AnthropicMessage {
    role: String,
    content: AnthropicContent,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum AnthropicContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ResponseContentBlock>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ResponseContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    /// Thinking and any block types added later
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}
