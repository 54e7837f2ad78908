//! OpenAI-compatible provider implementation.
//!
//! Works with: OpenAI, OpenRouter, Ollama, vLLM, Groq, DeepSeek, and any
//! endpoint exposing `/chat/completions` with function calling.

use async_trait::async_trait;
use opsloop_core::error::ProviderError;
use opsloop_core::message::{ConversationTurn, Role, TokenUsage};
use opsloop_core::provider::{Decision, Provider, ProviderRequest};
use opsloop_core::tool::{ToolCallRequest, ToolDefinition};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::http::{status_error, transport_error};

/// An OpenAI-compatible LLM provider.
///
/// This handles the vast majority of LLM providers since most expose
/// an OpenAI-compatible `/v1/chat/completions` endpoint.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Create a new OpenAI-compatible provider.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        }
    }

    /// Convert the request to OpenAI chat messages. The system prompt with
    /// rendered state leads; transcript system turns stay in place.
    fn to_api_messages(request: &ProviderRequest) -> Vec<ApiMessage> {
        let mut messages = Vec::with_capacity(request.turns.len() + 1);

        let system = request.system_with_state();
        if !system.is_empty() {
            messages.push(ApiMessage::text("system", system));
        }

        for turn in &request.turns {
            messages.push(Self::to_api_message(turn));
        }
        messages
    }

    fn to_api_message(turn: &ConversationTurn) -> ApiMessage {
        match turn.role {
            Role::System => ApiMessage::text("system", turn.content.clone()),
            Role::User => ApiMessage::text("user", turn.content.clone()),
            Role::Assistant if turn.tool_calls.is_empty() => {
                ApiMessage::text("assistant", turn.content.clone())
            }
            Role::Assistant => ApiMessage {
                role: "assistant".into(),
                content: (!turn.content.is_empty()).then(|| turn.content.clone()),
                tool_calls: Some(
                    turn.tool_calls
                        .iter()
                        .map(|tc| ApiToolCall {
                            id: tc.id.clone(),
                            r#type: "function".into(),
                            function: ApiFunction {
                                name: tc.tool_name.clone(),
                                arguments: tc.arguments.to_string(),
                            },
                        })
                        .collect(),
                ),
                tool_call_id: None,
            },
            Role::Tool => ApiMessage {
                role: "tool".into(),
                content: Some(turn.content.clone()),
                tool_calls: None,
                tool_call_id: turn.call_id().map(str::to_string),
            },
        }
    }

    /// Convert tool definitions to OpenAI API format.
    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDefinition> {
        tools
            .iter()
            .map(|t| ApiToolDefinition {
                r#type: "function".into(),
                function: ApiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.input_schema.clone(),
                },
            })
            .collect()
    }

    /// Convert a chat completion into a decision. Tool-call arguments arrive
    /// as JSON strings and must parse into objects.
    fn response_to_decision(resp: ApiResponse) -> Result<Decision, ProviderError> {
        let choice = resp
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::malformed("No choices in response"))?;

        let usage = resp
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();
        let text = choice.message.content.unwrap_or_default();

        let api_calls = choice.message.tool_calls.unwrap_or_default();
        if api_calls.is_empty() {
            return Ok(Decision::Final { text, usage });
        }

        let mut calls = Vec::with_capacity(api_calls.len());
        for tc in api_calls {
            let raw = tc.function.arguments.trim();
            let arguments = if raw.is_empty() {
                serde_json::json!({})
            } else {
                serde_json::from_str::<serde_json::Value>(raw).map_err(|e| {
                    ProviderError::malformed(format!(
                        "Unparseable arguments for tool '{}': {e}",
                        tc.function.name
                    ))
                })?
            };
            if !arguments.is_object() {
                return Err(ProviderError::malformed(format!(
                    "Arguments for tool '{}' are not an object",
                    tc.function.name
                )));
            }
            calls.push(ToolCallRequest {
                id: tc.id,
                tool_name: tc.function.name,
                arguments,
            });
        }

        Ok(Decision::ToolCalls {
            calls,
            preamble: text,
            usage,
        })
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn decide(&self, request: ProviderRequest) -> Result<Decision, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(&request),
            "temperature": request.temperature,
            "stream": false,
        });

        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&request.tools));
        }

        debug!(
            provider = %self.name,
            model = %request.model,
            turns = request.turns.len(),
            tools = request.tools.len(),
            "Sending completion request"
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
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
        let api_response: ApiResponse = serde_json::from_slice(&bytes)
            .map_err(|e| ProviderError::malformed(format!("Failed to parse response: {e}")))?;

        Self::response_to_decision(api_response)
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl ApiMessage {
    fn text(role: &str, content: String) -> Self {
        Self {
            role: role.into(),
            content: Some(content),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    #[serde(default = "function_type")]
    r#type: String,
    function: ApiFunction,
}

fn function_type() -> String {
    "function".into()
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsloop_core::session::StateMap;
    use opsloop_core::tool::{ToolCallResult, ToolTarget};
    use serde_json::json;

    fn request(turns: Vec<ConversationTurn>) -> ProviderRequest {
        ProviderRequest {
            model: "gpt-4o".into(),
            system_prompt: "You are an SRE.".into(),
            turns,
            tools: vec![],
            state: StateMap::new(),
            temperature: 0.2,
            max_tokens: None,
        }
    }

    fn parse(body: &str) -> Result<Decision, ProviderError> {
        let resp: ApiResponse = serde_json::from_str(body).unwrap();
        OpenAiCompatProvider::response_to_decision(resp)
    }

    #[test]
    fn base_url_is_normalized() {
        let p = OpenAiCompatProvider::new("custom", "https://llm.internal/v1/", "k");
        assert_eq!(p.name(), "custom");
        assert_eq!(p.base_url, "https://llm.internal/v1");
    }

    #[test]
    fn message_conversion_round_trip_shapes() {
        let call = ToolCallRequest {
            id: "call_1".into(),
            tool_name: "get_pods".into(),
            arguments: json!({"namespace": "prod"}),
        };
        let req = request(vec![
            ConversationTurn::user("pods pending"),
            ConversationTurn::assistant_tool_calls("", vec![call], None),
            ConversationTurn::tool(ToolCallResult::success("call_1", "get_pods", json!("3 pending"))),
        ]);

        let msgs = OpenAiCompatProvider::to_api_messages(&req);
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[0].role, "system");
        assert_eq!(msgs[1].role, "user");

        assert_eq!(msgs[2].role, "assistant");
        assert!(msgs[2].content.is_none());
        let tc = &msgs[2].tool_calls.as_ref().unwrap()[0];
        assert_eq!(tc.function.name, "get_pods");
        let args: serde_json::Value = serde_json::from_str(&tc.function.arguments).unwrap();
        assert_eq!(args["namespace"], "prod");

        assert_eq!(msgs[3].role, "tool");
        assert_eq!(msgs[3].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(msgs[3].content.as_deref(), Some("3 pending"));
    }

    #[test]
    fn tool_definition_conversion() {
        let tools = vec![ToolDefinition {
            name: "get_pods".into(),
            description: "List pods".into(),
            input_schema: json!({"type": "object"}),
            state_keys: None,
            target: ToolTarget::Local,
        }];
        let api = OpenAiCompatProvider::to_api_tools(&tools);
        let json = serde_json::to_value(&api).unwrap();
        assert_eq!(json[0]["type"], "function");
        assert_eq!(json[0]["function"]["name"], "get_pods");
        assert_eq!(json[0]["function"]["parameters"]["type"], "object");
    }

    #[test]
    fn parse_final_answer() {
        let decision = parse(
            r#"{
                "model": "gpt-4o",
                "choices": [{"message": {"role": "assistant", "content": "Scale the deployment."}}],
                "usage": {"prompt_tokens": 12, "completion_tokens": 4, "total_tokens": 16}
            }"#,
        )
        .unwrap();
        assert_eq!(
            decision,
            Decision::Final {
                text: "Scale the deployment.".into(),
                usage: TokenUsage::new(12, 4),
            }
        );
    }

    #[test]
    fn parse_tool_calls_with_string_arguments() {
        let decision = parse(
            r#"{
                "choices": [{"message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [
                        {"id": "call_a", "type": "function", "function": {"name": "get_pods", "arguments": "{\"namespace\":\"prod\"}"}},
                        {"id": "call_b", "type": "function", "function": {"name": "get_nodes", "arguments": ""}}
                    ]
                }}]
            }"#,
        )
        .unwrap();

        match decision {
            Decision::ToolCalls { calls, usage, .. } => {
                assert_eq!(calls.len(), 2);
                assert_eq!(calls[0].arguments["namespace"], "prod");
                assert_eq!(calls[1].arguments, json!({}));
                assert_eq!(usage.total(), 0);
            }
            other => panic!("Expected tool calls, got {other:?}"),
        }
    }

    #[test]
    fn unparseable_arguments_are_malformed() {
        let err = parse(
            r#"{"choices": [{"message": {"role": "assistant", "tool_calls": [
                {"id": "call_a", "type": "function", "function": {"name": "get_pods", "arguments": "{namespace: prod"}}
            ]}}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ProviderError::MalformedResponse { .. }));
    }

    #[test]
    fn empty_choices_are_malformed() {
        let err = parse(r#"{"choices": []}"#).unwrap_err();
        assert!(matches!(err, ProviderError::MalformedResponse { .. }));
    }
}
