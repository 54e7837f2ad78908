//! Plugin HTTP contract and client.
//!
//! A plugin is an independent process exposing `POST /execute`:
//!
//! ```text
//! {hook: "describe"}                                  -> {tools: [{name, description, inputSchema, stateKeys?}]}
//! {hook: "invoke", sessionId, payload: {tool, args, state}} -> {result, stateDelta}
//! {hook: "release", sessionId}                        -> {}
//! ```
//!
//! Plugins are stateless: every `invoke` carries the session slice the tool
//! asked for.

use std::time::Duration;

use opsloop_core::error::ToolExecutionError;
use opsloop_core::session::StateMap;
use opsloop_core::tool::{ToolDefinition, ToolInvocation, ToolResponse, ToolTarget};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default per-request plugin timeout.
pub const DEFAULT_PLUGIN_TIMEOUT: Duration = Duration::from_secs(30);

// --- Wire types ---

/// The body of every `POST /execute` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "hook", rename_all = "lowercase")]
pub enum PluginRequest {
    Describe,
    Invoke {
        #[serde(rename = "sessionId")]
        session_id: String,
        payload: InvokePayload,
    },
    Release {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokePayload {
    pub tool: String,
    #[serde(default)]
    pub args: serde_json::Value,
    #[serde(default)]
    pub state: StateMap,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DescribeResponse {
    pub tools: Vec<DescribedTool>,
}

/// One tool as a plugin describes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescribedTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default = "empty_schema")]
    pub input_schema: serde_json::Value,
    #[serde(rename = "stateKeys", default, skip_serializing_if = "Option::is_none")]
    pub state_keys: Option<Vec<String>>,
}

fn empty_schema() -> serde_json::Value {
    serde_json::json!({"type": "object"})
}

impl DescribedTool {
    pub fn from_definition(def: &ToolDefinition) -> Self {
        Self {
            name: def.name.clone(),
            description: def.description.clone(),
            input_schema: def.input_schema.clone(),
            state_keys: def.state_keys.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvokeResponse {
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(rename = "stateDelta", default, skip_serializing_if = "StateMap::is_empty")]
    pub state_delta: StateMap,
}

/// Error body returned by plugins on non-2xx responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

// --- Client ---

/// HTTP-level plugin failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PluginError {
    #[error("plugin {plugin} unreachable: {reason}")]
    Unreachable { plugin: String, reason: String },

    #[error("plugin {plugin} timed out: {reason}")]
    Timeout { plugin: String, reason: String },

    #[error("plugin rejected request (status {status}): {reason}")]
    Rejected { status: u16, reason: String },

    #[error("plugin failed (status {status}): {reason}")]
    Server { status: u16, reason: String },

    #[error("plugin returned an unreadable response: {reason}")]
    BadResponse { reason: String },
}

impl PluginError {
    /// Connection-level failures, the only class worth retrying.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Unreachable { .. } | Self::Timeout { .. })
    }

    /// The tool-call error this failure surfaces as.
    pub fn into_tool_error(self, tool: &str) -> ToolExecutionError {
        match self {
            Self::Unreachable { plugin, reason } | Self::Timeout { plugin, reason } => {
                ToolExecutionError::PluginUnreachable { plugin, reason }
            }
            Self::Rejected { status, reason } => ToolExecutionError::Rejected { status, reason },
            Self::Server { reason, .. } | Self::BadResponse { reason } => {
                ToolExecutionError::handler_failed(tool, reason)
            }
        }
    }
}

/// Client for one plugin endpoint.
#[derive(Clone)]
pub struct PluginClient {
    name: String,
    address: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl std::fmt::Debug for PluginClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginClient")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl PluginClient {
    pub fn new(name: impl Into<String>, address: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");
        Self {
            name: name.into(),
            address: address.into().trim_end_matches('/').to_string(),
            timeout,
            client,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn target(&self) -> ToolTarget {
        ToolTarget::Plugin {
            plugin: self.name.clone(),
            address: self.address.clone(),
        }
    }

    /// Ask the plugin which tools it serves.
    pub async fn describe(&self) -> Result<Vec<ToolDefinition>, PluginError> {
        let resp: DescribeResponse = self.execute(&PluginRequest::Describe).await?;
        debug!(plugin = %self.name, tools = resp.tools.len(), "Plugin described");
        Ok(resp
            .tools
            .into_iter()
            .map(|t| ToolDefinition {
                name: t.name,
                description: t.description,
                input_schema: t.input_schema,
                state_keys: t.state_keys,
                target: self.target(),
            })
            .collect())
    }

    /// Run one tool call on the plugin.
    pub async fn invoke(&self, invocation: &ToolInvocation) -> Result<ToolResponse, PluginError> {
        let request = PluginRequest::Invoke {
            session_id: invocation.session_id.clone(),
            payload: InvokePayload {
                tool: invocation.tool.clone(),
                args: invocation.args.clone(),
                state: invocation.state.clone(),
            },
        };
        let resp: InvokeResponse = self.execute(&request).await?;
        Ok(ToolResponse {
            result: resp.result,
            state_delta: resp.state_delta,
        })
    }

    /// Tell the plugin a session is over so it can drop per-session resources.
    pub async fn release(&self, session_id: &str) -> Result<(), PluginError> {
        let request = PluginRequest::Release {
            session_id: session_id.to_string(),
        };
        let _: serde_json::Value = self.execute(&request).await?;
        Ok(())
    }

    async fn execute<T: serde::de::DeserializeOwned>(
        &self,
        request: &PluginRequest,
    ) -> Result<T, PluginError> {
        let url = format!("{}/execute", self.address);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let reason = serde_json::from_str::<ErrorBody>(&body)
                .map(|b| b.error)
                .unwrap_or(body);
            let status = status.as_u16();
            return Err(if status < 500 {
                PluginError::Rejected { status, reason }
            } else {
                PluginError::Server { status, reason }
            });
        }

        // The plugin has already acted on the request, so a broken body must
        // not look like a network failure the dispatcher would retry.
        let bytes = response.bytes().await.map_err(|e| PluginError::BadResponse {
            reason: format!("failed to read response body: {e}"),
        })?;
        serde_json::from_slice(&bytes).map_err(|e| PluginError::BadResponse {
            reason: e.to_string(),
        })
    }

    fn transport_error(&self, err: reqwest::Error) -> PluginError {
        if err.is_timeout() {
            PluginError::Timeout {
                plugin: self.name.clone(),
                reason: err.to_string(),
            }
        } else {
            PluginError::Unreachable {
                plugin: self.name.clone(),
                reason: err.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_wire_format() {
        let describe = serde_json::to_value(PluginRequest::Describe).unwrap();
        assert_eq!(describe, json!({"hook": "describe"}));

        let mut state = StateMap::new();
        state.insert("namespace".into(), json!("prod"));
        let invoke = PluginRequest::Invoke {
            session_id: "s-1".into(),
            payload: InvokePayload {
                tool: "get_pods".into(),
                args: json!({"label": "app=api"}),
                state,
            },
        };
        let value = serde_json::to_value(&invoke).unwrap();
        assert_eq!(value["hook"], "invoke");
        assert_eq!(value["sessionId"], "s-1");
        assert_eq!(value["payload"]["tool"], "get_pods");
        assert_eq!(value["payload"]["state"]["namespace"], "prod");

        let release = serde_json::to_value(PluginRequest::Release {
            session_id: "s-1".into(),
        })
        .unwrap();
        assert_eq!(release, json!({"hook": "release", "sessionId": "s-1"}));
    }

    #[test]
    fn described_tool_defaults() {
        let tool: DescribedTool = serde_json::from_value(json!({"name": "get_pods"})).unwrap();
        assert_eq!(tool.input_schema["type"], "object");
        assert!(tool.state_keys.is_none());

        let tool: DescribedTool = serde_json::from_value(json!({
            "name": "logs",
            "description": "Pod logs",
            "inputSchema": {"type": "object", "required": ["pod"]},
            "stateKeys": ["namespace"]
        }))
        .unwrap();
        assert_eq!(tool.state_keys, Some(vec!["namespace".to_string()]));
    }

    #[test]
    fn invoke_response_delta_is_optional() {
        let resp: InvokeResponse = serde_json::from_value(json!({"result": "ok"})).unwrap();
        assert!(resp.state_delta.is_empty());

        let resp: InvokeResponse =
            serde_json::from_value(json!({"result": 1, "stateDelta": {"k": true}})).unwrap();
        assert_eq!(resp.state_delta["k"], true);
    }

    #[test]
    fn error_classification() {
        let down = PluginError::Unreachable {
            plugin: "k8s".into(),
            reason: "connection refused".into(),
        };
        assert!(down.is_network());
        let err = down.into_tool_error("get_pods");
        assert!(err.to_string().contains("plugin unreachable"));

        let rejected = PluginError::Rejected {
            status: 422,
            reason: "missing pod".into(),
        };
        assert!(!rejected.is_network());
        assert!(matches!(
            rejected.into_tool_error("logs"),
            ToolExecutionError::Rejected { status: 422, .. }
        ));

        let server = PluginError::Server {
            status: 500,
            reason: "boom".into(),
        };
        assert!(!server.is_network());
        assert!(matches!(
            server.into_tool_error("logs"),
            ToolExecutionError::HandlerFailed { .. }
        ));
    }

    #[tokio::test]
    async fn unreachable_plugin_is_network_error() {
        // Bind then drop a listener to get a port nobody is serving
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = PluginClient::new("dead", format!("http://{addr}"), Duration::from_secs(2));
        let err = client.describe().await.unwrap_err();
        assert!(err.is_network(), "expected network error, got {err:?}");
    }

    #[tokio::test]
    async fn truncated_success_body_is_not_retryable() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Answers 200 with a body shorter than its Content-Length, then hangs up
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 100\r\n\r\n{\"result\"",
                )
                .await;
            let _ = socket.shutdown().await;
        });

        let client = PluginClient::new("flaky", format!("http://{addr}"), Duration::from_secs(2));
        let invocation = ToolInvocation {
            session_id: "s-1".into(),
            tool: "restart_pod".into(),
            args: json!({"pod": "api-0"}),
            state: StateMap::new(),
        };
        let err = client.invoke(&invocation).await.unwrap_err();
        assert!(
            matches!(err, PluginError::BadResponse { .. }),
            "expected a bad response, got {err:?}"
        );
        assert!(!err.is_network());
    }
}
