//! Tool types: the contract between the model, the dispatcher and tool handlers.
//!
//! A tool is either executed in-process by a [`ToolHandler`] or remotely by a
//! plugin. Both paths receive the identical [`ToolInvocation`] and answer with
//! the identical [`ToolResponse`], so the loop never cares which one ran.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ToolExecutionError;
use crate::session::StateMap;

/// Where a registered tool is executed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolTarget {
    /// An in-process handler
    #[default]
    Local,
    /// A remote plugin reachable over HTTP
    Plugin { plugin: String, address: String },
}

/// A schema-described capability the model may invoke.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique tool name
    pub name: String,

    /// Description sent to the model
    pub description: String,

    /// JSON Schema describing accepted arguments
    pub input_schema: serde_json::Value,

    /// State keys this tool reads; `None` means the whole session state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_keys: Option<Vec<String>>,

    /// Execution target, filled in by the registry
    #[serde(default)]
    pub target: ToolTarget,
}

impl ToolDefinition {
    /// Pick the slice of session state this tool asked for.
    pub fn state_slice(&self, state: &StateMap) -> StateMap {
        match &self.state_keys {
            None => state.clone(),
            Some(keys) => keys
                .iter()
                .filter_map(|k| state.get(k).map(|v| (k.clone(), v.clone())))
                .collect(),
        }
    }
}

/// A tool call requested by the model. Only provider adapters construct these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Correlation id assigned by the provider (e.g. `toolu_...`, `call_...`)
    pub id: String,

    /// Name of the tool to invoke
    pub tool_name: String,

    /// Structured arguments
    pub arguments: serde_json::Value,
}

/// How a single tool call ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success { payload: serde_json::Value },
    Error { error: ToolExecutionError },
}

/// Exactly one of these exists per [`ToolCallRequest`] in an iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    /// The request id this result answers
    pub call_id: String,

    /// The tool that was called
    pub tool_name: String,

    #[serde(flatten)]
    pub outcome: ToolOutcome,
}

impl ToolCallResult {
    pub fn success(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            outcome: ToolOutcome::Success { payload },
        }
    }

    pub fn error(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        error: ToolExecutionError,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            outcome: ToolOutcome::Error { error },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Success { .. })
    }

    /// Text form replayed to the model.
    pub fn render(&self) -> String {
        match &self.outcome {
            ToolOutcome::Success { payload } => match payload {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            ToolOutcome::Error { error } => format!("Error: {error}"),
        }
    }
}

/// The argument contract shared by local handlers and plugin `invoke` calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub session_id: String,
    pub tool: String,
    pub args: serde_json::Value,
    /// The slice of session state the tool declared interest in
    #[serde(default)]
    pub state: StateMap,
}

/// What a tool hands back: a result payload and an optional state delta.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub result: serde_json::Value,
    #[serde(default, skip_serializing_if = "StateMap::is_empty")]
    pub state_delta: StateMap,
}

impl ToolResponse {
    pub fn new(result: serde_json::Value) -> Self {
        Self {
            result,
            state_delta: StateMap::new(),
        }
    }

    pub fn with_delta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.state_delta.insert(key.into(), value);
        self
    }
}

/// An in-process tool implementation.
///
/// Handlers are registered in the tool registry and can also be hosted as a
/// plugin, in which case remote callers see exactly the same behaviour.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// The unique name of this tool.
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the model).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's arguments.
    fn input_schema(&self) -> serde_json::Value;

    /// State keys this tool reads. `None` requests the whole state.
    fn state_keys(&self) -> Option<Vec<String>> {
        None
    }

    /// Execute the tool.
    async fn invoke(
        &self,
        invocation: ToolInvocation,
    ) -> std::result::Result<ToolResponse, ToolExecutionError>;

    /// Convert this handler into a local ToolDefinition.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
            state_keys: self.state_keys(),
            target: ToolTarget::Local,
        }
    }
}
