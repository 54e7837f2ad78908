//! Tool dispatcher: runs tool calls against local handlers or plugins.
//!
//! Both paths receive the same [`ToolInvocation`] and hand back the same
//! [`ToolResponse`]. Every failure becomes an error [`ToolCallResult`]; the
//! dispatcher never returns `Err` to the loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use opsloop_core::error::ToolExecutionError;
use opsloop_core::retry::RetryPolicy;
use opsloop_core::session::StateMap;
use opsloop_core::tool::{
    ToolCallRequest, ToolCallResult, ToolDefinition, ToolHandler, ToolInvocation, ToolResponse,
};
use tracing::{debug, info, warn};

use crate::plugin::{PluginClient, PluginError};
use crate::registry::{ResolvedTool, ToolRegistry};

/// The result of one dispatched call.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub result: ToolCallResult,
    /// Empty unless the call succeeded
    pub state_delta: StateMap,
    pub duration: Duration,
    pub attempts: u32,
}

impl DispatchOutcome {
    fn failed(call: &ToolCallRequest, error: ToolExecutionError, started: Instant, attempts: u32) -> Self {
        Self {
            result: ToolCallResult::error(&call.id, &call.tool_name, error),
            state_delta: StateMap::new(),
            duration: started.elapsed(),
            attempts,
        }
    }
}

/// Executes tool calls with bounded retry for unreachable plugins.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    retry: RetryPolicy,
    call_timeout: Option<Duration>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            retry: RetryPolicy::default(),
            call_timeout: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Bound every individual tool attempt. A timed-out plugin attempt counts
    /// as a network failure and is retried.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Run one call against whatever the registry resolves its name to.
    pub async fn dispatch(
        &self,
        session_id: &str,
        call: &ToolCallRequest,
        state: &StateMap,
    ) -> DispatchOutcome {
        match self.registry.resolve(&call.tool_name) {
            Some(tool) => self.dispatch_resolved(session_id, call, state, tool).await,
            None => DispatchOutcome::failed(
                call,
                ToolExecutionError::UnknownTool {
                    tool: call.tool_name.clone(),
                },
                Instant::now(),
                0,
            ),
        }
    }

    /// Run all calls of one iteration concurrently.
    ///
    /// Outcomes come back in request order whatever order the calls finish
    /// in. Calls naming a tool outside `toolset` fail with `UnknownTool`
    /// without being executed.
    pub async fn dispatch_batch(
        &self,
        session_id: &str,
        calls: &[ToolCallRequest],
        state: &StateMap,
        toolset: &[ToolDefinition],
    ) -> Vec<DispatchOutcome> {
        let futures = calls.iter().map(|call| async move {
            if !toolset.iter().any(|t| t.name == call.tool_name) {
                return DispatchOutcome::failed(
                    call,
                    ToolExecutionError::UnknownTool {
                        tool: call.tool_name.clone(),
                    },
                    Instant::now(),
                    0,
                );
            }
            self.dispatch(session_id, call, state).await
        });
        let outcomes = futures::future::join_all(futures).await;

        let failed = outcomes.iter().filter(|o| !o.result.is_success()).count();
        debug!(
            session_id,
            calls = outcomes.len(),
            failed,
            "Tool batch dispatched"
        );
        outcomes
    }

    async fn dispatch_resolved(
        &self,
        session_id: &str,
        call: &ToolCallRequest,
        state: &StateMap,
        tool: ResolvedTool,
    ) -> DispatchOutcome {
        let started = Instant::now();
        let definition = tool.definition();

        let args = match validate_arguments(&definition.input_schema, &call.arguments) {
            Ok(args) => args,
            Err(e) => return DispatchOutcome::failed(call, e, started, 0),
        };

        let invocation = ToolInvocation {
            session_id: session_id.to_string(),
            tool: call.tool_name.clone(),
            args,
            state: definition.state_slice(state),
        };

        let (response, attempts) = match &tool {
            ResolvedTool::Local { handler, .. } => {
                (self.invoke_local(handler.clone(), invocation).await, 1)
            }
            ResolvedTool::Plugin { client, .. } => self.invoke_plugin(client, invocation).await,
        };

        match response {
            Ok(response) => {
                debug!(
                    session_id,
                    tool = %call.tool_name,
                    attempts,
                    delta_keys = response.state_delta.len(),
                    "Tool call succeeded"
                );
                DispatchOutcome {
                    result: ToolCallResult::success(&call.id, &call.tool_name, response.result),
                    state_delta: response.state_delta,
                    duration: started.elapsed(),
                    attempts,
                }
            }
            Err(e) => {
                warn!(session_id, tool = %call.tool_name, attempts, error = %e, "Tool call failed");
                DispatchOutcome::failed(call, e, started, attempts)
            }
        }
    }

    async fn invoke_local(
        &self,
        handler: Arc<dyn ToolHandler>,
        invocation: ToolInvocation,
    ) -> Result<ToolResponse, ToolExecutionError> {
        let tool = invocation.tool.clone();
        // A panicking handler must not take the loop down with it
        let mut task = tokio::spawn(async move { handler.invoke(invocation).await });

        let joined = match self.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    task.abort();
                    return Err(ToolExecutionError::handler_failed(
                        tool,
                        format!("timed out after {}ms", limit.as_millis()),
                    ));
                }
            },
            None => task.await,
        };

        match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(ToolExecutionError::handler_failed(tool, "handler panicked")),
            Err(e) => Err(ToolExecutionError::handler_failed(tool, e.to_string())),
        }
    }

    async fn invoke_plugin(
        &self,
        client: &PluginClient,
        invocation: ToolInvocation,
    ) -> (Result<ToolResponse, ToolExecutionError>, u32) {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match self.call_timeout {
                Some(limit) => tokio::time::timeout(limit, client.invoke(&invocation))
                    .await
                    .unwrap_or_else(|_| {
                        Err(PluginError::Timeout {
                            plugin: client.name().to_string(),
                            reason: format!("no response within {}ms", limit.as_millis()),
                        })
                    }),
                None => client.invoke(&invocation).await,
            };

            match result {
                Ok(response) => return (Ok(response), attempt),
                Err(e) if e.is_network() && self.retry.allows_retry(attempt) => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        plugin = %client.name(),
                        tool = %invocation.tool,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Plugin call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return (Err(e.into_tool_error(&invocation.tool)), attempt),
            }
        }
    }

    /// Tell every plugin a session is over. Failures are logged only.
    pub async fn release_session(&self, session_id: &str) {
        let clients = self.registry.plugin_clients();
        let releases = clients.iter().map(|client| async move {
            match client.release(session_id).await {
                Ok(()) => debug!(plugin = %client.name(), session_id, "Session released"),
                Err(e) => {
                    warn!(plugin = %client.name(), session_id, error = %e, "Session release failed")
                }
            }
        });
        futures::future::join_all(releases).await;
        if !clients.is_empty() {
            info!(session_id, plugins = clients.len(), "Plugin resources released");
        }
    }
}

/// Fold the deltas of successful calls in request order, last write wins.
pub fn merge_deltas(outcomes: &[DispatchOutcome]) -> StateMap {
    let mut merged = StateMap::new();
    for outcome in outcomes.iter().filter(|o| o.result.is_success()) {
        for (key, value) in &outcome.state_delta {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Check arguments against the parts of a JSON schema the dispatcher
/// enforces: an object with every `required` property present.
///
/// `null` arguments are treated as an empty object.
pub fn validate_arguments(
    schema: &serde_json::Value,
    args: &serde_json::Value,
) -> Result<serde_json::Value, ToolExecutionError> {
    let args = match args {
        serde_json::Value::Null => serde_json::Value::Object(serde_json::Map::new()),
        serde_json::Value::Object(_) => args.clone(),
        other => {
            return Err(ToolExecutionError::invalid_arguments(format!(
                "expected a JSON object, got {}",
                json_type(other)
            )));
        }
    };

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        let missing: Vec<&str> = required
            .iter()
            .filter_map(|r| r.as_str())
            .filter(|key| args.get(key).is_none_or(|v| v.is_null()))
            .collect();
        if !missing.is_empty() {
            return Err(ToolExecutionError::invalid_arguments(format!(
                "missing required argument(s): {}",
                missing.join(", ")
            )));
        }
    }

    Ok(args)
}

fn json_type(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
