//! Built-in session-state tools.
//!
//! `session_remember` stores a value under a key, `session_recall` reads keys
//! back. Both work purely through the invocation contract (state slice in,
//! state delta out), so they behave the same locally and behind a plugin host.

use std::sync::Arc;

use async_trait::async_trait;
use opsloop_core::error::ToolExecutionError;
use opsloop_core::tool::{ToolHandler, ToolInvocation, ToolResponse};
use serde_json::json;

/// Every built-in handler.
pub fn builtin_handlers() -> Vec<Arc<dyn ToolHandler>> {
    vec![Arc::new(SessionRememberTool), Arc::new(SessionRecallTool)]
}

pub struct SessionRememberTool;

#[async_trait]
impl ToolHandler for SessionRememberTool {
    fn name(&self) -> &str {
        "session_remember"
    }

    fn description(&self) -> &str {
        "Remember a fact for the rest of this session. Stores `value` under `key` in the session state."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "key": {
                    "type": "string",
                    "description": "State key, e.g. 'namespace' or 'suspect_pod'"
                },
                "value": {
                    "description": "Any JSON value to store"
                }
            },
            "required": ["key", "value"]
        })
    }

    fn state_keys(&self) -> Option<Vec<String>> {
        Some(Vec::new())
    }

    async fn invoke(&self, invocation: ToolInvocation) -> Result<ToolResponse, ToolExecutionError> {
        let key = invocation.args["key"]
            .as_str()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ToolExecutionError::invalid_arguments("'key' must be a non-empty string"))?;
        let value = invocation.args["value"].clone();

        Ok(ToolResponse::new(json!({"remembered": key})).with_delta(key, value))
    }
}

pub struct SessionRecallTool;

#[async_trait]
impl ToolHandler for SessionRecallTool {
    fn name(&self) -> &str {
        "session_recall"
    }

    fn description(&self) -> &str {
        "Recall facts stored in this session. Returns the requested keys, or every key when none are given."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "keys": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Keys to read; omit to read everything"
                }
            }
        })
    }

    async fn invoke(&self, invocation: ToolInvocation) -> Result<ToolResponse, ToolExecutionError> {
        let keys = match &invocation.args["keys"] {
            serde_json::Value::Null => return Ok(ToolResponse::new(json!(invocation.state))),
            serde_json::Value::Array(keys) => keys,
            _ => {
                return Err(ToolExecutionError::invalid_arguments(
                    "'keys' must be an array of strings",
                ));
            }
        };

        let mut found = serde_json::Map::new();
        for key in keys {
            let key = key
                .as_str()
                .ok_or_else(|| ToolExecutionError::invalid_arguments("'keys' must be an array of strings"))?;
            let value = invocation.state.get(key).cloned().unwrap_or(serde_json::Value::Null);
            found.insert(key.to_string(), value);
        }
        Ok(ToolResponse::new(serde_json::Value::Object(found)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsloop_core::session::StateMap;

    fn invocation(tool: &str, args: serde_json::Value, state: StateMap) -> ToolInvocation {
        ToolInvocation {
            session_id: "s-1".into(),
            tool: tool.into(),
            args,
            state,
        }
    }

    #[tokio::test]
    async fn remember_emits_a_delta() {
        let resp = SessionRememberTool
            .invoke(invocation(
                "session_remember",
                json!({"key": "namespace", "value": "payments"}),
                StateMap::new(),
            ))
            .await
            .unwrap();
        assert_eq!(resp.state_delta["namespace"], "payments");
        assert_eq!(resp.result["remembered"], "namespace");

        let err = SessionRememberTool
            .invoke(invocation(
                "session_remember",
                json!({"key": " ", "value": 1}),
                StateMap::new(),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolExecutionError::InvalidArguments { .. }));
    }

    #[tokio::test]
    async fn recall_reads_from_state() {
        let mut state = StateMap::new();
        state.insert("namespace".into(), json!("payments"));
        state.insert("replicas".into(), json!(3));

        let resp = SessionRecallTool
            .invoke(invocation(
                "session_recall",
                json!({"keys": ["namespace", "missing"]}),
                state.clone(),
            ))
            .await
            .unwrap();
        assert_eq!(resp.result, json!({"namespace": "payments", "missing": null}));
        assert!(resp.state_delta.is_empty());

        let resp = SessionRecallTool
            .invoke(invocation("session_recall", json!({}), state))
            .await
            .unwrap();
        assert_eq!(resp.result["replicas"], 3);
    }

    #[test]
    fn remember_needs_no_state() {
        assert_eq!(SessionRememberTool.state_keys(), Some(Vec::new()));
        assert_eq!(builtin_handlers().len(), 2);
    }
}
