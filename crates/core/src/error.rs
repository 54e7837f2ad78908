//! Error types for the opsloop domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error type; [`Error`] wraps them all.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The top-level error type for all opsloop operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Tool registry errors ---
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    // --- Session store errors ---
    #[error("Session store error: {0}")]
    Store(#[from] StoreError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Failure of a single provider (AI backend) call.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Malformed provider response: {message}")]
    MalformedResponse { message: String },

    #[error("Provider not configured: {message}")]
    NotConfigured { message: String },

    #[error("Request timed out: {message}")]
    Timeout { message: String },

    #[error("Network error: {message}")]
    Network { message: String },
}

impl ProviderError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout { message: message.into() }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedResponse { message: message.into() }
    }

    pub fn not_configured(message: impl Into<String>) -> Self {
        Self::NotConfigured { message: message.into() }
    }

    /// Network, timeout, rate-limit and 5xx failures may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } | Self::RateLimited { .. } => true,
            Self::ApiError { status_code, .. } => *status_code >= 500,
            _ => false,
        }
    }

    /// The minimum wait the backend asked for, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(Duration::from_secs(*retry_after_secs)),
            _ => None,
        }
    }
}

/// A tool call that did not produce a successful result.
///
/// These never abort the loop: the dispatcher turns them into
/// `ToolOutcome::Error` so the model sees the failure and can adapt.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolExecutionError {
    #[error("Unknown tool: {tool}")]
    UnknownTool { tool: String },

    #[error("Invalid tool arguments: {reason}")]
    InvalidArguments { reason: String },

    #[error("Tool call rejected (status {status}): {reason}")]
    Rejected { status: u16, reason: String },

    #[error("plugin unreachable: {plugin} ({reason})")]
    PluginUnreachable { plugin: String, reason: String },

    #[error("Tool execution failed: {tool}: {reason}")]
    HandlerFailed { tool: String, reason: String },
}

impl ToolExecutionError {
    pub fn invalid_arguments(reason: impl Into<String>) -> Self {
        Self::InvalidArguments { reason: reason.into() }
    }

    pub fn handler_failed(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::HandlerFailed {
            tool: tool.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegistryError {
    #[error("Tool already registered: {name}")]
    DuplicateTool { name: String },

    #[error("Tool not registered: {name}")]
    UnknownTool { name: String },

    #[error("Plugin discovery failed for {plugin}: {reason}")]
    Discovery { plugin: String, reason: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    NotFound(String),

    /// The persisted record exists but cannot be decoded. Never deleted automatically.
    #[error("Session {id} is corrupted at {}: {reason}", .path.display())]
    Corrupted {
        id: String,
        path: PathBuf,
        reason: String,
    },

    #[error("Session {id} is closed ({status})")]
    Closed { id: String, status: String },

    #[error("Invalid session id: {0}")]
    InvalidId(String),

    #[error("Storage error: {0}")]
    Io(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_displays_correctly() {
        let err = Error::Provider(ProviderError::ApiError {
            status_code: 429,
            message: "Too many requests".into(),
        });
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("Too many requests"));
    }

    #[test]
    fn retryable_classification() {
        assert!(ProviderError::network("refused").is_retryable());
        assert!(ProviderError::timeout("slow").is_retryable());
        assert!(ProviderError::RateLimited { retry_after_secs: 3 }.is_retryable());
        assert!(
            ProviderError::ApiError {
                status_code: 503,
                message: "overloaded".into()
            }
            .is_retryable()
        );
        assert!(
            !ProviderError::ApiError {
                status_code: 400,
                message: "bad".into()
            }
            .is_retryable()
        );
        assert!(!ProviderError::malformed("garbage").is_retryable());
        assert!(
            !ProviderError::AuthenticationFailed {
                message: "nope".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn rate_limit_carries_retry_after() {
        let err = ProviderError::RateLimited { retry_after_secs: 7 };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(ProviderError::network("x").retry_after(), None);
    }

    #[test]
    fn unreachable_plugin_message() {
        let err = ToolExecutionError::PluginUnreachable {
            plugin: "kubernetes".into(),
            reason: "connection refused".into(),
        };
        assert!(err.to_string().starts_with("plugin unreachable"));
    }

    #[test]
    fn tool_error_serializes_with_kind_tag() {
        let err = ToolExecutionError::invalid_arguments("missing 'namespace'");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "invalid_arguments");
        assert_eq!(json["reason"], "missing 'namespace'");
    }

    #[test]
    fn corrupted_session_mentions_path() {
        let err = StoreError::Corrupted {
            id: "abc".into(),
            path: PathBuf::from("/tmp/abc.json"),
            reason: "expected value at line 1".into(),
        };
        let text = err.to_string();
        assert!(text.contains("/tmp/abc.json"));
        assert!(text.contains("line 1"));
    }
}
