//! # opsloop core
//!
//! Domain types, traits, and error definitions for the opsloop agentic
//! tool-calling runtime. This crate has **no framework dependencies**: it
//! defines the model that the provider, tool, session and agent crates
//! implement against.
//!
//! ## Design Philosophy
//!
//! Every subsystem seam is a trait here ([`Provider`], [`ToolHandler`],
//! [`SessionStore`], [`IterationHook`]). Implementations live in their
//! respective crates, so tests can swap in scripted providers and
//! in-memory stores.

pub mod agent;
pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod retry;
pub mod session;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use agent::{DEFAULT_MAX_ITERATIONS, LoopConfig};
pub use error::{
    Error, ProviderError, RegistryError, Result, StoreError, ToolExecutionError,
};
pub use event::{EventBus, IterationHook, IterationReport, LoopEvent, ToolCallSummary};
pub use message::{ConversationTurn, Role, TokenUsage};
pub use provider::{Decision, Provider, ProviderRequest};
pub use retry::RetryPolicy;
pub use session::{
    Session, SessionId, SessionLock, SessionStatus, SessionStore, SessionSummary, SessionUpdate,
    StateMap,
};
pub use tool::{
    ToolCallRequest, ToolCallResult, ToolDefinition, ToolHandler, ToolInvocation, ToolOutcome,
    ToolResponse, ToolTarget,
};
pub use tokio_util::sync::CancellationToken;
