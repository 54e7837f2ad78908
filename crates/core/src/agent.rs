//! Loop configuration supplied by callers of the agentic loop.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Default iteration budget per loop invocation.
pub const DEFAULT_MAX_ITERATIONS: u32 = 20;

/// Per-invocation settings: what the model is told, which tools it sees,
/// and when the loop must stop.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Instructions for the model
    pub system_prompt: String,

    /// Names of the tools visible to the model. Empty means every registered tool.
    pub toolset: Vec<String>,

    /// Maximum number of tool-executing iterations
    pub max_iterations: u32,

    /// Whole-loop deadline, measured from the start of the run
    pub deadline: Option<Duration>,

    /// Cooperative cancellation signal
    pub cancel: CancellationToken,

    pub temperature: f32,

    pub max_tokens: Option<u32>,
}

impl LoopConfig {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            toolset: Vec::new(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            deadline: None,
            cancel: CancellationToken::new(),
            temperature: 0.2,
            max_tokens: None,
        }
    }

    pub fn with_tools<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.toolset = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }
}
