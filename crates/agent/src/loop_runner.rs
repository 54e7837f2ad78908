//! The agentic loop controller.
//!
//! One run drives one session through
//! `AWAITING_PROVIDER -> EXECUTING_TOOLS -> AWAITING_PROVIDER -> ... -> DONE`
//! until the provider gives a final answer, the iteration budget runs out,
//! the provider fails for good, or the caller cancels. Every completed
//! iteration is committed to the session store in a single write.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use opsloop_core::agent::LoopConfig;
use opsloop_core::error::{ProviderError, RegistryError, StoreError};
use opsloop_core::event::{EventBus, IterationHook, IterationReport, LoopEvent, ToolCallSummary};
use opsloop_core::message::{ConversationTurn, TokenUsage};
use opsloop_core::provider::{Decision, Provider, ProviderRequest};
use opsloop_core::retry::RetryPolicy;
use opsloop_core::session::{
    Session, SessionId, SessionStatus, SessionStore, SessionUpdate, StateMap,
};
use opsloop_core::tool::ToolDefinition;
use opsloop_tools::{Dispatcher, merge_deltas};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::lease::SessionLeases;

/// Why a loop stopped without an answer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LoopFailure {
    #[error("iteration budget of {max_iterations} exceeded")]
    IterationBudgetExceeded { max_iterations: u32 },

    #[error("provider failed: {0}")]
    Provider(ProviderError),

    #[error("session {id} is corrupted at {}: {reason}", .path.display())]
    SessionCorruption {
        id: String,
        path: PathBuf,
        reason: String,
    },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session is closed ({status})")]
    SessionClosed { status: String },

    #[error("session {0} is already being driven by another loop")]
    SessionBusy(String),

    #[error("session {id} could not be locked: {reason}")]
    SessionLock { id: String, reason: String },

    #[error("toolset error: {0}")]
    Registry(RegistryError),

    #[error("session store error: {0}")]
    Store(String),
}

impl LoopFailure {
    /// Failures where the loop never owned a writable session.
    fn leaves_session_untouched(&self) -> bool {
        matches!(
            self,
            Self::SessionCorruption { .. }
                | Self::SessionNotFound(_)
                | Self::SessionClosed { .. }
                | Self::SessionBusy(_)
                | Self::SessionLock { .. }
        )
    }
}

impl From<StoreError> for LoopFailure {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::SessionNotFound(id),
            StoreError::Corrupted { id, path, reason } => Self::SessionCorruption { id, path, reason },
            StoreError::Closed { status, .. } => Self::SessionClosed { status },
            other => Self::Store(other.to_string()),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    Completed,
    Failed(LoopFailure),
    Cancelled,
}

impl Termination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed(_) => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Everything a caller gets back from a run, whatever the ending.
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub session_id: SessionId,
    pub termination: Termination,
    pub final_text: Option<String>,
    /// The transcript as of the last committed write
    pub transcript: Vec<ConversationTurn>,
    pub state: StateMap,
    /// Accumulated across every provider call of this run
    pub usage: TokenUsage,
    /// Tool-executing iterations completed in this run
    pub iterations: u32,
    pub provider_calls: u32,
}

impl LoopOutcome {
    pub fn is_completed(&self) -> bool {
        self.termination == Termination::Completed
    }

    pub fn is_cancelled(&self) -> bool {
        self.termination == Termination::Cancelled
    }

    pub fn failure(&self) -> Option<&LoopFailure> {
        match &self.termination {
            Termination::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Why a provider decision did not arrive.
enum Interrupted {
    Cancelled,
    Failed(ProviderError),
}

/// Mutable bookkeeping for one run.
struct RunState {
    session_id: SessionId,
    transcript: Vec<ConversationTurn>,
    state: StateMap,
    usage: TokenUsage,
    iterations: u32,
    provider_calls: u32,
    deadline: Option<Instant>,
}

impl RunState {
    fn sync(&mut self, session: Session) {
        self.transcript = session.turns;
        self.state = session.state;
    }
}

/// Drives sessions through provider decisions and tool dispatch.
pub struct AgentLoop {
    /// The AI backend, usually behind a concurrency gate
    provider: Arc<dyn Provider>,

    /// Tool dispatch shared with every other loop in the process
    dispatcher: Dispatcher,

    store: Arc<dyn SessionStore>,

    leases: SessionLeases,

    hook: Option<Arc<dyn IterationHook>>,

    events: Option<Arc<EventBus>>,

    provider_retry: RetryPolicy,

    /// Bound on each provider attempt
    iteration_timeout: Option<Duration>,

    model: String,
}

impl AgentLoop {
    pub fn new(
        provider: Arc<dyn Provider>,
        dispatcher: Dispatcher,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            provider,
            dispatcher,
            store,
            leases: SessionLeases::new(),
            hook: None,
            events: None,
            provider_retry: RetryPolicy::default(),
            iteration_timeout: None,
            model: String::new(),
        }
    }

    /// Observe every completed iteration.
    pub fn with_hook(mut self, hook: Arc<dyn IterationHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Publish provider, iteration and termination events on `bus`.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.hook = Some(bus.clone());
        self.events = Some(bus);
        self
    }

    pub fn with_provider_retry(mut self, retry: RetryPolicy) -> Self {
        self.provider_retry = retry;
        self
    }

    pub fn with_iteration_timeout(mut self, timeout: Duration) -> Self {
        self.iteration_timeout = Some(timeout);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Share leases with other loops so they exclude each other too.
    pub fn with_leases(mut self, leases: SessionLeases) -> Self {
        self.leases = leases;
        self
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn leases(&self) -> &SessionLeases {
        &self.leases
    }

    /// Create a session seeded with `initial_state` and run it.
    pub async fn start(
        &self,
        config: LoopConfig,
        initial_state: StateMap,
        user_message: impl Into<String>,
    ) -> LoopOutcome {
        match self.store.create(initial_state).await {
            Ok(id) => {
                info!(session_id = %id, "Session created");
                self.resume(&id, config, Some(user_message.into())).await
            }
            Err(e) => {
                warn!(error = %e, "Failed to create session");
                LoopOutcome {
                    session_id: SessionId::from(""),
                    termination: Termination::Failed(e.into()),
                    final_text: None,
                    transcript: Vec::new(),
                    state: StateMap::new(),
                    usage: TokenUsage::default(),
                    iterations: 0,
                    provider_calls: 0,
                }
            }
        }
    }

    /// Continue an existing session, optionally with a new user message.
    ///
    /// Cancelled and failed sessions are reactivated. Finished and expired
    /// sessions cannot be resumed.
    pub async fn resume(
        &self,
        session_id: &SessionId,
        config: LoopConfig,
        user_message: Option<String>,
    ) -> LoopOutcome {
        let mut run = RunState {
            session_id: session_id.clone(),
            transcript: Vec::new(),
            state: StateMap::new(),
            usage: TokenUsage::default(),
            iterations: 0,
            provider_calls: 0,
            deadline: config.deadline.map(|d| Instant::now() + d),
        };

        let Some(_lease) = self.leases.try_acquire(session_id) else {
            warn!(session_id = %session_id, "Session already running");
            return self.busy(run).await;
        };
        // Held until the final status is written
        let _store_lock = match self.store.try_lock(session_id).await {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                warn!(session_id = %session_id, "Session locked by another process");
                return self.busy(run).await;
            }
            Err(e) => {
                let failure = LoopFailure::SessionLock {
                    id: session_id.to_string(),
                    reason: e.to_string(),
                };
                return self.finish(run, Termination::Failed(failure), None).await;
            }
        };

        let session = match self.store.load(session_id).await {
            Ok(session) => session,
            Err(e) => return self.finish(run, Termination::Failed(e.into()), None).await,
        };
        if session.status.is_closed() {
            let failure = LoopFailure::SessionClosed {
                status: session.status.to_string(),
            };
            run.sync(session);
            return self.finish(run, Termination::Failed(failure), None).await;
        }
        let reactivate = session.status != SessionStatus::Active;
        run.sync(session);

        let toolset = match self.dispatcher.registry().resolve_toolset(&config.toolset) {
            Ok(toolset) => toolset,
            Err(e) => return self.finish(run, Termination::Failed(LoopFailure::Registry(e)), None).await,
        };

        if reactivate || user_message.is_some() {
            let update = SessionUpdate {
                turns: user_message.into_iter().map(ConversationTurn::user).collect(),
                delta: StateMap::new(),
                status: Some(SessionStatus::Active),
            };
            match self.store.apply(session_id, update).await {
                Ok(session) => run.sync(session),
                Err(e) => return self.finish(run, Termination::Failed(e.into()), None).await,
            }
        }

        info!(
            session_id = %session_id,
            provider = %self.provider.name(),
            tools = toolset.len(),
            max_iterations = config.max_iterations,
            "Loop started"
        );

        let (termination, final_text) = self.drive(&mut run, &config, &toolset).await;
        self.finish(run, termination, final_text).await
    }

    async fn busy(&self, mut run: RunState) -> LoopOutcome {
        if let Ok(session) = self.store.load(&run.session_id).await {
            run.sync(session);
        }
        let failure = LoopFailure::SessionBusy(run.session_id.to_string());
        self.finish(run, Termination::Failed(failure), None).await
    }

    async fn drive(
        &self,
        run: &mut RunState,
        config: &LoopConfig,
        toolset: &[ToolDefinition],
    ) -> (Termination, Option<String>) {
        loop {
            let request = ProviderRequest {
                model: self.model.clone(),
                system_prompt: config.system_prompt.clone(),
                turns: run.transcript.clone(),
                tools: toolset.to_vec(),
                state: run.state.clone(),
                temperature: config.temperature,
                max_tokens: config.max_tokens,
            };

            let decision = match self.decide(run, config, request).await {
                Ok(decision) => decision,
                Err(Interrupted::Cancelled) => return (Termination::Cancelled, None),
                Err(Interrupted::Failed(e)) => {
                    return (Termination::Failed(LoopFailure::Provider(e)), None);
                }
            };

            let (calls, preamble, usage) = match decision {
                Decision::ToolCalls {
                    calls,
                    preamble,
                    usage,
                } if !calls.is_empty() => (calls, preamble, usage),
                Decision::ToolCalls {
                    preamble: text,
                    usage,
                    ..
                }
                | Decision::Final { text, usage } => {
                    let turn = ConversationTurn::assistant(&text, Some(usage));
                    return match self.store.append(&run.session_id, turn).await {
                        Ok(session) => {
                            run.sync(session);
                            (Termination::Completed, Some(text))
                        }
                        Err(e) => (Termination::Failed(e.into()), None),
                    };
                }
            };

            if run.iterations >= config.max_iterations {
                warn!(
                    session_id = %run.session_id,
                    max_iterations = config.max_iterations,
                    requested_calls = calls.len(),
                    "Iteration budget exhausted"
                );
                return (
                    Termination::Failed(LoopFailure::IterationBudgetExceeded {
                        max_iterations: config.max_iterations,
                    }),
                    None,
                );
            }

            let iteration = run.iterations + 1;
            debug!(
                session_id = %run.session_id,
                iteration,
                calls = calls.len(),
                "Executing tool calls"
            );

            // In-flight calls always drain; a stop signal only discards them
            let outcomes = self
                .dispatcher
                .dispatch_batch(run.session_id.as_str(), &calls, &run.state, toolset)
                .await;
            if self.should_stop(config, run.deadline) {
                info!(
                    session_id = %run.session_id,
                    iteration,
                    "Cancelled during tool execution, discarding results"
                );
                return (Termination::Cancelled, None);
            }

            let mut turns = Vec::with_capacity(outcomes.len() + 1);
            turns.push(ConversationTurn::assistant_tool_calls(
                preamble,
                calls,
                Some(usage),
            ));
            turns.extend(outcomes.iter().map(|o| ConversationTurn::tool(o.result.clone())));
            let update = SessionUpdate {
                turns,
                delta: merge_deltas(&outcomes),
                status: None,
            };

            match self.store.apply(&run.session_id, update).await {
                Ok(session) => run.sync(session),
                Err(e) => return (Termination::Failed(e.into()), None),
            }
            run.iterations = iteration;

            let report = IterationReport {
                session_id: run.session_id.to_string(),
                iteration,
                tool_calls: outcomes
                    .iter()
                    .map(|o| ToolCallSummary {
                        call_id: o.result.call_id.clone(),
                        tool_name: o.result.tool_name.clone(),
                        success: o.result.is_success(),
                        duration_ms: o.duration.as_millis() as u64,
                    })
                    .collect(),
            };
            debug!(
                session_id = %run.session_id,
                iteration,
                succeeded = report.succeeded().count(),
                failed = report.failed().count(),
                "Iteration committed"
            );
            if let Some(hook) = &self.hook {
                hook.on_iteration(&report);
            }
        }
    }

    fn should_stop(&self, config: &LoopConfig, deadline: Option<Instant>) -> bool {
        config.cancel.is_cancelled() || deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// One provider decision, with bounded retry.
    ///
    /// Retryable errors back off per the retry policy (never shorter than a
    /// server-requested `retry_after`). A malformed response is retried once.
    /// Cancellation and the deadline interrupt both the call and the backoff.
    async fn decide(
        &self,
        run: &mut RunState,
        config: &LoopConfig,
        request: ProviderRequest,
    ) -> Result<Decision, Interrupted> {
        let mut attempt = 0;
        let mut malformed_retried = false;

        loop {
            if self.should_stop(config, run.deadline) {
                return Err(Interrupted::Cancelled);
            }
            attempt += 1;
            run.provider_calls += 1;

            let call = self.bounded_decide(request.clone());
            let result = tokio::select! {
                _ = config.cancel.cancelled() => return Err(Interrupted::Cancelled),
                _ = wait_until(run.deadline) => return Err(Interrupted::Cancelled),
                result = call => result,
            };

            match result {
                Ok(decision) => {
                    let usage = decision.usage();
                    run.usage += usage;
                    self.publish_provider_call(run, attempt, true, usage.total());
                    return Ok(decision);
                }
                Err(e) => {
                    self.publish_provider_call(run, attempt, false, 0);
                    let retry = match &e {
                        ProviderError::MalformedResponse { .. } if !malformed_retried => {
                            malformed_retried = true;
                            true
                        }
                        ProviderError::MalformedResponse { .. } => false,
                        _ => e.is_retryable() && self.provider_retry.allows_retry(attempt),
                    };
                    if !retry {
                        warn!(session_id = %run.session_id, attempt, error = %e, "Provider call failed");
                        return Err(Interrupted::Failed(e));
                    }

                    let delay = self
                        .provider_retry
                        .delay_for(attempt)
                        .max(e.retry_after().unwrap_or_default());
                    warn!(
                        session_id = %run.session_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Provider call failed, retrying"
                    );
                    tokio::select! {
                        _ = config.cancel.cancelled() => return Err(Interrupted::Cancelled),
                        _ = wait_until(run.deadline) => return Err(Interrupted::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn bounded_decide(&self, request: ProviderRequest) -> Result<Decision, ProviderError> {
        match self.iteration_timeout {
            Some(limit) => tokio::time::timeout(limit, self.provider.decide(request))
                .await
                .unwrap_or_else(|_| {
                    Err(ProviderError::timeout(format!(
                        "no decision within {}ms",
                        limit.as_millis()
                    )))
                }),
            None => self.provider.decide(request).await,
        }
    }

    fn publish_provider_call(&self, run: &RunState, attempt: u32, success: bool, tokens_used: u64) {
        if let Some(events) = &self.events {
            events.publish(LoopEvent::ProviderCalled {
                session_id: run.session_id.to_string(),
                provider: self.provider.name().to_string(),
                attempt,
                success,
                tokens_used,
                timestamp: Utc::now(),
            });
        }
    }

    /// Record the terminal status and build the outcome.
    async fn finish(
        &self,
        mut run: RunState,
        termination: Termination,
        final_text: Option<String>,
    ) -> LoopOutcome {
        let status = match &termination {
            Termination::Completed => None,
            Termination::Cancelled => Some(SessionStatus::Cancelled),
            Termination::Failed(failure) if failure.leaves_session_untouched() => None,
            Termination::Failed(_) => Some(SessionStatus::Failed),
        };
        if let Some(status) = status {
            match self
                .store
                .apply(&run.session_id, SessionUpdate::status(status))
                .await
            {
                Ok(session) => run.sync(session),
                Err(e) => {
                    warn!(session_id = %run.session_id, status = %status, error = %e, "Failed to record session status")
                }
            }
        }

        match &termination {
            Termination::Failed(failure) => warn!(
                session_id = %run.session_id,
                iterations = run.iterations,
                provider_calls = run.provider_calls,
                error = %failure,
                "Loop failed"
            ),
            other => info!(
                session_id = %run.session_id,
                termination = other.as_str(),
                iterations = run.iterations,
                provider_calls = run.provider_calls,
                tokens = run.usage.total(),
                "Loop finished"
            ),
        }
        if let Some(events) = &self.events {
            events.publish(LoopEvent::LoopTerminated {
                session_id: run.session_id.to_string(),
                termination: termination.as_str().to_string(),
                iterations: run.iterations,
                timestamp: Utc::now(),
            });
        }

        LoopOutcome {
            session_id: run.session_id,
            termination,
            final_text,
            transcript: run.transcript,
            state: run.state,
            usage: run.usage,
            iterations: run.iterations,
            provider_calls: run.provider_calls,
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
