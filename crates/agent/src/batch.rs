//! Bounded worker pool for running many independent sessions at once.
//!
//! Each job drives its own session, so jobs never contend on session state.
//! They do share the provider gate and the plugin registry.

use futures::StreamExt;
use opsloop_core::agent::LoopConfig;
use opsloop_core::session::{SessionId, StateMap};
use tracing::info;

use crate::loop_runner::{AgentLoop, LoopOutcome};

/// Default number of loops run at once.
pub const DEFAULT_BATCH_CONCURRENCY: usize = 5;

/// One unit of batch work.
#[derive(Debug, Clone)]
pub enum BatchJob {
    /// Create a fresh session and run it
    Start {
        config: LoopConfig,
        initial_state: StateMap,
        message: String,
    },
    /// Continue an existing session
    Resume {
        session_id: SessionId,
        config: LoopConfig,
        message: Option<String>,
    },
}

impl BatchJob {
    pub fn start(config: LoopConfig, initial_state: StateMap, message: impl Into<String>) -> Self {
        Self::Start {
            config,
            initial_state,
            message: message.into(),
        }
    }
}

/// Runs jobs on at most `concurrency` loops at a time.
pub struct BatchRunner<'a> {
    agent: &'a AgentLoop,
    concurrency: usize,
}

impl<'a> BatchRunner<'a> {
    pub fn new(agent: &'a AgentLoop, concurrency: usize) -> Self {
        Self {
            agent,
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run every job. Outcomes are returned in job order.
    pub async fn run(&self, jobs: Vec<BatchJob>) -> Vec<LoopOutcome> {
        let total = jobs.len();
        info!(jobs = total, concurrency = self.concurrency, "Batch started");

        let outcomes: Vec<LoopOutcome> = futures::stream::iter(jobs)
            .map(|job| self.run_job(job))
            .buffered(self.concurrency)
            .collect()
            .await;

        let completed = outcomes.iter().filter(|o| o.is_completed()).count();
        info!(jobs = total, completed, "Batch finished");
        outcomes
    }

    async fn run_job(&self, job: BatchJob) -> LoopOutcome {
        match job {
            BatchJob::Start {
                config,
                initial_state,
                message,
            } => self.agent.start(config, initial_state, message).await,
            BatchJob::Resume {
                session_id,
                config,
                message,
            } => self.agent.resume(&session_id, config, message).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use opsloop_core::error::ProviderError;
    use opsloop_core::message::TokenUsage;
    use opsloop_core::provider::{Decision, Provider, ProviderRequest};
    use opsloop_session::InMemorySessionStore;
    use opsloop_tools::{Dispatcher, ToolRegistry};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Answers with the last user message after a short delay, tracking
    /// how many calls overlap.
    #[derive(Default)]
    struct SlowEcho {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Provider for SlowEcho {
        fn name(&self) -> &str {
            "slow-echo"
        }

        async fn decide(&self, request: ProviderRequest) -> Result<Decision, ProviderError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            let text = request
                .turns
                .last()
                .map(|t| t.content.clone())
                .unwrap_or_default();
            Ok(Decision::Final {
                text,
                usage: TokenUsage::new(1, 1),
            })
        }
    }

    #[tokio::test]
    async fn jobs_run_bounded_and_in_order() {
        let provider = Arc::new(SlowEcho::default());
        let store = Arc::new(InMemorySessionStore::new());
        let dispatcher = Dispatcher::new(Arc::new(ToolRegistry::new()));
        let agent = AgentLoop::new(provider.clone(), dispatcher, store);

        let jobs = (0..8)
            .map(|i| BatchJob::start(LoopConfig::new("scan"), StateMap::new(), format!("resource-{i}")))
            .collect();
        let runner = BatchRunner::new(&agent, 3);
        let outcomes = runner.run(jobs).await;

        assert_eq!(outcomes.len(), 8);
        for (i, outcome) in outcomes.iter().enumerate() {
            assert!(outcome.is_completed());
            assert_eq!(outcome.final_text.as_deref(), Some(format!("resource-{i}").as_str()));
        }
        assert!(provider.peak.load(Ordering::SeqCst) <= 3);
        assert!(provider.peak.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn resume_jobs_share_leases() {
        let provider = Arc::new(SlowEcho::default());
        let store = Arc::new(InMemorySessionStore::new());
        let dispatcher = Dispatcher::new(Arc::new(ToolRegistry::new()));
        let agent = AgentLoop::new(provider, dispatcher, store.clone());

        let id = opsloop_core::session::SessionStore::create(store.as_ref(), StateMap::new())
            .await
            .unwrap();
        let job = BatchJob::Resume {
            session_id: id.clone(),
            config: LoopConfig::new("scan"),
            message: Some("twice".into()),
        };
        let outcomes = BatchRunner::new(&agent, 2).run(vec![job.clone(), job]).await;

        // Both jobs target one session: one runs, the other is refused
        let busy = outcomes
            .iter()
            .filter(|o| matches!(o.failure(), Some(crate::LoopFailure::SessionBusy(_))))
            .count();
        assert_eq!(busy, 1);
        assert_eq!(outcomes.iter().filter(|o| o.is_completed()).count(), 1);
    }
}
