//! The agentic loop: the heart of opsloop.
//!
//! The loop follows an **ask → act → observe** cycle:
//!
//! 1. **Ask** the provider for a decision, given the transcript, the
//!    visible toolset and the merged session state
//! 2. **Act**: if it requested tools, dispatch them all concurrently
//! 3. **Observe**: commit the calls, their results (in request order) and
//!    the merged state delta to the session in one write, then loop
//!
//! The loop ends on a final answer, an exhausted iteration budget, a
//! provider failure that outlasts its retries, or cancellation. Callers
//! always get a [`LoopOutcome`] carrying the transcript so far.

pub mod batch;
pub mod lease;
pub mod loop_runner;

pub use batch::{BatchJob, BatchRunner, DEFAULT_BATCH_CONCURRENCY};
pub use lease::{SessionLease, SessionLeases};
pub use loop_runner::{AgentLoop, LoopFailure, LoopOutcome, Termination};
