//! Loop events: progress reporting decoupled from the loop itself.
//!
//! The loop calls an [`IterationHook`] after every iteration. [`EventBus`]
//! is the stock hook: it fans events out to any number of subscribers
//! (CLI progress output, logs, tests).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// One executed tool call, as reported to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallSummary {
    pub call_id: String,
    pub tool_name: String,
    pub success: bool,
    pub duration_ms: u64,
}

/// What happened in one completed iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationReport {
    pub session_id: String,
    /// 1-based iteration number
    pub iteration: u32,
    pub tool_calls: Vec<ToolCallSummary>,
}

impl IterationReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &ToolCallSummary> {
        self.tool_calls.iter().filter(|c| c.success)
    }

    pub fn failed(&self) -> impl Iterator<Item = &ToolCallSummary> {
        self.tool_calls.iter().filter(|c| !c.success)
    }
}

/// Observation hook fired after each iteration.
pub trait IterationHook: Send + Sync {
    fn on_iteration(&self, report: &IterationReport);
}

/// All loop events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LoopEvent {
    /// A provider call returned
    ProviderCalled {
        session_id: String,
        provider: String,
        attempt: u32,
        success: bool,
        tokens_used: u64,
        timestamp: DateTime<Utc>,
    },

    /// An iteration's tool calls were executed and merged
    IterationCompleted {
        report: IterationReport,
        timestamp: DateTime<Utc>,
    },

    /// The loop reached a terminal state
    LoopTerminated {
        session_id: String,
        /// "completed", "failed" or "cancelled"
        termination: String,
        iterations: u32,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for loop events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
pub struct EventBus {
    sender: broadcast::Sender<Arc<LoopEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: LoopEvent) {
        if self.sender.send(Arc::new(event)).is_err() {
            tracing::trace!("Loop event dropped: no subscribers");
        }
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<LoopEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl IterationHook for EventBus {
    fn on_iteration(&self, report: &IterationReport) {
        self.publish(LoopEvent::IterationCompleted {
            report: report.clone(),
            timestamp: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> IterationReport {
        IterationReport {
            session_id: "s1".into(),
            iteration: 2,
            tool_calls: vec![
                ToolCallSummary {
                    call_id: "a".into(),
                    tool_name: "kubectl_get".into(),
                    success: true,
                    duration_ms: 12,
                },
                ToolCallSummary {
                    call_id: "b".into(),
                    tool_name: "kubectl_logs".into(),
                    success: false,
                    duration_ms: 40,
                },
            ],
        }
    }

    #[tokio::test]
    async fn hook_publishes_iteration_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.on_iteration(&report());

        let event = rx.recv().await.unwrap();
        match event.as_ref() {
            LoopEvent::IterationCompleted { report, .. } => {
                assert_eq!(report.iteration, 2);
                assert_eq!(report.succeeded().count(), 1);
                assert_eq!(report.failed().count(), 1);
            }
            _ => panic!("Expected IterationCompleted event"),
        }
    }

    #[test]
    fn event_bus_no_subscribers_doesnt_panic() {
        let bus = EventBus::default();
        bus.publish(LoopEvent::LoopTerminated {
            session_id: "s1".into(),
            termination: "completed".into(),
            iterations: 1,
            timestamp: Utc::now(),
        });
    }
}
