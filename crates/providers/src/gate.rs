//! Provider-level concurrency gate.
//!
//! Every session sharing a provider goes through the same [`GatedProvider`],
//! so at most `max_concurrency` requests are in flight against that backend
//! no matter how many loops are running.

use std::sync::Arc;

use async_trait::async_trait;
use opsloop_core::error::ProviderError;
use opsloop_core::provider::{Decision, Provider, ProviderRequest};
use tokio::sync::Semaphore;
use tracing::trace;

/// Wraps a provider with a shared semaphore.
pub struct GatedProvider {
    inner: Arc<dyn Provider>,
    permits: Arc<Semaphore>,
    max_concurrency: usize,
}

impl GatedProvider {
    pub fn new(inner: Arc<dyn Provider>, max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            inner,
            permits: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Requests currently allowed to start without waiting.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

#[async_trait]
impl Provider for GatedProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn decide(&self, request: ProviderRequest) -> Result<Decision, ProviderError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ProviderError::not_configured("provider gate closed"))?;
        trace!(
            provider = %self.inner.name(),
            available = self.permits.available_permits(),
            "Acquired provider permit"
        );
        self.inner.decide(request).await
    }
}
