//! Process-wide cache of plugin `describe` results.
//!
//! The catalog is built once at startup with [`PluginCatalog::discover`] and
//! only changes on an explicit [`PluginCatalog::refresh`] or
//! [`PluginCatalog::reconfigure`]. Readers take a cheap [`Arc`] snapshot.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use opsloop_core::tool::ToolDefinition;
use tracing::{info, warn};

use crate::plugin::{DEFAULT_PLUGIN_TIMEOUT, PluginClient};

/// Where a plugin lives and how long to wait for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSpec {
    pub name: String,
    pub address: String,
    pub timeout: Duration,
}

impl PluginSpec {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            timeout: DEFAULT_PLUGIN_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// One configured plugin and what it reported at discovery.
#[derive(Debug, Clone)]
pub struct PluginEndpoint {
    pub client: PluginClient,
    pub tools: Vec<ToolDefinition>,
    /// Set when `describe` failed; such a plugin contributes no tools.
    pub last_error: Option<String>,
}

impl PluginEndpoint {
    pub fn name(&self) -> &str {
        self.client.name()
    }

    pub fn is_available(&self) -> bool {
        self.last_error.is_none()
    }
}

/// The discovered tool lists of every configured plugin, in config order.
pub struct PluginCatalog {
    specs: RwLock<Vec<PluginSpec>>,
    endpoints: RwLock<Arc<Vec<PluginEndpoint>>>,
}

impl PluginCatalog {
    /// A catalog with no plugins.
    pub fn empty() -> Self {
        Self {
            specs: RwLock::new(Vec::new()),
            endpoints: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Describe every plugin concurrently and cache the results.
    pub async fn discover(specs: Vec<PluginSpec>) -> Self {
        let endpoints = describe_all(&specs).await;
        Self {
            specs: RwLock::new(specs),
            endpoints: RwLock::new(Arc::new(endpoints)),
        }
    }

    /// Re-describe the currently configured plugins.
    pub async fn refresh(&self) -> Arc<Vec<PluginEndpoint>> {
        let specs = self
            .specs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let endpoints = Arc::new(describe_all(&specs).await);
        *self.endpoints.write().unwrap_or_else(|e| e.into_inner()) = endpoints.clone();
        endpoints
    }

    /// Replace the plugin list and rediscover.
    pub async fn reconfigure(&self, specs: Vec<PluginSpec>) -> Arc<Vec<PluginEndpoint>> {
        *self.specs.write().unwrap_or_else(|e| e.into_inner()) = specs;
        self.refresh().await
    }

    /// The current cached view.
    pub fn snapshot(&self) -> Arc<Vec<PluginEndpoint>> {
        self.endpoints
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn tool_count(&self) -> usize {
        self.snapshot().iter().map(|e| e.tools.len()).sum()
    }
}

async fn describe_all(specs: &[PluginSpec]) -> Vec<PluginEndpoint> {
    let calls = specs.iter().map(|spec| async move {
        let client = PluginClient::new(&spec.name, &spec.address, spec.timeout);
        match client.describe().await {
            Ok(tools) => {
                info!(plugin = %spec.name, address = %spec.address, tools = tools.len(), "Plugin discovered");
                PluginEndpoint {
                    client,
                    tools,
                    last_error: None,
                }
            }
            Err(e) => {
                warn!(plugin = %spec.name, address = %spec.address, error = %e, "Plugin discovery failed");
                PluginEndpoint {
                    client,
                    tools: Vec::new(),
                    last_error: Some(e.to_string()),
                }
            }
        }
    });
    futures::future::join_all(calls).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::{SessionRecallTool, SessionRememberTool};
    use crate::host::PluginHost;

    async fn dead_address() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn discover_keeps_failed_plugins_without_tools() {
        let host = PluginHost::new()
            .with_handler(Arc::new(SessionRememberTool))
            .with_handler(Arc::new(SessionRecallTool));
        let (addr, _server) = host.spawn("127.0.0.1:0").await.unwrap();

        let catalog = PluginCatalog::discover(vec![
            PluginSpec::new("state", format!("http://{addr}")),
            PluginSpec::new("down", dead_address().await).with_timeout(Duration::from_secs(2)),
        ])
        .await;

        let snapshot = catalog.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].name(), "state");
        assert!(snapshot[0].is_available());
        assert_eq!(snapshot[0].tools.len(), 2);
        assert!(!snapshot[1].is_available());
        assert!(snapshot[1].tools.is_empty());
        assert_eq!(catalog.tool_count(), 2);
    }

    #[tokio::test]
    async fn snapshot_is_stable_until_reconfigured() {
        let host = PluginHost::new().with_handler(Arc::new(SessionRememberTool));
        let (addr, _server) = host.spawn("127.0.0.1:0").await.unwrap();

        let catalog = PluginCatalog::empty();
        let before = catalog.snapshot();
        assert!(before.is_empty());

        catalog
            .reconfigure(vec![PluginSpec::new("state", format!("http://{addr}"))])
            .await;
        assert!(before.is_empty());
        assert_eq!(catalog.tool_count(), 1);
    }
}
