//! Tool registry: resolves a tool name to a local handler or a plugin.
//!
//! Local handlers are registered at startup. Plugin tools are installed from
//! a [`PluginEndpoint`] snapshot and can be swapped out as a whole when the
//! catalog is refreshed.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use opsloop_core::error::RegistryError;
use opsloop_core::tool::{ToolDefinition, ToolHandler};
use tracing::{debug, warn};

use crate::catalog::{PluginCatalog, PluginEndpoint};
use crate::plugin::PluginClient;

/// What a tool name resolves to.
#[derive(Clone)]
pub enum ResolvedTool {
    Local {
        definition: ToolDefinition,
        handler: Arc<dyn ToolHandler>,
    },
    Plugin {
        definition: ToolDefinition,
        client: PluginClient,
    },
}

impl ResolvedTool {
    pub fn definition(&self) -> &ToolDefinition {
        match self {
            Self::Local { definition, .. } | Self::Plugin { definition, .. } => definition,
        }
    }
}

#[derive(Default)]
struct RemoteTools {
    tools: BTreeMap<String, (ToolDefinition, PluginClient)>,
    plugins: Vec<PluginClient>,
}

/// Every tool the dispatcher can reach.
#[derive(Default)]
pub struct ToolRegistry {
    local: BTreeMap<String, Arc<dyn ToolHandler>>,
    remote: RwLock<Arc<RemoteTools>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an in-process handler. Names must be unique.
    pub fn register_local(&mut self, handler: Arc<dyn ToolHandler>) -> Result<(), RegistryError> {
        let name = handler.name().to_string();
        if self.local.contains_key(&name) {
            return Err(RegistryError::DuplicateTool { name });
        }
        debug!(tool = %name, "Registered local tool");
        self.local.insert(name, handler);
        Ok(())
    }

    /// Replace the plugin-backed tools with the ones in `endpoints`.
    ///
    /// The first plugin to claim a name keeps it; later claims are skipped.
    /// Local handlers shadow plugin tools of the same name.
    pub fn install_plugins(&self, endpoints: &[PluginEndpoint]) {
        let mut remote = RemoteTools::default();
        for endpoint in endpoints {
            remote.plugins.push(endpoint.client.clone());
            for tool in &endpoint.tools {
                if self.local.contains_key(&tool.name) {
                    warn!(tool = %tool.name, plugin = %endpoint.name(), "Plugin tool shadowed by local handler");
                    continue;
                }
                if let Some((_, owner)) = remote.tools.get(&tool.name) {
                    warn!(
                        tool = %tool.name,
                        plugin = %endpoint.name(),
                        registered_by = %owner.name(),
                        "Duplicate plugin tool skipped"
                    );
                    continue;
                }
                remote
                    .tools
                    .insert(tool.name.clone(), (tool.clone(), endpoint.client.clone()));
            }
        }
        debug!(
            plugins = remote.plugins.len(),
            tools = remote.tools.len(),
            "Installed plugin tools"
        );
        *self.remote.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(remote);
    }

    /// Refresh the catalog and install what it now reports.
    pub async fn reload_plugins(&self, catalog: &PluginCatalog) {
        let endpoints = catalog.refresh().await;
        self.install_plugins(&endpoints);
    }

    fn remote(&self) -> Arc<RemoteTools> {
        self.remote.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Look up a tool by name.
    pub fn resolve(&self, name: &str) -> Option<ResolvedTool> {
        if let Some(handler) = self.local.get(name) {
            return Some(ResolvedTool::Local {
                definition: handler.to_definition(),
                handler: handler.clone(),
            });
        }
        self.remote()
            .tools
            .get(name)
            .map(|(definition, client)| ResolvedTool::Plugin {
                definition: definition.clone(),
                client: client.clone(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.local.contains_key(name) || self.remote().tools.contains_key(name)
    }

    /// All tool definitions, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let remote = self.remote();
        let mut defs: Vec<ToolDefinition> = self
            .local
            .values()
            .map(|h| h.to_definition())
            .chain(remote.tools.values().map(|(d, _)| d.clone()))
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// The definitions a loop may expose. An empty list selects every tool.
    pub fn resolve_toolset(&self, names: &[String]) -> Result<Vec<ToolDefinition>, RegistryError> {
        if names.is_empty() {
            return Ok(self.definitions());
        }
        names
            .iter()
            .map(|name| {
                self.resolve(name)
                    .map(|tool| tool.definition().clone())
                    .ok_or_else(|| RegistryError::UnknownTool { name: name.clone() })
            })
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.definitions().into_iter().map(|d| d.name).collect()
    }

    /// Every installed plugin, including ones that failed discovery.
    pub fn plugin_clients(&self) -> Vec<PluginClient> {
        self.remote().plugins.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::{SessionRecallTool, SessionRememberTool};
    use opsloop_core::tool::ToolTarget;
    use std::time::Duration;

    fn plugin_tool(name: &str, plugin: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.into(),
            description: format!("{name} from {plugin}"),
            input_schema: serde_json::json!({"type": "object"}),
            state_keys: None,
            target: ToolTarget::Plugin {
                plugin: plugin.into(),
                address: format!("http://{plugin}.local"),
            },
        }
    }

    fn endpoint(plugin: &str, tools: &[&str]) -> PluginEndpoint {
        PluginEndpoint {
            client: PluginClient::new(
                plugin,
                format!("http://{plugin}.local"),
                Duration::from_secs(1),
            ),
            tools: tools.iter().map(|t| plugin_tool(t, plugin)).collect(),
            last_error: None,
        }
    }

    #[test]
    fn duplicate_local_tool_rejected() {
        let mut registry = ToolRegistry::new();
        registry
            .register_local(Arc::new(SessionRememberTool))
            .unwrap();
        let err = registry
            .register_local(Arc::new(SessionRememberTool))
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::DuplicateTool {
                name: "session_remember".into()
            }
        );
    }

    #[test]
    fn first_plugin_wins_and_local_shadows() {
        let mut registry = ToolRegistry::new();
        registry
            .register_local(Arc::new(SessionRecallTool))
            .unwrap();
        registry.install_plugins(&[
            endpoint("kubernetes", &["get_pods", "logs"]),
            endpoint("helm", &["logs", "install", "session_recall"]),
        ]);

        match registry.resolve("logs").unwrap() {
            ResolvedTool::Plugin { client, .. } => assert_eq!(client.name(), "kubernetes"),
            ResolvedTool::Local { .. } => panic!("logs should be a plugin tool"),
        }
        assert!(matches!(
            registry.resolve("session_recall"),
            Some(ResolvedTool::Local { .. })
        ));
        assert_eq!(
            registry.names(),
            vec!["get_pods", "install", "logs", "session_recall"]
        );
        assert_eq!(registry.plugin_clients().len(), 2);
    }

    #[test]
    fn reinstall_replaces_plugin_tools() {
        let registry = ToolRegistry::new();
        registry.install_plugins(&[endpoint("kubernetes", &["get_pods"])]);
        assert!(registry.contains("get_pods"));

        registry.install_plugins(&[endpoint("helm", &["install"])]);
        assert!(!registry.contains("get_pods"));
        assert!(registry.contains("install"));
    }

    #[test]
    fn toolset_resolution() {
        let registry = ToolRegistry::new();
        registry.install_plugins(&[endpoint("kubernetes", &["get_pods", "logs"])]);

        let all = registry.resolve_toolset(&[]).unwrap();
        assert_eq!(all.len(), 2);

        let some = registry.resolve_toolset(&["logs".to_string()]).unwrap();
        assert_eq!(some.len(), 1);
        assert_eq!(some[0].name, "logs");

        let err = registry
            .resolve_toolset(&["delete_cluster".to_string()])
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownTool { .. }));
    }
}
