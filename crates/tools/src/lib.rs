//! Tool dispatch for opsloop.
//!
//! A tool name resolves either to an in-process [`ToolHandler`] or to a
//! remote plugin speaking the `POST /execute` contract. The [`Dispatcher`]
//! hides the difference from the agent loop:
//!
//! - [`PluginCatalog`] caches what every plugin reported at discovery
//! - [`ToolRegistry`] maps names to handlers and plugins
//! - [`Dispatcher`] runs calls with retry and merges state deltas in order
//! - [`PluginHost`] exposes local handlers as a plugin
//!
//! [`ToolHandler`]: opsloop_core::tool::ToolHandler

pub mod builtin;
pub mod catalog;
pub mod dispatcher;
pub mod host;
pub mod plugin;
pub mod registry;

pub use builtin::{SessionRecallTool, SessionRememberTool, builtin_handlers};
pub use catalog::{PluginCatalog, PluginEndpoint, PluginSpec};
pub use dispatcher::{DispatchOutcome, Dispatcher, merge_deltas, validate_arguments};
pub use host::PluginHost;
pub use plugin::{PluginClient, PluginError, PluginRequest};
pub use registry::{ResolvedTool, ToolRegistry};

use std::sync::Arc;

use opsloop_core::error::RegistryError;

/// A registry holding every built-in handler.
pub fn default_registry() -> Result<ToolRegistry, RegistryError> {
    let mut registry = ToolRegistry::new();
    for handler in builtin_handlers() {
        registry.register_local(handler)?;
    }
    Ok(registry)
}

/// Build a registry from the built-ins plus whatever `catalog` discovered.
pub fn registry_with_plugins(catalog: &PluginCatalog) -> Result<Arc<ToolRegistry>, RegistryError> {
    let registry = default_registry()?;
    registry.install_plugins(&catalog.snapshot());
    Ok(Arc::new(registry))
}
