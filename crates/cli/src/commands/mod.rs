//! Subcommands plus the wiring they share.

pub mod init;
pub mod run;
pub mod sessions;
pub mod tools;

use std::path::Path;
use std::sync::Arc;

use opsloop_config::AppConfig;
use opsloop_core::retry::RetryPolicy;
use opsloop_core::session::SessionStore;
use opsloop_session::FileSessionStore;
use opsloop_tools::{Dispatcher, PluginCatalog, PluginSpec, ToolRegistry};

pub type CmdResult = Result<(), Box<dyn std::error::Error>>;

pub fn load_config(path: Option<&Path>) -> Result<AppConfig, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    };
    config.map_err(|e| format!("Failed to load config: {e}").into())
}

pub fn open_store(config: &AppConfig) -> Arc<dyn SessionStore> {
    Arc::new(FileSessionStore::new(config.sessions.dir()))
}

pub fn plugin_specs(config: &AppConfig) -> Vec<PluginSpec> {
    config
        .plugins
        .iter()
        .map(|p| PluginSpec::new(&p.name, &p.address).with_timeout(p.timeout()))
        .collect()
}

/// Discover plugins once and build the dispatcher every loop shares.
pub async fn build_dispatcher(
    config: &AppConfig,
) -> Result<(Dispatcher, PluginCatalog), Box<dyn std::error::Error>> {
    let catalog = PluginCatalog::discover(plugin_specs(config)).await;
    let registry: Arc<ToolRegistry> = opsloop_tools::registry_with_plugins(&catalog)?;
    let retry = RetryPolicy::new(
        config.dispatcher.max_attempts,
        config.dispatcher.base_delay(),
        config.dispatcher.max_delay(),
    );
    let dispatcher = Dispatcher::new(registry)
        .with_retry(retry)
        .with_call_timeout(config.agent.iteration_timeout());
    Ok((dispatcher, catalog))
}
