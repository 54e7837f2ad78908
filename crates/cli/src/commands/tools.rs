//! `opsloop tools` and `opsloop plugin-serve`.

use std::path::Path;

use opsloop_core::tool::ToolTarget;
use opsloop_tools::{PluginHost, builtin_handlers};

use super::{CmdResult, build_dispatcher, load_config};

pub async fn list(config_path: Option<&Path>) -> CmdResult {
    let config = load_config(config_path)?;
    let (dispatcher, catalog) = build_dispatcher(&config).await?;

    for endpoint in catalog.snapshot().iter() {
        match &endpoint.last_error {
            None => println!(
                "plugin {} ({}): {} tools",
                endpoint.name(),
                endpoint.client.address(),
                endpoint.tools.len()
            ),
            Some(e) => println!("plugin {} unavailable: {e}", endpoint.name()),
        }
    }
    println!();

    for def in dispatcher.registry().definitions() {
        let target = match &def.target {
            ToolTarget::Local => "local".to_string(),
            ToolTarget::Plugin { plugin, .. } => format!("plugin:{plugin}"),
        };
        println!("{:<28} {:<20} {}", def.name, target, def.description);
    }
    Ok(())
}

pub async fn serve(host: String, port: u16) -> CmdResult {
    let plugin = PluginHost::new().with_handlers(builtin_handlers());
    let addr = format!("{host}:{port}");
    println!("Serving {:?} on http://{addr}", plugin.tool_names());

    plugin
        .serve(&addr, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
