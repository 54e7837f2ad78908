//! `opsloop init`: write a default config file.

use std::path::Path;

use opsloop_config::AppConfig;

use super::CmdResult;

pub async fn run(path: Option<&Path>) -> CmdResult {
    let config_path = match path {
        Some(path) => path.to_path_buf(),
        None => AppConfig::config_dir().join("config.toml"),
    };

    if config_path.exists() {
        println!("Config already exists at: {}", config_path.display());
        println!("Edit it manually or delete it and re-run init.");
        return Ok(());
    }

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&config_path, AppConfig::default_toml())?;
    println!("Created {}", config_path.display());
    println!();
    println!("Next steps:");
    println!("  1. Set OPSLOOP_API_KEY (or ANTHROPIC_API_KEY / OPENAI_API_KEY)");
    println!("  2. Add [[plugins]] entries for your tool plugins");
    println!("  3. opsloop tools");
    Ok(())
}
