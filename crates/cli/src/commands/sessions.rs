//! `opsloop show | sessions | finish | sweep`: session housekeeping.

use std::path::Path;

use chrono::Utc;
use opsloop_core::session::SessionId;
use opsloop_session::expire_idle;

use super::{CmdResult, build_dispatcher, load_config, open_store};

pub async fn show(config_path: Option<&Path>, session_id: String) -> CmdResult {
    let config = load_config(config_path)?;
    let store = open_store(&config);
    let session = store.load(&SessionId::from(session_id.as_str())).await?;
    println!("{}", serde_json::to_string_pretty(&session)?);
    Ok(())
}

pub async fn list(config_path: Option<&Path>) -> CmdResult {
    let config = load_config(config_path)?;
    let summaries = open_store(&config).list().await?;

    if summaries.is_empty() {
        println!("No sessions in {}", config.sessions.dir().display());
        return Ok(());
    }
    println!("{:<38} {:<10} {:>6} {:>8}  LAST ACTIVITY", "ID", "STATUS", "TURNS", "VERSION");
    for s in summaries {
        println!(
            "{:<38} {:<10} {:>6} {:>8}  {}",
            s.id,
            s.status,
            s.turns,
            s.version,
            s.last_activity_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

pub async fn finish(config_path: Option<&Path>, session_id: String) -> CmdResult {
    let config = load_config(config_path)?;
    let store = open_store(&config);
    let id = SessionId::from(session_id.as_str());

    let Some(_lock) = store.try_lock(&id).await? else {
        return Err(format!("Session {id} is running; cancel it before finishing").into());
    };
    let session = store.finish(&id).await?;
    let (dispatcher, _catalog) = build_dispatcher(&config).await?;
    dispatcher.release_session(id.as_str()).await;
    println!("Session {} is {}", session.id, session.status);
    Ok(())
}

pub async fn sweep(config_path: Option<&Path>) -> CmdResult {
    let config = load_config(config_path)?;
    let store = open_store(&config);

    let expired = expire_idle(store.as_ref(), config.sessions.ttl(), Utc::now()).await?;
    if expired.is_empty() {
        println!("No idle sessions");
        return Ok(());
    }

    let (dispatcher, _catalog) = build_dispatcher(&config).await?;
    for id in &expired {
        dispatcher.release_session(id.as_str()).await;
        println!("Expired {id}");
    }
    Ok(())
}
