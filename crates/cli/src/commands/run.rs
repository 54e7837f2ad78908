//! `opsloop run`, `opsloop resume` and `opsloop batch`: drive sessions to an answer.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use opsloop_agent::{AgentLoop, BatchJob, BatchRunner, LoopFailure, LoopOutcome, Termination};
use opsloop_config::AppConfig;
use opsloop_core::agent::LoopConfig;
use opsloop_core::event::{EventBus, LoopEvent};
use opsloop_core::retry::RetryPolicy;
use opsloop_core::CancellationToken;
use opsloop_core::session::{SessionId, StateMap};
use opsloop_providers::{ProviderPool, ProviderSettings};
use tracing::warn;

use super::{CmdResult, build_dispatcher, load_config, open_store};

pub struct RunArgs {
    pub prompt: String,
    pub system: Option<String>,
    pub tools: Vec<String>,
    pub max_iterations: Option<u32>,
    pub deadline_secs: Option<u64>,
}

pub async fn run(config_path: Option<&Path>, args: RunArgs) -> CmdResult {
    let config = load_config(config_path)?;
    let (agent, settings) = build_agent(&config).await?;

    let mut loop_config = loop_config(&config, &settings, args.max_iterations);
    if let Some(system) = args.system {
        loop_config.system_prompt = system;
    }
    loop_config.toolset = args.tools;
    if let Some(secs) = args.deadline_secs {
        loop_config.deadline = Some(Duration::from_secs(secs));
    }

    let cancel = loop_config.cancel.clone();
    cancel_on_ctrl_c(cancel);
    let outcome = agent.start(loop_config, StateMap::new(), args.prompt).await;
    report(&config, &outcome)
}

pub async fn resume(
    config_path: Option<&Path>,
    session_id: String,
    message: Option<String>,
    max_iterations: Option<u32>,
) -> CmdResult {
    let config = load_config(config_path)?;
    let (agent, settings) = build_agent(&config).await?;

    let loop_config = loop_config(&config, &settings, max_iterations);
    cancel_on_ctrl_c(loop_config.cancel.clone());
    let outcome = agent
        .resume(&SessionId::from(session_id.as_str()), loop_config, message)
        .await;
    report(&config, &outcome)
}

/// Start one session per prompt in `prompts_file`, `agent.batch_concurrency` at a time.
pub async fn batch(
    config_path: Option<&Path>,
    prompts_file: &Path,
    max_iterations: Option<u32>,
) -> CmdResult {
    let config = load_config(config_path)?;
    let text = tokio::fs::read_to_string(prompts_file)
        .await
        .map_err(|e| format!("Failed to read {}: {e}", prompts_file.display()))?;
    let prompts = parse_prompts(&text);
    if prompts.is_empty() {
        return Err(format!("No prompts in {}", prompts_file.display()).into());
    }

    let (agent, settings) = build_agent(&config).await?;
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    let jobs = prompts
        .into_iter()
        .map(|prompt| {
            let loop_config =
                loop_config(&config, &settings, max_iterations).with_cancel(cancel.child_token());
            BatchJob::start(loop_config, StateMap::new(), prompt)
        })
        .collect();

    let runner = BatchRunner::new(&agent, config.agent.batch_concurrency);
    let outcomes = runner.run(jobs).await;

    println!();
    let mut failed = 0;
    for outcome in &outcomes {
        let status = match &outcome.termination {
            Termination::Completed => "completed".to_string(),
            Termination::Cancelled => "cancelled".to_string(),
            Termination::Failed(failure) => {
                failed += 1;
                format!("failed: {failure}")
            }
        };
        println!("{}  {:>3} iterations  {status}", outcome.session_id, outcome.iterations);
    }
    if failed > 0 {
        return Err(format!("{failed} of {} sessions failed", outcomes.len()).into());
    }
    Ok(())
}

/// One prompt per non-blank line; `#` starts a comment line.
fn parse_prompts(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect()
}

fn loop_config(
    config: &AppConfig,
    settings: &ProviderSettings,
    max_iterations: Option<u32>,
) -> LoopConfig {
    let mut loop_config = LoopConfig::new(&config.agent.system_prompt)
        .with_max_iterations(max_iterations.unwrap_or(config.agent.max_iterations))
        .with_temperature(settings.temperature);
    loop_config.max_tokens = settings.max_tokens;
    loop_config.deadline = config.agent.session_deadline();
    loop_config
}

async fn build_agent(
    config: &AppConfig,
) -> Result<(AgentLoop, ProviderSettings), Box<dyn std::error::Error>> {
    let pool = ProviderPool::build_from_config(config)
        .map_err(|e| format!("Failed to set up providers: {e}"))?;
    let pooled = pool
        .default_provider()
        .ok_or("No default provider configured")?
        .clone();

    if pooled.settings.api_key.is_empty() && pooled.settings.name != "ollama" {
        eprintln!();
        eprintln!("  ERROR: No API key configured for '{}'", pooled.settings.name);
        eprintln!();
        eprintln!("  Set one of these environment variables:");
        eprintln!("    OPSLOOP_API_KEY    (generic)");
        eprintln!("    ANTHROPIC_API_KEY  (for Anthropic)");
        eprintln!("    OPENAI_API_KEY     (for OpenAI)");
        eprintln!();
        eprintln!("  Or add it to your config file:");
        eprintln!("    {}", AppConfig::config_dir().join("config.toml").display());
        eprintln!();
        return Err("No API key found. See above for setup instructions.".into());
    }

    let (dispatcher, _catalog) = build_dispatcher(config).await?;
    let events = Arc::new(EventBus::default());
    print_progress(&events);

    let agent = AgentLoop::new(pooled.provider, dispatcher, open_store(config))
        .with_model(&pooled.settings.model)
        .with_event_bus(events)
        .with_iteration_timeout(config.agent.iteration_timeout())
        .with_provider_retry(RetryPolicy::new(
            config.agent.provider_max_attempts,
            config.agent.provider_base_delay(),
            config.agent.provider_max_delay(),
        ));
    Ok((agent, pooled.settings))
}

fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nCancelling after in-flight calls finish...");
            cancel.cancel();
        }
    });
}

/// Print one line per completed iteration.
fn print_progress(events: &EventBus) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let LoopEvent::IterationCompleted { report, .. } = event.as_ref() {
                        let ok: Vec<&str> = report.succeeded().map(|c| c.tool_name.as_str()).collect();
                        let failed: Vec<&str> = report.failed().map(|c| c.tool_name.as_str()).collect();
                        eprintln!(
                            "  [iteration {}] completed: {:?} failed: {:?}",
                            report.iteration, ok, failed
                        );
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Progress output fell behind");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn report(config: &AppConfig, outcome: &LoopOutcome) -> CmdResult {
    println!();
    println!("Session:     {}", outcome.session_id);
    println!("Iterations:  {}", outcome.iterations);
    println!(
        "Tokens:      {} in / {} out",
        outcome.usage.input_tokens, outcome.usage.output_tokens
    );

    match &outcome.termination {
        Termination::Completed => {
            println!();
            println!("{}", outcome.final_text.as_deref().unwrap_or_default());
            Ok(())
        }
        Termination::Cancelled => {
            println!("Cancelled. Resume with `opsloop resume {}`", outcome.session_id);
            Ok(())
        }
        Termination::Failed(failure) => {
            if let LoopFailure::SessionBusy(_) = failure {
                let lock = config.sessions.dir().join(format!("{}.lock", outcome.session_id));
                eprintln!(
                    "If no other opsloop process is running, remove {} and retry.",
                    lock.display()
                );
            }
            Err(format!("Loop failed after {} turns: {failure}", outcome.transcript.len()).into())
        }
    }
}
