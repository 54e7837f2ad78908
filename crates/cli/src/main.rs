//! opsloop CLI: the main entry point.
//!
//! Commands:
//! - `init`          Write a default config file
//! - `run`           Start a new session and drive it to an answer
//! - `resume`        Continue an existing session
//! - `batch`         Run one session per prompt in a file, concurrently
//! - `show`          Print a stored session
//! - `sessions`      List stored sessions
//! - `finish`        Close a session and release plugin resources
//! - `sweep`         Expire idle sessions
//! - `tools`         Discover plugins and list every tool
//! - `plugin-serve`  Host the built-in tools as a plugin

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "opsloop",
    about = "opsloop: agentic tool-calling runtime for operations work",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file to use instead of ~/.opsloop/config.toml
    #[arg(long, global = true, env = "OPSLOOP_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file
    Init,

    /// Start a new session
    Run {
        /// The task for the agent
        #[arg(short, long)]
        prompt: String,

        /// Override the configured system prompt
        #[arg(long)]
        system: Option<String>,

        /// Restrict the visible tools (repeatable); all tools by default
        #[arg(long = "tool")]
        tools: Vec<String>,

        #[arg(long)]
        max_iterations: Option<u32>,

        /// Whole-run deadline in seconds
        #[arg(long)]
        deadline_secs: Option<u64>,
    },

    /// Continue an existing session
    Resume {
        session_id: String,

        /// A follow-up message
        #[arg(short, long)]
        message: Option<String>,

        #[arg(long)]
        max_iterations: Option<u32>,
    },

    /// Start one session per line of a prompts file, running several at once
    Batch {
        /// File with one prompt per line; blank and `#` lines are skipped
        prompts: PathBuf,

        #[arg(long)]
        max_iterations: Option<u32>,
    },

    /// Print a stored session as JSON
    Show { session_id: String },

    /// List stored sessions
    Sessions,

    /// Finish a session and release its plugin resources
    Finish { session_id: String },

    /// Expire sessions idle for longer than the configured TTL
    Sweep,

    /// List every registered tool
    Tools,

    /// Serve the built-in tools over the plugin HTTP contract
    PluginServe {
        #[arg(short, long, default_value_t = 8081)]
        port: u16,

        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Init => commands::init::run(config_path).await?,
        Commands::Run {
            prompt,
            system,
            tools,
            max_iterations,
            deadline_secs,
        } => {
            let args = commands::run::RunArgs {
                prompt,
                system,
                tools,
                max_iterations,
                deadline_secs,
            };
            commands::run::run(config_path, args).await?
        }
        Commands::Resume {
            session_id,
            message,
            max_iterations,
        } => commands::run::resume(config_path, session_id, message, max_iterations).await?,
        Commands::Batch {
            prompts,
            max_iterations,
        } => commands::run::batch(config_path, &prompts, max_iterations).await?,
        Commands::Show { session_id } => commands::sessions::show(config_path, session_id).await?,
        Commands::Sessions => commands::sessions::list(config_path).await?,
        Commands::Finish { session_id } => {
            commands::sessions::finish(config_path, session_id).await?
        }
        Commands::Sweep => commands::sessions::sweep(config_path).await?,
        Commands::Tools => commands::tools::list(config_path).await?,
        Commands::PluginServe { port, host } => commands::tools::serve(host, port).await?,
    }

    Ok(())
}
