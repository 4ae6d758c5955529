//! Aegis CLI — the main entry point.
//!
//! Commands:
//! - `init`      — Write the default config file
//! - `chat`      — Interactive chat or single-message mode
//! - `sessions`  — List, inspect and delete stored sessions

use aegis_config::{AppConfig, LogFormat, LoggingConfig};
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod echo;

#[derive(Parser)]
#[command(
    name = "aegis",
    about = "Aegis — event-driven agent runtime",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Load configuration from this file instead of ~/.aegis/config.toml
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration file
    Init,

    /// Chat with the agent
    Chat {
        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,

        /// Resume an existing session
        #[arg(long, conflicts_with = "new_session")]
        session: Option<String>,

        /// Start a new persisted session
        #[arg(long)]
        new_session: bool,
    },

    /// Manage stored sessions
    Sessions {
        #[command(subcommand)]
        action: SessionsAction,
    },
}

#[derive(Subcommand)]
enum SessionsAction {
    /// List sessions, newest first
    List {
        /// Agent whose sessions to list (defaults to the configured agent)
        #[arg(long)]
        agent: Option<String>,
    },

    /// Print a session's history
    Show { id: String },

    /// Delete a session and its history
    Delete { id: String },
}

/// Load configuration and start logging with its `[logging]` settings.
fn setup(verbose: bool, path: Option<&std::path::Path>) -> anyhow::Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::load_from(path).and_then(AppConfig::with_env_overrides),
        None => AppConfig::load(),
    }
    .context("Failed to load config")?;
    init_tracing(verbose, &config.logging);
    Ok(config)
}

fn init_tracing(verbose: bool, logging: &LoggingConfig) {
    let default = if verbose { "debug" } else { logging.level.as_str() };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Init => {
            init_tracing(cli.verbose, &LoggingConfig::default());
            commands::init::run(config_path)?;
        }
        Commands::Chat {
            message,
            session,
            new_session,
        } => {
            let config = setup(cli.verbose, config_path)?;
            commands::chat::run(&config, message, session, new_session).await?;
        }
        Commands::Sessions { action } => {
            let config = setup(cli.verbose, config_path)?;
            match action {
                SessionsAction::List { agent } => commands::sessions::list(&config, agent).await?,
                SessionsAction::Show { id } => commands::sessions::show(&config, &id).await?,
                SessionsAction::Delete { id } => commands::sessions::delete(&config, &id).await?,
            }
        }
    }

    Ok(())
}
