//! CLI entry and dispatch.

use anyhow::{Context, Result};
use clap::Parser;
use tether_core::config::Config;
use tether_core::logging;

mod commands;

#[derive(Parser)]
#[command(name = "tether")]
#[command(version)]
#[command(about = "Keeps chat conversations attached to app-server threads")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Read JSON-line events from stdin and write one reply line per batch
    Bot,
    /// Run a single turn and print the reply
    Exec {
        /// The prompt to send
        #[arg(short, long)]
        prompt: String,

        /// Conversation scope (e.g. a group id)
        #[arg(long, default_value = "cli")]
        scope: String,

        /// Conversation channel within the scope
        #[arg(long, default_value = "default")]
        channel: String,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(clap::Subcommand)]
enum ConfigCommands {
    /// Show the path to the config file
    Path,
    /// Initialize a default config file (if not present)
    Init,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    // one tokio runtime for everything
    let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;
    rt.block_on(async move { dispatch(cli).await })
}

async fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Config { command } => match command {
            ConfigCommands::Path => {
                commands::config::path();
                Ok(())
            }
            ConfigCommands::Init => commands::config::init(),
        },
        Commands::Bot => {
            let config = Config::load().context("load config")?;
            let _log_guard = logging::init(&config.logging)?;
            tether_bot::run(config).await
        }
        Commands::Exec {
            prompt,
            scope,
            channel,
        } => {
            let config = Config::load().context("load config")?;
            let _log_guard = logging::init(&config.logging)?;
            commands::exec::run(&config, &scope, &channel, &prompt).await
        }
    }
}
