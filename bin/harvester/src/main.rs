mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "harvester")]
#[command(about = "Browser-resident agent that captures and relays console API credentials", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the browser and run the agent (default when no subcommand)
    Run {
        /// Run the browser headless
        #[arg(long)]
        headless: bool,
    },

    /// Run environment diagnostics
    Doctor,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the full configuration
    Show,
    /// Get a config value by dot-separated key (e.g. channel.endpoint)
    Get {
        /// Config key path (e.g. "channel.endpoint", "browser.headless")
        key: String,
    },
    /// Set a config value by dot-separated key
    Set {
        /// Config key path
        key: String,
        /// Value to set (auto-detects JSON types)
        value: String,
    },
    /// Set the backend channel endpoint (prompts when no value given)
    Endpoint {
        /// Endpoint URL (ws:// or wss://)
        value: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command.unwrap_or(Commands::Run { headless: false }) {
        Commands::Run { headless } => {
            commands::run::run(headless).await?;
        }
        Commands::Doctor => {
            commands::doctor::run().await?;
        }
        Commands::Config { command } => match command {
            ConfigCommands::Show => {
                commands::config_cmd::show().await?;
            }
            ConfigCommands::Get { key } => {
                commands::config_cmd::get(&key).await?;
            }
            ConfigCommands::Set { key, value } => {
                commands::config_cmd::set(&key, &value).await?;
            }
            ConfigCommands::Endpoint { value } => {
                commands::config_cmd::endpoint(value.as_deref()).await?;
            }
        },
    }

    Ok(())
}
