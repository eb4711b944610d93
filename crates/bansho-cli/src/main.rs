//! The `bansho` binary.
//!
//! - `bansho serve` — run the MCP gateway over stdio
//! - `bansho dashboard` — run the read-only audit dashboard
//! - `bansho keys create|list|revoke` — manage API keys

mod dashboard;
mod db;
mod keys;
mod serve;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use bansho_types::Settings;

#[derive(Parser)]
#[command(
    name = "bansho",
    version,
    about = "Bansho — security gateway for the Model Context Protocol"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the MCP gateway on stdio
    Serve {
        /// Print resolved settings and exit
        #[arg(long)]
        print_settings: bool,
    },
    /// Start the read-only audit dashboard
    Dashboard,
    /// Manage API keys
    Keys {
        #[command(subcommand)]
        command: KeysCommands,
    },
}

#[derive(Subcommand)]
pub enum KeysCommands {
    /// Create an API key and print the cleartext exactly once
    Create {
        /// Role for the new key
        #[arg(long, default_value = "readonly", value_parser = ["admin", "user", "readonly"])]
        role: String,
    },
    /// List API keys, tab-separated
    List,
    /// Revoke an API key by id
    Revoke { api_key_id: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Best-effort .env merge, overriding the ambient environment.
    dotenvy::dotenv_override().ok();

    // Logging goes to stderr — the stdio transport uses stdout for JSON-RPC
    // framing, and a single stray log line there breaks the client.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    match run().await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("bansho failed: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let settings = Settings::from_env()?;

    match cli.command {
        Commands::Serve { print_settings } => {
            serve::run(settings, print_settings).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Dashboard => {
            dashboard::run(&settings).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Keys { command } => keys::run(&settings, command).await,
    }
}
