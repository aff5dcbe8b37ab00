//! # sync-cli
//!
//! CLI tool for exercising the convo-sync engine without a server.
//!
//! ## Commands
//!
//! - `replay`: Run a scripted session against mock collaborators and print
//!   the final snapshot
//! - `config`: Print the effective engine configuration
//!
//! Stdout carries JSON only; logs go to stderr (filter with `RUST_LOG`).
//!
//! ## Example
//!
//! ```bash
//! # Replay a session with a faster send timeout
//! convo-sync --config fast.toml replay session.json --pretty
//!
//! # Show the configuration the engine would run with
//! convo-sync --config fast.toml config
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use commands::{replay, show_config};

/// CLI tool for exercising the convo-sync engine.
#[derive(Parser, Debug)]
#[command(name = "convo-sync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Engine configuration file (TOML); defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay a JSON session script against mock collaborators
    Replay {
        /// Path to the script
        script: PathBuf,

        /// Pretty-print the report
        #[arg(long)]
        pretty: bool,
    },

    /// Print the effective engine configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Replay { script, pretty } => {
            replay::run(&script, config, pretty).await?;
        }
        Commands::Config => {
            show_config::run(&config)?;
        }
    }

    Ok(())
}
