//! Print the effective engine configuration.

use anyhow::{Context, Result};
use convo_sync_client::EngineConfig;

/// Run the config command.
pub fn run(config: &EngineConfig) -> Result<()> {
    println!("{}", render(config)?);
    Ok(())
}

fn render(config: &EngineConfig) -> Result<String> {
    serde_json::to_string_pretty(config).context("Failed to serialize configuration")
}
