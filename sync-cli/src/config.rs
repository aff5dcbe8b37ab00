//! Configuration loading for sync-cli.

use anyhow::{Context, Result};
use convo_sync_client::EngineConfig;
use std::path::Path;

/// Load the engine configuration, or the defaults when no file is given.
pub fn load(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => {
            let config = EngineConfig::from_file(path)
                .with_context(|| format!("Invalid engine configuration {}", path.display()))?;
            tracing::debug!(path = %path.display(), "loaded engine configuration");
            Ok(config)
        }
        None => Ok(EngineConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_without_file() {
        assert_eq!(load(None).unwrap(), EngineConfig::default());
    }

    #[test]
    fn loads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "page_size = 5").unwrap();

        let config = load(Some(file.path())).unwrap();
        assert_eq!(config.page_size, 5);
    }

    #[test]
    fn invalid_file_mentions_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "page_size = 0").unwrap();

        let err = load(Some(file.path())).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains(&file.path().display().to_string()));
        assert!(message.contains("page_size"));
    }
}
