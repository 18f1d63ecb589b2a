//! Configuration loading

use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;

use crate::Config;

const DEFAULT_SEARCH_PATHS: [&str; 2] = ["config.yaml", "/etc/nvr/config.yaml"];

/// Find the config file to use.
///
/// Search order:
/// 1. Explicit path (CLI flag); must exist
/// 2. `NVR_CONFIG_PATH` environment variable
/// 3. ./config.yaml
/// 4. /etc/nvr/config.yaml
pub fn find_config_path(explicit: Option<&str>) -> Result<Option<String>> {
    if let Some(path) = explicit {
        if !Path::new(path).exists() {
            anyhow::bail!("Config file {path} does not exist");
        }
        return Ok(Some(path.to_string()));
    }

    Ok(std::env::var("NVR_CONFIG_PATH")
        .ok()
        .filter(|p| Path::new(p).exists())
        .or_else(|| {
            DEFAULT_SEARCH_PATHS
                .iter()
                .find(|p| Path::new(p).exists())
                .map(|p| (*p).to_string())
        }))
}

/// Load and validate configuration.
///
/// A config file that exists but cannot be parsed is an error rather than a
/// silent fallback, so a typo never starts the recorder with defaults.
pub fn load_config(explicit: Option<&str>) -> Result<Config> {
    let config = match find_config_path(explicit)? {
        Some(path) => {
            eprintln!("Loading config from {path}");
            Config::from_file(&path).with_context(|| format!("Failed to load {path}"))?
        }
        None => {
            eprintln!("No config file found, using environment variables");
            Config::from_env().context("Failed to load configuration from environment")?
        }
    };

    if let Err(errors) = config.validate() {
        for error in &errors {
            tracing::error!("Config validation error: {}", error);
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        ));
    }

    info!("Configuration loaded and validated successfully");
    info!("Broker API: {}", config.broker.api_base_url());
    info!("Storage root: {}", config.recording.storage_path);

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_missing_path_is_error() {
        assert!(find_config_path(Some("/definitely/not/here.yaml")).is_err());
    }

    #[test]
    fn test_explicit_path_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nvr.yaml");
        std::fs::write(&path, "recording:\n  storage_path: /tmp/x\n").unwrap();
        let found = find_config_path(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(found.as_deref(), path.to_str());

        let config = load_config(path.to_str()).unwrap();
        assert_eq!(config.recording.storage_path, "/tmp/x");
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "broker: [unterminated\n").unwrap();
        assert!(load_config(path.to_str()).is_err());
    }

    #[test]
    fn test_invalid_values_fail_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ports.yaml");
        std::fs::write(&path, "broker:\n  api_port: 8554\n  rtsp_port: 8554\n").unwrap();
        let err = load_config(path.to_str()).unwrap_err();
        assert!(err.to_string().contains("validation failed"));
    }
}
