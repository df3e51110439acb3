use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::config::Config;
use crate::model::AssetResource;

pub const ENV_TEMPORARY_DIRECTORY: &str = "ASSET_PIPELINE_TEMPORARY_DIRECTORY";
pub const ENV_WEBHOOK_URL_TEMPLATE: &str = "ASSET_PIPELINE_WEBHOOK_URL_TEMPLATE";
pub const ENV_RELIST_INTERVAL_SECS: &str = "ASSET_PIPELINE_RELIST_INTERVAL_SECS";

/// Load a YAML config file (or defaults when `path` is `None`), apply
/// environment overrides and validate the result.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => {
            info!(config_path = ?path, "Loading configuration from file");
            let content = fs::read_to_string(path).map_err(|e| {
                error!(error = ?e, config_path = ?path, "Failed to read config file");
                anyhow::anyhow!("Failed to read config file {:?}: {}", path, e)
            })?;
            if content.trim().is_empty() {
                Config::default()
            } else {
                serde_yaml::from_str(&content).map_err(|e| {
                    error!(error = ?e, config_path = ?path, "Failed to parse config YAML");
                    anyhow::anyhow!("Failed to parse config YAML: {e}")
                })?
            }
        }
        None => {
            info!("No config file given, using defaults");
            Config::default()
        }
    };

    apply_env_overrides(&mut config)?;
    config.validate()?;
    config.trace_loaded();
    Ok(config)
}

fn apply_env_overrides(config: &mut Config) -> Result<()> {
    if let Ok(dir) = std::env::var(ENV_TEMPORARY_DIRECTORY) {
        info!(temporary_directory = %dir, "Temporary directory overridden from env");
        config.temporary_directory = PathBuf::from(dir);
    }
    if let Ok(template) = std::env::var(ENV_WEBHOOK_URL_TEMPLATE) {
        info!(url_template = %template, "Webhook URL template overridden from env");
        config.webhook.url_template = template;
    }
    if let Ok(raw) = std::env::var(ENV_RELIST_INTERVAL_SECS) {
        config.relist_interval_secs = raw.parse::<u64>().map_err(|e| {
            error!(error = ?e, var = ?raw, "Relist interval override must be a whole number of seconds");
            anyhow::anyhow!("{ENV_RELIST_INTERVAL_SECS} must be a whole number of seconds: {e}")
        })?;
    }
    Ok(())
}

/// Read an asset manifest from YAML.
pub fn load_asset(path: &Path) -> Result<AssetResource> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read asset manifest {path:?}"))?;
    let asset: AssetResource = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse asset manifest {path:?}"))?;
    if asset.metadata.name.is_empty() || asset.metadata.namespace.is_empty() {
        anyhow::bail!("Asset manifest {path:?} must set metadata.name and metadata.namespace");
    }
    info!(asset = %asset.metadata.prefix(), url = %asset.spec.source.url, "Asset manifest loaded");
    Ok(asset)
}
