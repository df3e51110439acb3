use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{AssetError, Result};
use crate::hooks::StageSettings;
use crate::webhook::CLUSTER_URL_TEMPLATE;

/// Runtime configuration. Every field has a default, so an empty file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root for per-run working directories.
    pub temporary_directory: PathBuf,
    pub relist_interval_secs: u64,
    pub download_timeout_secs: u64,
    pub webhook: WebhookConfig,
    pub store: StoreConfig,
    pub status_update: StatusUpdateConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Service URL template with `{name}`, `{namespace}` and `{endpoint}` placeholders.
    pub url_template: String,
    pub mutation_timeout_secs: u64,
    pub validation_timeout_secs: u64,
    pub metadata_timeout_secs: u64,
    pub mutation_workers: usize,
    pub validation_workers: usize,
    pub metadata_workers: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub upload_workers: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusUpdateConfig {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            temporary_directory: std::env::temp_dir(),
            relist_interval_secs: 300,
            download_timeout_secs: 600,
            webhook: WebhookConfig::default(),
            store: StoreConfig::default(),
            status_update: StatusUpdateConfig::default(),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url_template: CLUSTER_URL_TEMPLATE.to_string(),
            mutation_timeout_secs: 60,
            validation_timeout_secs: 60,
            metadata_timeout_secs: 60,
            mutation_workers: 10,
            validation_workers: 10,
            metadata_workers: 10,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { upload_workers: 10 }
    }
}

impl Default for StatusUpdateConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_ms: 100,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let workers = [
            ("webhook.mutation_workers", self.webhook.mutation_workers),
            ("webhook.validation_workers", self.webhook.validation_workers),
            ("webhook.metadata_workers", self.webhook.metadata_workers),
            ("store.upload_workers", self.store.upload_workers),
        ];
        if let Some((field, _)) = workers.iter().find(|(_, n)| *n == 0) {
            return Err(AssetError::config(format!("{field} must be at least 1")));
        }
        if self.status_update.max_attempts == 0 {
            return Err(AssetError::config("status_update.max_attempts must be at least 1"));
        }
        if !self.webhook.url_template.contains("{endpoint}") {
            return Err(AssetError::config(format!(
                "webhook.url_template {:?} has no {{endpoint}} placeholder",
                self.webhook.url_template
            )));
        }
        Ok(())
    }

    pub fn relist_interval(&self) -> Duration {
        Duration::from_secs(self.relist_interval_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn trace_loaded(&self) {
        info!(
            temporary_directory = %self.temporary_directory.display(),
            relist_interval_secs = self.relist_interval_secs,
            url_template = %self.webhook.url_template,
            "Loaded Config"
        );
        debug!(?self, "Config loaded (full debug)");
    }
}

impl WebhookConfig {
    pub fn mutation(&self) -> StageSettings {
        StageSettings {
            workers: self.mutation_workers,
            timeout: Duration::from_secs(self.mutation_timeout_secs),
        }
    }

    pub fn validation(&self) -> StageSettings {
        StageSettings {
            workers: self.validation_workers,
            timeout: Duration::from_secs(self.validation_timeout_secs),
        }
    }

    pub fn metadata(&self) -> StageSettings {
        StageSettings {
            workers: self.metadata_workers,
            timeout: Duration::from_secs(self.metadata_timeout_secs),
        }
    }
}
