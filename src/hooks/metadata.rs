use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::{read_asset, rejection_messages, StageSettings};
use crate::contract::MetadataExtractor;
use crate::engine::{
    Dispatch, EngineOptions, EngineResult, FailurePolicy, ProcessingEngine, Processor, WorkUnit,
};
use crate::error::Result;
use crate::model::{Message, ObjectMeta, ServiceDescriptor};
use crate::webhook::{decode, Payload, Reply, WebhookGateway};

#[derive(Debug, Clone, PartialEq)]
pub struct FileMetadata {
    pub file_name: String,
    pub metadata: serde_json::Value,
}

/// Metadata gathered for the asset plus the engine outcome.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataResult {
    /// One entry per file, sorted by name. A later service overwrites
    /// metadata an earlier one returned for the same file.
    pub files: Vec<FileMetadata>,
    pub result: EngineResult,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetadataResponse {
    #[serde(default)]
    data: Vec<MetadataEntry>,
    #[serde(default)]
    errors: Vec<MetadataError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetadataEntry {
    file_path: String,
    #[serde(default)]
    metadata: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetadataError {
    file_path: String,
    #[serde(default)]
    message: String,
}

/// Sends the selected files of each service in one multipart request and
/// merges the returned per-file metadata.
pub struct WebhookMetadataExtractor {
    gateway: WebhookGateway,
    settings: StageSettings,
}

impl WebhookMetadataExtractor {
    pub fn new(gateway: WebhookGateway, settings: StageSettings) -> Self {
        Self { gateway, settings }
    }
}

#[async_trait]
impl MetadataExtractor for WebhookMetadataExtractor {
    #[instrument(skip_all, fields(asset = %asset.prefix(), files = files.len()))]
    async fn extract(
        &self,
        cancel: &CancellationToken,
        asset: &ObjectMeta,
        base_path: &Path,
        files: &[String],
        services: &[ServiceDescriptor],
    ) -> Result<MetadataResult> {
        if services.is_empty() {
            return Ok(MetadataResult {
                files: Vec::new(),
                result: EngineResult::succeeded(),
            });
        }
        let processor = Arc::new(MetadataProcessor {
            gateway: self.gateway.clone(),
            base_path: base_path.to_path_buf(),
            collected: Mutex::new(BTreeMap::new()),
        });
        let engine = ProcessingEngine::new(EngineOptions {
            workers: self.settings.workers,
            timeout: self.settings.timeout,
            policy: FailurePolicy::ContinueOnFailure,
        });
        let result = engine
            .run(processor.clone(), files, services, cancel)
            .await?;

        let files: Vec<FileMetadata> = std::mem::take(&mut *processor.collected.lock().await)
            .into_iter()
            .map(|(file_name, metadata)| FileMetadata {
                file_name,
                metadata,
            })
            .collect();
        info!(
            success = result.success,
            with_metadata = files.len(),
            "Metadata extraction finished"
        );
        Ok(MetadataResult { files, result })
    }
}

struct MetadataProcessor {
    gateway: WebhookGateway,
    base_path: PathBuf,
    collected: Mutex<BTreeMap<String, serde_json::Value>>,
}

#[async_trait]
impl Processor for MetadataProcessor {
    fn dispatch(&self) -> Dispatch {
        Dispatch::Batch
    }

    async fn call(
        &self,
        service: &ServiceDescriptor,
        unit: &WorkUnit,
        timeout: Duration,
    ) -> Result<Reply> {
        let mut form = Form::new();
        for file in unit.files() {
            let content = read_asset(&self.base_path, file).await?;
            form = form.part(file.clone(), Part::bytes(content).file_name(file.clone()));
        }
        self.gateway
            .send(service, Payload::Multipart(form), timeout)
            .await
    }

    async fn on_success(
        &self,
        service: &ServiceDescriptor,
        _unit: &WorkUnit,
        body: Vec<u8>,
    ) -> Result<Vec<Message>> {
        let response: MetadataResponse = decode(&body, &self.gateway.url_for(service))?;
        let mut collected = self.collected.lock().await;
        for entry in response.data {
            debug!(service = %service.key(), file = %entry.file_path, "Metadata received");
            collected.insert(entry.file_path, entry.metadata);
        }
        Ok(response
            .errors
            .into_iter()
            .map(|e| Message::new(e.file_path, e.message))
            .collect())
    }

    async fn on_fail(
        &self,
        _service: &ServiceDescriptor,
        unit: &WorkUnit,
        body: Vec<u8>,
    ) -> Result<Vec<Message>> {
        Ok(rejection_messages(unit, &body))
    }
}
