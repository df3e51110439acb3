use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::{read_asset, rejection_messages, StageSettings};
use crate::contract::Mutator;
use crate::engine::{
    Dispatch, EngineOptions, EngineResult, FailurePolicy, ProcessingEngine, Processor, WorkUnit,
};
use crate::error::{AssetError, Result};
use crate::loader::safe_join;
use crate::model::{Message, ObjectMeta, ServiceDescriptor};
use crate::webhook::{decode, Payload, Reply, WebhookGateway};

#[derive(Debug, Serialize)]
struct MutationRequest<'a> {
    name: &'a str,
    namespace: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<&'a serde_json::Value>,
    assets: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct MutationResponse {
    #[serde(default)]
    assets: BTreeMap<String, String>,
}

/// Sends every selected file to each mutation service in one JSON call and
/// writes the returned contents back in place. The first failure stops the run.
pub struct WebhookMutator {
    gateway: WebhookGateway,
    settings: StageSettings,
}

impl WebhookMutator {
    pub fn new(gateway: WebhookGateway, settings: StageSettings) -> Self {
        Self { gateway, settings }
    }
}

#[async_trait]
impl Mutator for WebhookMutator {
    #[instrument(skip_all, fields(asset = %asset.prefix(), files = files.len()))]
    async fn mutate(
        &self,
        cancel: &CancellationToken,
        asset: &ObjectMeta,
        base_path: &Path,
        files: &[String],
        services: &[ServiceDescriptor],
    ) -> Result<EngineResult> {
        if services.is_empty() {
            return Ok(EngineResult::succeeded());
        }
        let processor = Arc::new(MutationProcessor {
            gateway: self.gateway.clone(),
            base_path: base_path.to_path_buf(),
            name: asset.name.clone(),
            namespace: asset.namespace.clone(),
        });
        let engine = ProcessingEngine::new(EngineOptions {
            workers: self.settings.workers,
            timeout: self.settings.timeout,
            policy: FailurePolicy::StopOnFirstFailure,
        });
        let result = engine.run(processor, files, services, cancel).await?;
        info!(success = result.success, "Mutation finished");
        Ok(result)
    }
}

struct MutationProcessor {
    gateway: WebhookGateway,
    base_path: PathBuf,
    name: String,
    namespace: String,
}

#[async_trait]
impl Processor for MutationProcessor {
    fn dispatch(&self) -> Dispatch {
        Dispatch::Batch
    }

    async fn call(
        &self,
        service: &ServiceDescriptor,
        unit: &WorkUnit,
        timeout: Duration,
    ) -> Result<Reply> {
        let mut assets = BTreeMap::new();
        for file in unit.files() {
            let bytes = read_asset(&self.base_path, file).await?;
            let text = String::from_utf8(bytes).map_err(|e| {
                AssetError::io(
                    self.base_path.join(file),
                    std::io::Error::new(std::io::ErrorKind::InvalidData, e),
                )
            })?;
            assets.insert(file.clone(), text);
        }
        let request = MutationRequest {
            name: &self.name,
            namespace: &self.namespace,
            metadata: service.parameters.as_ref(),
            assets,
        };
        self.gateway
            .send(service, Payload::json(&request)?, timeout)
            .await
    }

    async fn on_success(
        &self,
        service: &ServiceDescriptor,
        _unit: &WorkUnit,
        body: Vec<u8>,
    ) -> Result<Vec<Message>> {
        let url = self.gateway.url_for(service);
        let response: MutationResponse = decode(&body, &url)?;
        for (file, content) in response.assets {
            let path = safe_join(&self.base_path, &file)?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| AssetError::io(parent, e))?;
            }
            tokio::fs::write(&path, content)
                .await
                .map_err(|e| AssetError::io(&path, e))?;
            debug!(service = %service.key(), file = %file, "Mutated file written");
        }
        Ok(Vec::new())
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
