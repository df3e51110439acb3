use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use super::{read_asset, rejection_messages, StageSettings, StatusReport};
use crate::contract::Validator;
use crate::engine::{
    EngineOptions, EngineResult, FailurePolicy, ProcessingEngine, Processor, WorkUnit,
};
use crate::error::{AssetError, Result};
use crate::model::{Message, ObjectMeta, ServiceDescriptor};
use crate::webhook::{decode, Payload, Reply, WebhookGateway};

/// Posts each file to every validation service as multipart form data.
/// All rejections are collected; none stops the run.
pub struct WebhookValidator {
    gateway: WebhookGateway,
    settings: StageSettings,
}

impl WebhookValidator {
    pub fn new(gateway: WebhookGateway, settings: StageSettings) -> Self {
        Self { gateway, settings }
    }
}

#[async_trait]
impl Validator for WebhookValidator {
    #[instrument(skip_all, fields(asset = %asset.prefix(), files = files.len()))]
    async fn validate(
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
        let processor = Arc::new(ValidationProcessor {
            gateway: self.gateway.clone(),
            base_path: base_path.to_path_buf(),
        });
        let engine = ProcessingEngine::new(EngineOptions {
            workers: self.settings.workers,
            timeout: self.settings.timeout,
            policy: FailurePolicy::ContinueOnFailure,
        });
        let result = engine.run(processor, files, services, cancel).await?;
        info!(
            success = result.success,
            services_with_failures = result.messages.len(),
            "Validation finished"
        );
        Ok(result)
    }
}

struct ValidationProcessor {
    gateway: WebhookGateway,
    base_path: PathBuf,
}

#[async_trait]
impl Processor for ValidationProcessor {
    async fn call(
        &self,
        service: &ServiceDescriptor,
        unit: &WorkUnit,
        timeout: Duration,
    ) -> Result<Reply> {
        let mut form = Form::new();
        for file in unit.files() {
            let content = read_asset(&self.base_path, file).await?;
            form = form.part("content", Part::bytes(content).file_name(file.clone()));
        }
        let parameters = match &service.parameters {
            Some(value) => serde_json::to_string(value)
                .map_err(|e| AssetError::parsing("validation parameters", e))?,
            None => "{}".to_string(),
        };
        form = form.text("parameters", parameters);
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
        let report: StatusReport = decode(&body, &self.gateway.url_for(service))?;
        Ok(report.failures())
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
