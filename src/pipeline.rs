//! Content pipeline: load → mutate → validate → extract metadata → upload.
//!
//! Each stage short-circuits the run with a distinct [`Reason`]. The loaded
//! working directory is cleaned up on every path out of [`ContentPipeline::run`].

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::contract::{
    EventKind, EventRecorder, Loader, MetadataExtractor, Mutator, Store, Validator,
};
use crate::loader::LoadedAsset;
use crate::model::{
    render_messages, AssetFile, AssetSpec, BucketStatus, ObjectMeta, PublishedRef, Reason,
};

/// Result of one pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    Published(PublishedRef),
    Failed { reason: Reason, message: String },
}

pub struct ContentPipeline {
    loader: Arc<dyn Loader>,
    mutator: Arc<dyn Mutator>,
    validator: Arc<dyn Validator>,
    metadata: Arc<dyn MetadataExtractor>,
    store: Arc<dyn Store>,
    recorder: Arc<dyn EventRecorder>,
}

impl ContentPipeline {
    pub fn new(
        loader: Arc<dyn Loader>,
        mutator: Arc<dyn Mutator>,
        validator: Arc<dyn Validator>,
        metadata: Arc<dyn MetadataExtractor>,
        store: Arc<dyn Store>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Self {
        Self {
            loader,
            mutator,
            validator,
            metadata,
            store,
            recorder,
        }
    }

    /// Pull the source, run the webhook stages and publish into `bucket`.
    #[instrument(skip_all, fields(asset = %meta.prefix(), run_id = %Uuid::new_v4()))]
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        meta: &ObjectMeta,
        spec: &AssetSpec,
        bucket: &BucketStatus,
    ) -> PipelineOutcome {
        let source = &spec.source;
        info!(url = %source.url, mode = ?source.mode, "[PIPELINE] Loading source");
        let loaded = match self
            .loader
            .load(&source.url, &meta.name, source.mode, &source.filter)
            .await
        {
            Ok(loaded) => loaded,
            Err(e) => {
                error!(error = ?e, "[PIPELINE] Loading source failed");
                return self.fail(meta, Reason::PullingFailed, &e.to_string());
            }
        };
        info!(files = loaded.files().len(), "[PIPELINE] Source loaded");
        self.event(meta, EventKind::Normal, Reason::Pulled, None);

        let outcome = self.process(cancel, meta, spec, bucket, &loaded).await;

        let base_path = loaded.base_path().to_path_buf();
        if let Err(e) = loaded.clean() {
            warn!(path = %base_path.display(), error = %e, "[PIPELINE] Failed to remove working directory");
        }
        outcome
    }

    async fn process(
        &self,
        cancel: &CancellationToken,
        meta: &ObjectMeta,
        spec: &AssetSpec,
        bucket: &BucketStatus,
        loaded: &LoadedAsset,
    ) -> PipelineOutcome {
        let source = &spec.source;
        let base_path = loaded.base_path();
        let files = loaded.files();

        if !source.mutation_webhook_service.is_empty() {
            match self
                .mutator
                .mutate(cancel, meta, base_path, files, &source.mutation_webhook_service)
                .await
            {
                Err(e) => return self.fail(meta, Reason::MutationError, &e.to_string()),
                Ok(result) if !result.success => {
                    return self.fail(
                        meta,
                        Reason::MutationFailed,
                        &render_messages(&result.messages),
                    )
                }
                Ok(_) => self.event(meta, EventKind::Normal, Reason::Mutated, None),
            }
        }

        if !source.validation_webhook_service.is_empty() {
            match self
                .validator
                .validate(cancel, meta, base_path, files, &source.validation_webhook_service)
                .await
            {
                Err(e) => return self.fail(meta, Reason::ValidationError, &e.to_string()),
                Ok(result) if !result.success => {
                    return self.fail(
                        meta,
                        Reason::ValidationFailed,
                        &render_messages(&result.messages),
                    )
                }
                Ok(_) => self.event(meta, EventKind::Normal, Reason::Validated, None),
            }
        }

        let mut metadata = BTreeMap::new();
        if !source.metadata_webhook_service.is_empty() {
            match self
                .metadata
                .extract(cancel, meta, base_path, files, &source.metadata_webhook_service)
                .await
            {
                Err(e) => {
                    return self.fail(meta, Reason::MetadataExtractionFailed, &e.to_string())
                }
                Ok(extracted) if !extracted.result.success => {
                    return self.fail(
                        meta,
                        Reason::MetadataExtractionFailed,
                        &render_messages(&extracted.result.messages),
                    )
                }
                Ok(extracted) => {
                    metadata.extend(
                        extracted
                            .files
                            .into_iter()
                            .map(|f| (f.file_name, f.metadata)),
                    );
                    self.event(meta, EventKind::Normal, Reason::MetadataExtracted, None);
                }
            }
        }

        let prefix = meta.prefix();
        info!(bucket = %bucket.remote_name, prefix = %prefix, files = files.len(), "[PIPELINE] Uploading");
        if let Err(e) = self
            .store
            .put_objects(&bucket.remote_name, &prefix, base_path, files)
            .await
        {
            error!(error = ?e, "[PIPELINE] Upload failed");
            return self.fail(meta, Reason::UploadFailed, &e.to_string());
        }
        self.event(meta, EventKind::Normal, Reason::Uploaded, None);

        PipelineOutcome::Published(PublishedRef {
            base_url: format!("{}/{}", bucket.url.trim_end_matches('/'), prefix),
            files: files
                .iter()
                .map(|name| AssetFile {
                    name: name.clone(),
                    metadata: metadata.remove(name),
                })
                .collect(),
        })
    }

    fn fail(&self, meta: &ObjectMeta, reason: Reason, detail: &str) -> PipelineOutcome {
        let message = reason.message(Some(detail));
        warn!(reason = %reason, message = %message, "[PIPELINE] Run failed");
        self.recorder
            .record(meta, EventKind::Warning, reason, &message);
        PipelineOutcome::Failed { reason, message }
    }

    fn event(&self, meta: &ObjectMeta, kind: EventKind, reason: Reason, detail: Option<&str>) {
        self.recorder.record(meta, kind, reason, &reason.message(detail));
    }
}
