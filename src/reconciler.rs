//! Per-resource state machine deciding what a reconciliation trigger does.
//!
//! Triggers are evaluated in priority order: deletion, spec change, relist of
//! a ready asset, pending work, retryable failure. Anything else is a no-op
//! and yields no status write.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::contract::{BucketFinder, EventKind, EventRecorder, Store};
use crate::error::Result;
use crate::model::{AssetSpec, AssetStatus, BucketStatus, ObjectMeta, Phase, Reason};
use crate::pipeline::{ContentPipeline, PipelineOutcome};

/// What a trigger resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Delete,
    Schedule,
    Verify,
    Publish,
    Retry,
    Skip,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Delete => "delete",
            Action::Schedule => "schedule",
            Action::Verify => "verify",
            Action::Publish => "publish",
            Action::Retry => "retry",
            Action::Skip => "skip",
        };
        f.write_str(name)
    }
}

pub struct AssetReconciler {
    buckets: Arc<dyn BucketFinder>,
    store: Arc<dyn Store>,
    pipeline: ContentPipeline,
    recorder: Arc<dyn EventRecorder>,
    relist_interval: Duration,
}

impl AssetReconciler {
    pub fn new(
        buckets: Arc<dyn BucketFinder>,
        store: Arc<dyn Store>,
        pipeline: ContentPipeline,
        recorder: Arc<dyn EventRecorder>,
        relist_interval: Duration,
    ) -> Self {
        Self {
            buckets,
            store,
            pipeline,
            recorder,
            relist_interval,
        }
    }

    pub fn next_action(&self, now: DateTime<Utc>, meta: &ObjectMeta, status: &AssetStatus) -> Action {
        if meta.deletion_requested {
            return Action::Delete;
        }
        if status.observed_generation != meta.generation {
            return Action::Schedule;
        }
        match status.phase {
            Some(Phase::Ready) if self.relist_elapsed(now, status) => Action::Verify,
            Some(Phase::Pending)
                if !status.has_reason(Reason::BucketNotReady) || self.relist_elapsed(now, status) =>
            {
                Action::Publish
            }
            Some(Phase::Failed)
                if !status.reason.is_some_and(Reason::requires_spec_change)
                    && self.relist_elapsed(now, status) =>
            {
                Action::Retry
            }
            _ => Action::Skip,
        }
    }

    /// Compute the next status for one trigger. `None` means nothing to write.
    ///
    /// Errors are only returned on the deletion path; every other failure is
    /// expressed as a `Failed` status carrying the error text.
    #[instrument(skip_all, fields(asset = %meta.prefix(), generation = meta.generation))]
    pub async fn handle(
        &self,
        cancel: &CancellationToken,
        now: DateTime<Utc>,
        meta: &ObjectMeta,
        spec: &AssetSpec,
        status: &AssetStatus,
    ) -> Result<Option<AssetStatus>> {
        let action = self.next_action(now, meta, status);
        info!(action = %action, phase = ?status.phase, reason = ?status.reason, "[RECONCILE] Handling asset");

        match action {
            Action::Delete => {
                self.on_delete(meta, spec).await?;
                Ok(None)
            }
            Action::Schedule => Ok(Some(self.on_spec_change(now, meta, spec, status).await)),
            Action::Verify => Ok(Some(self.on_ready(now, meta, spec, status).await)),
            Action::Publish | Action::Retry => Ok(Some(self.on_pending(cancel, now, meta, spec).await)),
            Action::Skip => {
                debug!("[RECONCILE] Nothing to do");
                Ok(None)
            }
        }
    }

    async fn on_delete(&self, meta: &ObjectMeta, spec: &AssetSpec) -> Result<()> {
        if !meta.has_finalizer() {
            debug!("[RECONCILE] Finalizer already removed");
            return Ok(());
        }
        let bucket = self
            .buckets
            .find_bucket(&meta.namespace, &spec.bucket_ref.name)
            .await?;
        match bucket {
            Some(bucket) if bucket.ready => {
                self.delete_remote_content(meta, &bucket.remote_name).await?;
                info!("[RECONCILE] Asset content deleted");
            }
            _ => info!(bucket = %spec.bucket_ref.name, "[RECONCILE] Bucket not ready, nothing to delete"),
        }
        Ok(())
    }

    async fn on_spec_change(
        &self,
        now: DateTime<Utc>,
        meta: &ObjectMeta,
        spec: &AssetSpec,
        status: &AssetStatus,
    ) -> AssetStatus {
        if !status.published_ref.files.is_empty() {
            match self
                .buckets
                .find_bucket(&meta.namespace, &spec.bucket_ref.name)
                .await
            {
                Ok(Some(bucket)) if bucket.ready => {
                    if let Err(e) = self.delete_remote_content(meta, &bucket.remote_name).await {
                        return self.failed(now, meta, Reason::CleanupError, &e.to_string());
                    }
                }
                Ok(_) => debug!("[RECONCILE] Bucket not ready, previous content left in place"),
                Err(e) => return self.failed(now, meta, Reason::BucketError, &e.to_string()),
            }
        }
        self.record(meta, EventKind::Normal, Reason::Scheduled, None);
        new_status(now, meta, Phase::Pending, Reason::Scheduled, None)
    }

    async fn on_ready(
        &self,
        now: DateTime<Utc>,
        meta: &ObjectMeta,
        spec: &AssetSpec,
        status: &AssetStatus,
    ) -> AssetStatus {
        let bucket = match self.ready_bucket(now, meta, spec).await {
            Ok(bucket) => bucket,
            Err(status) => return status,
        };

        let files = status.published_ref.file_names();
        match self
            .store
            .contains_all_objects(&bucket.remote_name, &meta.prefix(), &files)
            .await
        {
            Err(e) => self.failed(now, meta, Reason::RemoteContentVerificationError, &e.to_string()),
            Ok(false) => {
                self.record(meta, EventKind::Warning, Reason::MissingContent, None);
                new_status(now, meta, Phase::Failed, Reason::MissingContent, None)
            }
            Ok(true) => {
                debug!(files = files.len(), "[RECONCILE] Published content verified");
                let mut refreshed = new_status(now, meta, Phase::Ready, Reason::Uploaded, None);
                refreshed.published_ref = status.published_ref.clone();
                refreshed
            }
        }
    }

    async fn on_pending(
        &self,
        cancel: &CancellationToken,
        now: DateTime<Utc>,
        meta: &ObjectMeta,
        spec: &AssetSpec,
    ) -> AssetStatus {
        let bucket = match self.ready_bucket(now, meta, spec).await {
            Ok(bucket) => bucket,
            Err(status) => return status,
        };
        if let Err(e) = self.delete_remote_content(meta, &bucket.remote_name).await {
            return self.failed(now, meta, Reason::CleanupError, &e.to_string());
        }

        match self.pipeline.run(cancel, meta, spec, &bucket).await {
            PipelineOutcome::Published(published_ref) => {
                info!(files = published_ref.files.len(), base_url = %published_ref.base_url, "[RECONCILE] Asset published");
                let mut status = new_status(now, meta, Phase::Ready, Reason::Uploaded, None);
                status.published_ref = published_ref;
                status
            }
            PipelineOutcome::Failed { reason, message } => AssetStatus {
                message,
                ..new_status(now, meta, Phase::Failed, reason, None)
            },
        }
    }

    /// Resolve the referenced bucket, or the status to report when it is unusable.
    async fn ready_bucket(
        &self,
        now: DateTime<Utc>,
        meta: &ObjectMeta,
        spec: &AssetSpec,
    ) -> std::result::Result<BucketStatus, AssetStatus> {
        match self
            .buckets
            .find_bucket(&meta.namespace, &spec.bucket_ref.name)
            .await
        {
            Ok(Some(bucket)) if bucket.ready => Ok(bucket),
            Ok(_) => {
                info!(bucket = %spec.bucket_ref.name, "[RECONCILE] Bucket is not ready");
                self.record(meta, EventKind::Warning, Reason::BucketNotReady, None);
                Err(new_status(now, meta, Phase::Pending, Reason::BucketNotReady, None))
            }
            Err(e) => Err(self.failed(now, meta, Reason::BucketError, &e.to_string())),
        }
    }

    async fn delete_remote_content(&self, meta: &ObjectMeta, bucket: &str) -> Result<()> {
        let prefix = meta.prefix();
        let existing = self.store.list_objects(bucket, &prefix).await?;
        if existing.is_empty() {
            debug!(bucket, prefix = %prefix, "[RECONCILE] No remote content to delete");
            return Ok(());
        }
        self.store.delete_objects(bucket, &prefix).await?;
        info!(bucket, prefix = %prefix, objects = existing.len(), "[RECONCILE] Remote content deleted");
        self.record(meta, EventKind::Normal, Reason::Cleaned, None);
        Ok(())
    }

    fn relist_elapsed(&self, now: DateTime<Utc>, status: &AssetStatus) -> bool {
        match status.last_heartbeat_time {
            None => true,
            Some(heartbeat) => now
                .signed_duration_since(heartbeat)
                .to_std()
                .is_ok_and(|elapsed| elapsed >= self.relist_interval),
        }
    }

    fn failed(&self, now: DateTime<Utc>, meta: &ObjectMeta, reason: Reason, detail: &str) -> AssetStatus {
        warn!(reason = %reason, error = %detail, "[RECONCILE] Asset failed");
        self.record(meta, EventKind::Warning, reason, Some(detail));
        new_status(now, meta, Phase::Failed, reason, Some(detail))
    }

    fn record(&self, meta: &ObjectMeta, kind: EventKind, reason: Reason, detail: Option<&str>) {
        self.recorder.record(meta, kind, reason, &reason.message(detail));
    }
}

fn new_status(
    now: DateTime<Utc>,
    meta: &ObjectMeta,
    phase: Phase,
    reason: Reason,
    detail: Option<&str>,
) -> AssetStatus {
    AssetStatus {
        phase: Some(phase),
        reason: Some(reason),
        message: reason.message(detail),
        last_heartbeat_time: Some(now),
        observed_generation: meta.generation,
        published_ref: Default::default(),
    }
}
