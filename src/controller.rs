//! Reconcile loop glue: finalizer bookkeeping and optimistic-concurrency
//! status writes around [`AssetReconciler`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::contract::ResourceClient;
use crate::error::{AssetError, Result};
use crate::model::{AssetResource, FINALIZER};
use crate::reconciler::AssetReconciler;

/// Bounded retry of conflicting writes, with linear backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing was written.
    Unchanged,
    StatusUpdated,
    FinalizerAdded,
    FinalizerRemoved,
    /// The resource no longer exists.
    Gone,
}

pub struct Controller {
    client: Arc<dyn ResourceClient>,
    reconciler: AssetReconciler,
    retry: RetryPolicy,
}

impl Controller {
    pub fn new(client: Arc<dyn ResourceClient>, reconciler: AssetReconciler, retry: RetryPolicy) -> Self {
        Self {
            client,
            reconciler,
            retry,
        }
    }

    #[instrument(skip(self, cancel, now))]
    pub async fn reconcile(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome> {
        let Some(resource) = self.client.get(namespace, name).await? else {
            debug!("Resource gone");
            return Ok(ReconcileOutcome::Gone);
        };
        let meta = &resource.metadata;

        if !meta.deletion_requested && !meta.has_finalizer() {
            let added = self
                .update_with_retry(namespace, name, |current| {
                    if current.metadata.has_finalizer() {
                        return false;
                    }
                    current.metadata.finalizers.push(FINALIZER.to_string());
                    true
                })
                .await?;
            return Ok(if added {
                info!("Finalizer added");
                ReconcileOutcome::FinalizerAdded
            } else {
                ReconcileOutcome::Unchanged
            });
        }
        if meta.deletion_requested && !meta.has_finalizer() {
            return Ok(ReconcileOutcome::Unchanged);
        }

        let next = self
            .reconciler
            .handle(cancel, now, meta, &resource.spec, &resource.status)
            .await?;

        if meta.deletion_requested {
            self.update_with_retry(namespace, name, |current| {
                current.metadata.finalizers.retain(|f| f != FINALIZER);
                true
            })
            .await?;
            info!("Finalizer removed");
            return Ok(ReconcileOutcome::FinalizerRemoved);
        }

        let Some(status) = next else {
            return Ok(ReconcileOutcome::Unchanged);
        };
        let generation = meta.generation;
        let written = self
            .update_with_retry(namespace, name, |current| {
                if current.metadata.generation != generation {
                    return false;
                }
                current.status = status.clone();
                true
            })
            .await?;
        if written {
            info!(phase = ?status.phase, reason = ?status.reason, "Status updated");
            Ok(ReconcileOutcome::StatusUpdated)
        } else {
            info!("Spec changed while reconciling, status dropped");
            Ok(ReconcileOutcome::Unchanged)
        }
    }

    /// Re-read, apply `mutate` and write until the write is accepted.
    /// `mutate` returning `false` abandons the write.
    async fn update_with_retry<F>(&self, namespace: &str, name: &str, mut mutate: F) -> Result<bool>
    where
        F: FnMut(&mut AssetResource) -> bool,
    {
        for attempt in 1..=self.retry.max_attempts {
            let Some(mut current) = self.client.get(namespace, name).await? else {
                return Err(AssetError::NotFound {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                });
            };
            if !mutate(&mut current) {
                return Ok(false);
            }
            match self.client.update(&current).await {
                Ok(_) => return Ok(true),
                Err(AssetError::Conflict { .. }) => {
                    warn!(attempt, max_attempts = self.retry.max_attempts, "Update conflict");
                    if attempt < self.retry.max_attempts {
                        tokio::time::sleep(self.retry.backoff * attempt).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(AssetError::Conflict {
            namespace: namespace.to_string(),
            name: name.to_string(),
            attempts: self.retry.max_attempts,
        })
    }
}
