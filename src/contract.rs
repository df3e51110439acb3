#![allow(unused)]

//! # contract: collaborator interfaces of the asset pipeline
//!
//! The reconciler and pipeline only talk to the outside world through the
//! traits in this module: the object store, bucket lookups, the source loader,
//! the three webhook stages, the resource datastore and the event sink.
//!
//! ## Mocking & Testing
//! - Every trait is annotated for `mockall`; the mocks are exported behind the
//!   default `test-export-mocks` feature so integration tests can script them.
//!
//! ## Implementations shipped with the crate
//! - [`crate::store::DirectoryStore`]: `Store` + `BucketFinder` on a local directory.
//! - [`crate::loader::ArchiveLoader`]: `Loader` over HTTP.
//! - [`crate::hooks`]: `Mutator`, `Validator`, `MetadataExtractor` on the webhook engine.
//! - [`crate::resource::MemoryResourceClient`]: `ResourceClient`.
//! - [`crate::events::TracingRecorder`]: `EventRecorder`.

use std::path::Path;

use async_trait::async_trait;
use mockall::{automock, predicate::*};
use tokio_util::sync::CancellationToken;

use crate::engine::EngineResult;
use crate::error::Result;
use crate::hooks::MetadataResult;
use crate::loader::LoadedAsset;
use crate::model::{AssetMode, AssetResource, BucketStatus, ObjectMeta, Reason, ServiceDescriptor};

/// Object store holding published asset files.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Store: Send + Sync {
    /// Upload `files` (relative to `base_path`) under `prefix` in `bucket`.
    async fn put_objects(
        &self,
        bucket: &str,
        prefix: &str,
        base_path: &Path,
        files: &[String],
    ) -> Result<()>;

    /// List object keys under `prefix`.
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;

    /// Delete every object under `prefix`.
    async fn delete_objects(&self, bucket: &str, prefix: &str) -> Result<()>;

    /// Whether every one of `files` exists under `prefix`.
    async fn contains_all_objects(
        &self,
        bucket: &str,
        prefix: &str,
        files: &[String],
    ) -> Result<bool>;
}

/// Resolves a bucket reference. `None` means the bucket does not exist (yet).
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait BucketFinder: Send + Sync {
    async fn find_bucket(&self, namespace: &str, name: &str) -> Result<Option<BucketStatus>>;
}

/// Pulls source content into a temporary directory.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Loader: Send + Sync {
    async fn load(
        &self,
        url: &str,
        name: &str,
        mode: AssetMode,
        filter: &str,
    ) -> Result<LoadedAsset>;
}

/// Rewrites asset files through mutation webhooks, in service order.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Mutator: Send + Sync {
    async fn mutate(
        &self,
        cancel: &CancellationToken,
        asset: &ObjectMeta,
        base_path: &Path,
        files: &[String],
        services: &[ServiceDescriptor],
    ) -> Result<EngineResult>;
}

/// Checks asset files against validation webhooks.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(
        &self,
        cancel: &CancellationToken,
        asset: &ObjectMeta,
        base_path: &Path,
        files: &[String],
        services: &[ServiceDescriptor],
    ) -> Result<EngineResult>;
}

/// Collects per-file metadata from metadata webhooks.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait MetadataExtractor: Send + Sync {
    async fn extract(
        &self,
        cancel: &CancellationToken,
        asset: &ObjectMeta,
        base_path: &Path,
        files: &[String],
        services: &[ServiceDescriptor],
    ) -> Result<MetadataResult>;
}

/// Resource-versioned datastore holding asset resources.
///
/// `update` must fail with [`crate::error::AssetError::Conflict`] when the
/// stored `resource_version` differs from the one on the submitted resource.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ResourceClient: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<AssetResource>>;

    async fn update(&self, resource: &AssetResource) -> Result<AssetResource>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

/// Sink for user-facing lifecycle events.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
pub trait EventRecorder: Send + Sync {
    fn record(&self, object: &ObjectMeta, kind: EventKind, reason: Reason, message: &str);
}
