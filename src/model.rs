//! Asset resource data model: identity, desired spec and observed status.
//!
//! Field names serialize in camelCase so manifests read the same way as the
//! cluster resources they mirror.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Finalizer guarding remote content cleanup.
pub const FINALIZER: &str = "assets.pipeline/cleanup";

/// Identity and bookkeeping of a resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    /// Bumped on every spec edit.
    pub generation: i64,
    /// Optimistic-concurrency token owned by the datastore.
    pub resource_version: u64,
    pub deletion_requested: bool,
    pub finalizers: Vec<String>,
}

impl ObjectMeta {
    pub fn has_finalizer(&self) -> bool {
        self.finalizers.iter().any(|f| f == FINALIZER)
    }

    /// Object-store prefix under which this asset's files are published.
    pub fn prefix(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// A declarative content asset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetResource {
    pub metadata: ObjectMeta,
    pub spec: AssetSpec,
    #[serde(default)]
    pub status: AssetStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetSpec {
    pub source: AssetSource,
    pub bucket_ref: BucketRef,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetSource {
    pub url: String,
    #[serde(default)]
    pub mode: AssetMode,
    /// Regular expression selecting files; empty keeps everything.
    #[serde(default)]
    pub filter: String,
    #[serde(default)]
    pub mutation_webhook_service: Vec<ServiceDescriptor>,
    #[serde(default)]
    pub validation_webhook_service: Vec<ServiceDescriptor>,
    #[serde(default)]
    pub metadata_webhook_service: Vec<ServiceDescriptor>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetMode {
    /// One file downloaded as-is.
    #[default]
    Single,
    /// A zip or tar archive extracted into a directory.
    Package,
    /// An index document listing files relative to its own URL.
    Index,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketRef {
    pub name: String,
}

/// A webhook service taking part in the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescriptor {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub endpoint: String,
    /// Opaque parameters passed through to the service unmodified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
    /// Regular expression restricting which files the service sees.
    #[serde(default)]
    pub filter: String,
}

impl ServiceDescriptor {
    /// Stable key used to group messages by originating service.
    pub fn key(&self) -> String {
        format!("{}/{}{}", self.namespace, self.name, self.endpoint)
    }
}

/// Resolved bucket state, read-only to the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketStatus {
    pub remote_name: String,
    pub url: String,
    pub ready: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Pending,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AssetStatus {
    pub phase: Option<Phase>,
    pub reason: Option<Reason>,
    pub message: String,
    pub last_heartbeat_time: Option<DateTime<Utc>>,
    pub observed_generation: i64,
    pub published_ref: PublishedRef,
}

impl AssetStatus {
    pub fn is(&self, phase: Phase) -> bool {
        self.phase == Some(phase)
    }

    pub fn has_reason(&self, reason: Reason) -> bool {
        self.reason == Some(reason)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PublishedRef {
    pub base_url: String,
    pub files: Vec<AssetFile>,
}

impl PublishedRef {
    pub fn file_names(&self) -> Vec<String> {
        self.files.iter().map(|f| f.name.clone()).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetFile {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// One file judged invalid by a service.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub file_name: String,
    pub text: String,
}

impl Message {
    pub fn new(file_name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            text: text.into(),
        }
    }
}

/// Messages grouped by [`ServiceDescriptor::key`].
pub type MessageMap = BTreeMap<String, Vec<Message>>;

/// Machine-readable cause of the current status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reason {
    Scheduled,
    BucketNotReady,
    BucketError,
    Cleaned,
    CleanupError,
    Pulled,
    PullingFailed,
    Mutated,
    MutationFailed,
    MutationError,
    Validated,
    ValidationFailed,
    ValidationError,
    MetadataExtracted,
    MetadataExtractionFailed,
    Uploaded,
    UploadFailed,
    RemoteContentVerificationError,
    MissingContent,
}

impl Reason {
    /// Human readable message for this reason, with optional detail appended.
    pub fn message(self, detail: Option<&str>) -> String {
        let base = match self {
            Reason::Scheduled => "Asset scheduled for processing",
            Reason::BucketNotReady => "Referenced bucket is not ready",
            Reason::BucketError => "Reading bucket status failed due to error",
            Reason::Cleaned => "Removed remote asset content",
            Reason::CleanupError => "Removing remote asset content failed due to error",
            Reason::Pulled => "Asset content pulled successfully",
            Reason::PullingFailed => "Asset content pulling failed due to error",
            Reason::Mutated => "Asset content mutated successfully",
            Reason::MutationFailed => "Asset mutation failed",
            Reason::MutationError => "Asset mutation failed due to error",
            Reason::Validated => "Asset content validated successfully",
            Reason::ValidationFailed => "Asset validation failed",
            Reason::ValidationError => "Asset validation failed due to error",
            Reason::MetadataExtracted => "Metadata extracted successfully",
            Reason::MetadataExtractionFailed => "Metadata extraction failed",
            Reason::Uploaded => "Asset content uploaded successfully",
            Reason::UploadFailed => "Asset content uploading failed due to error",
            Reason::RemoteContentVerificationError => {
                "Asset content verification failed due to error"
            }
            Reason::MissingContent => "Asset content is missing in the bucket",
        };
        match detail {
            Some(detail) if !detail.is_empty() => format!("{base}: {detail}"),
            _ => base.to_string(),
        }
    }

    /// Failures caused by the asset's own input; only a spec edit retries them.
    pub fn requires_spec_change(self) -> bool {
        matches!(self, Reason::ValidationFailed | Reason::MutationFailed)
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Render a message map for `status.message`.
pub fn render_messages(messages: &MessageMap) -> String {
    serde_json::to_string(messages).unwrap_or_else(|_| format!("{messages:?}"))
}
