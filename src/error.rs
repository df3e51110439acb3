//! Error types for the asset pipeline.
//!
//! Every fallible library operation returns [`AssetError`]. Business outcomes
//! (a webhook rejecting a file, a bucket that is not ready yet) are not errors:
//! they are reported through [`crate::engine::EngineResult`] and the asset status.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for all asset pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    /// The webhook or source could not be reached.
    #[error("transport error calling {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// A call did not finish within its time budget.
    #[error("call to {url} timed out after {after:?}")]
    Timeout { url: String, after: Duration },

    /// The remote answered with a status the caller does not accept.
    #[error("unexpected status {status} from {url}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    /// A response or document could not be decoded.
    #[error("parse error in {context}: {message}")]
    Parsing { context: String, message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Archive could not be read or is of an unsupported kind.
    #[error("archive error in {path:?}: {message}")]
    Archive { path: PathBuf, message: String },

    /// An archive entry or returned file name resolves outside its root.
    #[error("path traversal rejected for entry {entry:?}")]
    PathTraversal { entry: String },

    /// A filter expression failed to compile.
    #[error("invalid filter {pattern:?}: {source}")]
    InvalidFilter {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// Object store operation failed.
    #[error("store error: {0}")]
    Store(String),

    /// Bucket lookup failed.
    #[error("bucket error: {0}")]
    Bucket(String),

    /// Optimistic-concurrency clash that did not resolve within the retry budget.
    #[error("conflict updating {namespace}/{name} after {attempts} attempts")]
    Conflict {
        namespace: String,
        name: String,
        attempts: u32,
    },

    /// The resource does not exist.
    #[error("resource {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// A worker task panicked or was aborted.
    #[error("worker task failed: {0}")]
    Worker(String),

    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Several hard errors collected from concurrent workers.
    #[error("{}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("\n"))]
    Multiple(Vec<AssetError>),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AssetError>;

impl AssetError {
    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn parsing(context: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Parsing {
            context: context.into(),
            message: message.to_string(),
        }
    }

    pub fn archive(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Archive {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Map a `reqwest` failure for `url`, splitting out timeouts.
    pub fn from_reqwest(url: &str, timeout: Duration, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            Self::Timeout {
                url: url.to_string(),
                after: timeout,
            }
        } else {
            Self::Transport {
                url: url.to_string(),
                source,
            }
        }
    }

    /// Collapse a list of collected errors into one, or `None` when empty.
    pub fn combine(mut errors: Vec<AssetError>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Multiple(errors)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_keeps_single_error_unwrapped() {
        let err = AssetError::combine(vec![AssetError::Cancelled]).unwrap();
        assert!(matches!(err, AssetError::Cancelled));
        assert!(AssetError::combine(vec![]).is_none());
    }

    #[test]
    fn multiple_joins_messages_by_line() {
        let err = AssetError::combine(vec![
            AssetError::Store("first".into()),
            AssetError::config("second"),
        ])
        .unwrap();
        assert_eq!(err.to_string(), "store error: first\nconfig error: second");
    }
}
