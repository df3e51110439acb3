//! Webhook stages of the pipeline: mutation, validation and metadata
//! extraction, each a [`Processor`](crate::engine::Processor) driven by the
//! [`ProcessingEngine`](crate::engine::ProcessingEngine).

mod metadata;
mod mutation;
mod validation;

pub use metadata::{FileMetadata, MetadataResult, WebhookMetadataExtractor};
pub use mutation::WebhookMutator;
pub use validation::WebhookValidator;

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::engine::WorkUnit;
use crate::error::{AssetError, Result};
use crate::loader::safe_join;
use crate::model::Message;

/// Worker count and per-call timeout of one webhook stage.
#[derive(Debug, Clone, Copy)]
pub struct StageSettings {
    pub workers: usize,
    pub timeout: Duration,
}

/// Per-file verdicts returned by validation services, and by mutation
/// services explaining a rejection.
#[derive(Debug, Default, Deserialize)]
struct StatusReport {
    #[serde(default)]
    status: BTreeMap<String, FileVerdict>,
}

#[derive(Debug, Deserialize)]
struct FileVerdict {
    status: Verdict,
    #[serde(default)]
    message: String,
}

#[derive(Debug, PartialEq, Eq, Deserialize)]
enum Verdict {
    Success,
    Failure,
}

impl StatusReport {
    fn failures(self) -> Vec<Message> {
        self.status
            .into_iter()
            .filter(|(_, verdict)| verdict.status == Verdict::Failure)
            .map(|(file, verdict)| Message::new(file, verdict.message))
            .collect()
    }
}

/// Messages for a rejected unit: the per-file report when the body carries
/// one, otherwise the body text attached to every file of the unit.
fn rejection_messages(unit: &WorkUnit, body: &[u8]) -> Vec<Message> {
    if let Ok(report) = serde_json::from_slice::<StatusReport>(body) {
        let failures = report.failures();
        if !failures.is_empty() {
            return failures;
        }
    }
    let text = String::from_utf8_lossy(body).trim().to_string();
    let text = if text.is_empty() {
        "rejected by service".to_string()
    } else {
        text
    };
    unit.files()
        .iter()
        .map(|file| Message::new(file.clone(), text.clone()))
        .collect()
}

async fn read_asset(base_path: &Path, file: &str) -> Result<Vec<u8>> {
    let path = safe_join(base_path, file)?;
    tokio::fs::read(&path)
        .await
        .map_err(|e| AssetError::io(&path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_failures_keep_only_failed_files() {
        let body = br#"{"status":{"a.md":{"status":"Success"},"b.md":{"status":"Failure","message":"broken link"}}}"#;
        let messages = rejection_messages(&WorkUnit::File("b.md".into()), body);
        assert_eq!(messages, vec![Message::new("b.md", "broken link")]);
    }

    #[test]
    fn plain_rejection_applies_to_every_file_in_unit() {
        let unit = WorkUnit::Batch(vec!["a".into(), "b".into()]);
        let messages = rejection_messages(&unit, b"  quota exceeded \n");
        assert_eq!(
            messages,
            vec![
                Message::new("a", "quota exceeded"),
                Message::new("b", "quota exceeded")
            ]
        );
    }

    #[test]
    fn empty_rejection_gets_default_text() {
        let messages = rejection_messages(&WorkUnit::File("x".into()), b"");
        assert_eq!(messages[0].text, "rejected by service");
    }
}
