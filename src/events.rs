use tracing::{info, warn};

use crate::contract::{EventKind, EventRecorder};
use crate::model::{ObjectMeta, Reason};

/// Emits lifecycle events as `tracing` events on the `asset_pipeline::events` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRecorder;

impl EventRecorder for TracingRecorder {
    fn record(&self, object: &ObjectMeta, kind: EventKind, reason: Reason, message: &str) {
        match kind {
            EventKind::Normal => info!(
                target: "asset_pipeline::events",
                asset = %object.prefix(),
                reason = %reason,
                message,
                "Event"
            ),
            EventKind::Warning => warn!(
                target: "asset_pipeline::events",
                asset = %object.prefix(),
                reason = %reason,
                message,
                "Event"
            ),
        }
    }
}
