//! Post-submission processing utilities.
//!
//! Builds the history record for a finished submission and renders export
//! messages for presentation layers.

use crate::history::{self, HistoryStore};
use crate::model::{DetectionResult, ExplanationKind, HistoryRecord};
use rand::RngCore;
use std::path::Path;
use time::OffsetDateTime;

/// Generate a random identifier for a history record.
fn gen_record_id() -> String {
    let mut b = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut b);
    format!("{:016x}", u64::from_le_bytes(b))
}

/// Build the record for a submission whose detection call succeeded.
pub(crate) fn build_record(
    source_file_name: &str,
    detection: &DetectionResult,
    explanation: &str,
    explanation_kind: ExplanationKind,
) -> HistoryRecord {
    HistoryRecord {
        id: gen_record_id(),
        timestamp: OffsetDateTime::now_utc(),
        source_file_name: source_file_name.to_string(),
        detections: detection.detections.clone(),
        explanation: explanation.to_string(),
        explanation_kind,
    }
}

/// Export the newest record, returning a message for the status line.
pub fn export_latest(store: &HistoryStore, path: &Path) -> String {
    let Some(latest) = store.list().into_iter().next() else {
        return "Nothing to export yet.".into();
    };
    match history::export_json(path, std::slice::from_ref(&latest)) {
        Ok(()) => format!("Exported JSON: {}", path.display()),
        Err(e) => format!("Export JSON failed: {e:#}"),
    }
}
