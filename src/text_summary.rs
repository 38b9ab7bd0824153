//! Text summary builder for CLI output.
//!
//! Formats the success summary or failure banner for a workflow state, and
//! one-line descriptions of history records.

use crate::model::{HistoryRecord, Phase, ViewStatus, WorkflowState};
use time::macros::format_description;
use time::UtcOffset;

/// Pre-formatted lines for text output.
pub struct TextSummary {
    pub lines: Vec<String>,
}

/// Status line: ready, in progress with percentage, done, or failed.
pub fn status_line(state: &WorkflowState) -> String {
    match state.status() {
        ViewStatus::Ready => "Ready".to_string(),
        ViewStatus::InProgress(pct) => match state.phase {
            Phase::ExplainPending => format!("Generating explanation... {pct}%"),
            Phase::ExplainRetrying { attempt } => {
                format!("Generating explanation (attempt {attempt})... {pct}%")
            }
            _ => format!("Analyzing... {pct}%"),
        },
        ViewStatus::Success => "Done".to_string(),
        ViewStatus::Failure => "Failed".to_string(),
    }
}

/// Build the result panel for a state: success summary or failure banner.
pub fn build_text_summary(state: &WorkflowState) -> TextSummary {
    let mut lines = Vec::new();

    if state.detection_error {
        lines.push("Analysis failed: the detection service could not process this image.".into());
        lines.push("Press r (or run again) to start over.".into());
        return TextSummary { lines };
    }

    let Some(detection) = state.detection.as_ref() else {
        return TextSummary { lines };
    };

    let findings: Vec<_> = detection.findings().collect();
    match findings.first() {
        Some(primary) => {
            lines.push(format!("Fracture detected! ({} objects)", findings.len()));
            lines.push(format!("Detection #1: {}", primary.label));
            lines.push(format!("Confidence: {}%", primary.confidence_pct()));
            let b = primary.bounding_box;
            lines.push(format!(
                "Bounding box (normalized): xmin={:.3}, ymin={:.3}, xmax={:.3}, ymax={:.3}",
                b.xmin, b.ymin, b.xmax, b.ymax
            ));
        }
        None => lines.push("Analysis complete: no fracture detected.".into()),
    }

    if state.explanation_error {
        lines.push(String::new());
        lines.push(state.explanation.clone().unwrap_or_default());
    } else if state.explanation_visible {
        if let Some(text) = state.explanation.as_deref() {
            lines.push(String::new());
            lines.extend(text.lines().map(str::to_string));
        }
    }

    TextSummary { lines }
}

/// Format a record timestamp in local time when the offset is known.
pub fn format_timestamp(record: &HistoryRecord) -> String {
    let ts = match UtcOffset::current_local_offset() {
        Ok(offset) => record.timestamp.to_offset(offset),
        Err(_) => record.timestamp,
    };
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    ts.format(format)
        .unwrap_or_else(|_| record.timestamp.unix_timestamp().to_string())
}

/// One line per record for history listings.
pub fn history_line(record: &HistoryRecord) -> String {
    format!(
        "{}  {}  {}",
        format_timestamp(record),
        record.source_file_name,
        record.headline()
    )
}
