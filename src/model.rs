use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use time::OffsetDateTime;

/// Label the detection server uses for boxes it could not classify.
pub const SENTINEL_LABEL: &str = "Unknown";

/// Explanation stored when detection found nothing to explain.
pub const NO_ANALYSIS_PLACEHOLDER: &str = "No detailed analysis requested (no finding detected).";

/// Model asked for explanations unless configured otherwise.
pub const DEFAULT_EXPLAIN_MODEL: &str = "gemini-2.5-flash-preview-09-2025";

/// Explanation stored when every explanation attempt failed.
pub const EXPLANATION_FAILURE: &str = "Failed to generate detailed analysis due to an API error.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub detect_base_url: String,
    pub explain_base_url: String,
    pub explain_model: String,
    #[serde(skip)]
    pub api_key: Option<String>,
    pub user_agent: String,
    pub retry: RetryPolicy,
    /// Upper bound for any single endpoint attempt.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Delay between cosmetic progress steps while preparing the upload.
    #[serde(with = "humantime_serde")]
    pub progress_tick: Duration,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            detect_base_url: "http://127.0.0.1:5000".into(),
            explain_base_url: "https://generativelanguage.googleapis.com".into(),
            explain_model: DEFAULT_EXPLAIN_MODEL.into(),
            api_key: None,
            user_agent: format!("fracture-scan/{}", env!("CARGO_PKG_VERSION")),
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(30),
            progress_tick: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Wait after the failed attempt with 0-based index `failed_attempt`: `base * 2^i`.
    pub fn backoff_delay(&self, failed_attempt: u32) -> Duration {
        self.backoff_base.saturating_mul(1u32 << failed_attempt.min(16))
    }
}

/// Normalized box corners, all in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub confidence: f64,
    pub bounding_box: BoundingBox,
}

impl Detection {
    /// A finding is any detection with a real label.
    pub fn is_finding(&self) -> bool {
        let label = self.label.trim();
        !label.is_empty() && !label.eq_ignore_ascii_case(SENTINEL_LABEL)
    }

    pub fn confidence_pct(&self) -> String {
        format!("{:.2}", self.confidence * 100.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    /// Server rank order; the first entry is the primary detection.
    pub detections: Vec<Detection>,
}

impl DetectionResult {
    pub fn findings(&self) -> impl Iterator<Item = &Detection> {
        self.detections.iter().filter(|d| d.is_finding())
    }

    pub fn has_finding(&self) -> bool {
        self.findings().next().is_some()
    }

    pub fn primary_finding(&self) -> Option<&Detection> {
        self.findings().next()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExplanationKind {
    Generated,
    NotRequested,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub source_file_name: String,
    pub detections: Vec<Detection>,
    pub explanation: String,
    pub explanation_kind: ExplanationKind,
}

impl HistoryRecord {
    pub fn has_finding(&self) -> bool {
        self.detections.iter().any(Detection::is_finding)
    }

    /// Short label for list views: the primary finding or "Clean".
    pub fn headline(&self) -> String {
        match self.detections.iter().find(|d| d.is_finding()) {
            Some(d) => format!("Detected: {}", d.label),
            None => "Clean".to_string(),
        }
    }
}

/// An image picked by the user. The bytes stay inside the controller.
#[derive(Debug, Clone)]
pub struct SelectedImage {
    pub file_name: String,
    pub mime_type: &'static str,
    pub bytes: Bytes,
}

impl SelectedImage {
    pub fn new(file_name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        let file_name = file_name.into();
        let mime_type = mime_type_for(&file_name);
        Self {
            file_name,
            mime_type,
            bytes: bytes.into(),
        }
    }

    pub async fn read_from(path: &Path) -> std::io::Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown_file")
            .to_string();
        Ok(Self::new(file_name, bytes))
    }

    pub fn summary(&self) -> FileSummary {
        FileSummary {
            name: self.file_name.clone(),
            size_bytes: self.bytes.len() as u64,
        }
    }
}

fn mime_type_for(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "bmp" => "image/bmp",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "tif" | "tiff" => "image/tiff",
        "dcm" => "application/dicom",
        _ => "image/jpeg",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSummary {
    pub name: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    Submitting,
    Detecting,
    NoFinding,
    ExplainPending,
    /// Waiting for or running attempt `attempt` (1-based) after a failure.
    ExplainRetrying {
        attempt: u32,
    },
    Complete,
    Failed,
}

impl Phase {
    /// A submission is in flight and owns the state.
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            Phase::Submitting
                | Phase::Detecting
                | Phase::NoFinding
                | Phase::ExplainPending
                | Phase::ExplainRetrying { .. }
        )
    }
}

/// What a view shows at any moment; exactly one applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewStatus {
    Ready,
    InProgress(u8),
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub phase: Phase,
    pub selected: Option<FileSummary>,
    pub detection: Option<DetectionResult>,
    pub explanation: Option<String>,
    pub explanation_visible: bool,
    pub progress: u8,
    pub detection_error: bool,
    pub explanation_error: bool,
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            selected: None,
            detection: None,
            explanation: None,
            explanation_visible: false,
            progress: 0,
            detection_error: false,
            explanation_error: false,
        }
    }
}

impl WorkflowState {
    pub fn status(&self) -> ViewStatus {
        match self.phase {
            Phase::Idle => ViewStatus::Ready,
            Phase::Complete => ViewStatus::Success,
            Phase::Failed => ViewStatus::Failure,
            _ => ViewStatus::InProgress(self.progress),
        }
    }

    /// Explanation stage still running for a detection that found something.
    pub fn explanation_loading(&self) -> bool {
        matches!(
            self.phase,
            Phase::ExplainPending | Phase::ExplainRetrying { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    Snapshot(Box<WorkflowState>),
    Info(InfoEvent),
    HistoryAppended { id: String },
}

/// Structured info events emitted by the controller and consumed by UI/CLI layers.
#[derive(Debug, Clone)]
pub enum InfoEvent {
    Message(String),
    ExplanationAttemptFailed {
        attempt: u32,
        max_attempts: u32,
        error: String,
    },
    RetryScheduled {
        next_attempt: u32,
        delay: Duration,
    },
}

impl InfoEvent {
    /// Render a human-readable message for UI/CLI layers.
    pub fn to_message(&self) -> String {
        match self {
            InfoEvent::Message(msg) => msg.clone(),
            InfoEvent::ExplanationAttemptFailed {
                attempt,
                max_attempts,
                error,
            } => format!("Explanation attempt {attempt}/{max_attempts} failed: {error}"),
            InfoEvent::RetryScheduled {
                next_attempt,
                delay,
            } => format!(
                "Retrying explanation (attempt {next_attempt}) in {}",
                humantime::format_duration(*delay)
            ),
        }
    }
}
