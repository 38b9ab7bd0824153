use async_trait::async_trait;
use fracture_scan::engine::{DetectionService, ExplanationRequest, ExplanationService};
use fracture_scan::error::{EndpointError, WorkflowError};
use fracture_scan::history::HistoryStore;
use fracture_scan::model::{
    BoundingBox, Detection, DetectionResult, ExplanationKind, Phase, SelectedImage,
    WorkflowConfig, WorkflowEvent, WorkflowState, EXPLANATION_FAILURE, NO_ANALYSIS_PLACEHOLDER,
};
use fracture_scan::orchestrator::{run_controller, SubmitOutcome, UiCommand, WorkflowController};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

fn finding(label: &str, confidence: f64) -> Detection {
    Detection {
        label: label.to_string(),
        confidence,
        bounding_box: BoundingBox {
            xmin: 0.1,
            ymin: 0.2,
            xmax: 0.4,
            ymax: 0.5,
        },
    }
}

fn server_error() -> EndpointError {
    EndpointError::Server {
        status: 503,
        body: "overloaded".into(),
    }
}

struct FakeDetector {
    calls: AtomicUsize,
    result: Box<dyn Fn() -> Result<DetectionResult, EndpointError> + Send + Sync>,
    gate: Option<Arc<Notify>>,
    delay: Option<Duration>,
}

impl FakeDetector {
    fn returning(detections: Vec<Detection>) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            result: Box::new(move || {
                Ok(DetectionResult {
                    detections: detections.clone(),
                })
            }),
            gate: None,
            delay: None,
        }
    }

    fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            result: Box::new(|| {
                Err(EndpointError::Server {
                    status: 500,
                    body: "model crashed".into(),
                })
            }),
            gate: None,
            delay: None,
        }
    }

    fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DetectionService for FakeDetector {
    async fn detect(&self, _image: &SelectedImage) -> Result<DetectionResult, EndpointError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.result)()
    }
}

/// Replays scripted results, then succeeds with a fixed text.
#[derive(Default)]
struct FakeExplainer {
    script: Mutex<VecDeque<Result<String, EndpointError>>>,
    calls: Mutex<Vec<(Instant, ExplanationRequest)>>,
    always_fail: bool,
    /// Attempts from this number on wait for the gate before answering.
    gate: Option<(usize, Arc<Notify>)>,
}

impl FakeExplainer {
    fn scripted(results: Vec<Result<String, EndpointError>>) -> Self {
        Self {
            script: Mutex::new(results.into()),
            ..Self::default()
        }
    }

    fn always_failing() -> Self {
        Self {
            always_fail: true,
            ..Self::default()
        }
    }

    fn gated_from(mut self, attempt: usize, gate: Arc<Notify>) -> Self {
        self.gate = Some((attempt, gate));
        self
    }

    fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|(t, _)| *t).collect()
    }
}

#[async_trait]
impl ExplanationService for FakeExplainer {
    async fn explain(&self, request: &ExplanationRequest) -> Result<String, EndpointError> {
        let attempt = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((Instant::now(), request.clone()));
            calls.len()
        };
        if let Some((from, gate)) = &self.gate {
            if attempt >= *from {
                gate.notified().await;
            }
        }
        if self.always_fail {
            return Err(server_error());
        }
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("An explanation.".into()))
    }
}

struct Harness {
    workflow: WorkflowController,
    history: HistoryStore,
    detector: Arc<FakeDetector>,
    explainer: Arc<FakeExplainer>,
    events: mpsc::UnboundedReceiver<WorkflowEvent>,
}

fn harness_with(cfg: WorkflowConfig, detector: FakeDetector, explainer: FakeExplainer) -> Harness {
    let detector = Arc::new(detector);
    let explainer = Arc::new(explainer);
    let history = HistoryStore::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let workflow = WorkflowController::new(
        cfg,
        detector.clone(),
        explainer.clone(),
        history.clone(),
        tx,
    );
    Harness {
        workflow,
        history,
        detector,
        explainer,
        events: rx,
    }
}

fn harness(detector: FakeDetector, explainer: FakeExplainer) -> Harness {
    harness_with(WorkflowConfig::default(), detector, explainer)
}

fn image() -> SelectedImage {
    SelectedImage::new("wrist.png", vec![0x89u8, 0x50, 0x4e, 0x47])
}

/// Let paused time advance until `cond` holds.
async fn wait_until(cond: impl Fn() -> bool) {
    while !cond() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn finding_is_explained_and_recorded() {
    let h = harness(
        FakeDetector::returning(vec![finding("hairline fracture", 0.87)]),
        FakeExplainer::scripted(vec![Ok("Hairline fractures are small cracks.".into())]),
    );
    h.workflow.select_file(image()).unwrap();

    let outcome = h.workflow.submit().await.unwrap();
    assert!(matches!(
        outcome,
        SubmitOutcome::Completed {
            finding: true,
            explanation_failed: false
        }
    ));

    let state = h.workflow.state();
    assert_eq!(state.phase, Phase::Complete);
    assert_eq!(state.progress, 100);
    assert!(state.explanation_visible);
    assert_eq!(
        state.explanation.as_deref(),
        Some("Hairline fractures are small cracks.")
    );

    let records = h.history.list();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].source_file_name, "wrist.png");
    assert_eq!(records[0].explanation_kind, ExplanationKind::Generated);
    assert_eq!(records[0].detections.len(), 1);

    let calls = h.explainer.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1.label, "hairline fracture");
    assert_eq!(calls[0].1.confidence_pct, "87.00");
}

#[tokio::test(start_paused = true)]
async fn sentinel_only_detection_skips_explanation() {
    let h = harness(
        FakeDetector::returning(vec![finding("Unknown", 0.91)]),
        FakeExplainer::default(),
    );
    h.workflow.select_file(image()).unwrap();

    let outcome = h.workflow.submit().await.unwrap();
    assert!(matches!(
        outcome,
        SubmitOutcome::Completed { finding: false, .. }
    ));
    assert_eq!(h.explainer.calls(), 0);

    let state = h.workflow.state();
    assert_eq!(state.phase, Phase::Complete);
    assert!(state.explanation.is_none());

    let records = h.history.list();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].explanation, NO_ANALYSIS_PLACEHOLDER);
    assert_eq!(records[0].explanation_kind, ExplanationKind::NotRequested);
}

#[tokio::test(start_paused = true)]
async fn empty_detection_list_is_a_clean_result() {
    let h = harness(FakeDetector::returning(Vec::new()), FakeExplainer::default());
    h.workflow.select_file(image()).unwrap();

    let outcome = h.workflow.submit().await.unwrap();
    assert!(matches!(
        outcome,
        SubmitOutcome::Completed { finding: false, .. }
    ));
    assert_eq!(h.explainer.calls(), 0);
    assert!(!h.history.list()[0].has_finding());
}

#[tokio::test(start_paused = true)]
async fn detection_failure_records_nothing() {
    let h = harness(FakeDetector::failing(), FakeExplainer::default());
    h.workflow.select_file(image()).unwrap();

    let outcome = h.workflow.submit().await.unwrap();
    assert!(matches!(
        outcome,
        SubmitOutcome::DetectionFailed(EndpointError::Server { status: 500, .. })
    ));

    let state = h.workflow.state();
    assert_eq!(state.phase, Phase::Failed);
    assert!(state.detection_error);
    assert!(state.detection.is_none());
    assert!(h.history.is_empty());
    assert_eq!(h.explainer.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn explanation_retries_with_doubling_backoff() {
    let h = harness(
        FakeDetector::returning(vec![finding("fracture", 0.7)]),
        FakeExplainer::scripted(vec![Err(server_error()), Err(server_error())]),
    );
    h.workflow.select_file(image()).unwrap();

    let outcome = h.workflow.submit().await.unwrap();
    assert!(matches!(
        outcome,
        SubmitOutcome::Completed {
            finding: true,
            explanation_failed: false
        }
    ));

    let times = h.explainer.call_times();
    assert_eq!(times.len(), 3);
    let first_wait = times[1] - times[0];
    let second_wait = times[2] - times[1];
    assert!(first_wait >= Duration::from_secs(1) && first_wait < Duration::from_millis(1100));
    assert!(second_wait >= Duration::from_secs(2) && second_wait < Duration::from_millis(2100));
    assert_eq!(
        h.history.list()[0].explanation_kind,
        ExplanationKind::Generated
    );
}

#[tokio::test(start_paused = true)]
async fn exhausted_explanation_keeps_detection_and_records_failure() {
    let h = harness(
        FakeDetector::returning(vec![finding("fracture", 0.7)]),
        FakeExplainer::always_failing(),
    );
    h.workflow.select_file(image()).unwrap();

    let started = Instant::now();
    let outcome = h.workflow.submit().await.unwrap();
    let elapsed = started.elapsed();

    assert!(matches!(
        outcome,
        SubmitOutcome::Completed {
            finding: true,
            explanation_failed: true
        }
    ));
    assert_eq!(h.explainer.calls(), 3);
    // Progress ramp plus 1s and 2s of backoff; no wait after the last attempt.
    assert!(elapsed >= Duration::from_secs(3));
    assert!(elapsed < Duration::from_secs(7));

    let state = h.workflow.state();
    assert_eq!(state.phase, Phase::Complete);
    assert!(state.explanation_error);
    assert!(state.detection.is_some());
    assert_eq!(state.explanation.as_deref(), Some(EXPLANATION_FAILURE));

    let records = h.history.list();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].explanation, EXPLANATION_FAILURE);
    assert_eq!(records[0].explanation_kind, ExplanationKind::Failed);
}

#[tokio::test(start_paused = true)]
async fn blank_explanation_counts_as_failed_attempt() {
    let h = harness(
        FakeDetector::returning(vec![finding("fracture", 0.7)]),
        FakeExplainer::scripted(vec![Ok("   ".into()), Ok("Real text".into())]),
    );
    h.workflow.select_file(image()).unwrap();

    h.workflow.submit().await.unwrap();
    assert_eq!(h.explainer.calls(), 2);
    assert_eq!(h.workflow.state().explanation.as_deref(), Some("Real text"));
}

#[tokio::test(start_paused = true)]
async fn submit_without_image_is_rejected() {
    let h = harness(FakeDetector::returning(Vec::new()), FakeExplainer::default());
    let err = h.workflow.submit().await.unwrap_err();
    assert_eq!(err, WorkflowError::NoFileSelected);
    assert_eq!(h.detector.calls(), 0);
    assert_eq!(h.workflow.state().phase, Phase::Idle);
}

#[tokio::test(start_paused = true)]
async fn second_submit_while_busy_is_rejected() {
    let gate = Arc::new(Notify::new());
    let h = harness(
        FakeDetector::returning(Vec::new()).gated(gate.clone()),
        FakeExplainer::default(),
    );
    h.workflow.select_file(image()).unwrap();

    let wf = h.workflow.clone();
    let first = tokio::spawn(async move { wf.submit().await });
    let detector = h.detector.clone();
    wait_until(move || detector.calls() == 1).await;

    assert_eq!(h.workflow.submit().await.unwrap_err(), WorkflowError::Busy);
    assert_eq!(
        h.workflow.select_file(image()).unwrap_err(),
        WorkflowError::Busy
    );

    gate.notify_one();
    let outcome = first.await.unwrap().unwrap();
    assert!(matches!(outcome, SubmitOutcome::Completed { .. }));
    assert_eq!(h.detector.calls(), 1);
    assert_eq!(h.history.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn reset_during_detection_discards_late_result() {
    let gate = Arc::new(Notify::new());
    let h = harness(
        FakeDetector::returning(vec![finding("fracture", 0.9)]).gated(gate.clone()),
        FakeExplainer::default(),
    );
    h.workflow.select_file(image()).unwrap();

    let wf = h.workflow.clone();
    let task = tokio::spawn(async move { wf.submit().await });
    let detector = h.detector.clone();
    wait_until(move || detector.calls() == 1).await;

    h.workflow.reset();
    gate.notify_one();

    let outcome = task.await.unwrap().unwrap();
    assert!(matches!(outcome, SubmitOutcome::Abandoned));
    assert_eq!(h.workflow.state(), WorkflowState::default());
    assert!(h.history.is_empty());
    assert_eq!(h.explainer.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn reset_during_backoff_stops_retries() {
    let h = harness(
        FakeDetector::returning(vec![finding("fracture", 0.9)]),
        FakeExplainer::always_failing(),
    );
    h.workflow.select_file(image()).unwrap();

    let wf = h.workflow.clone();
    let task = tokio::spawn(async move { wf.submit().await });
    let explainer = h.explainer.clone();
    wait_until(move || explainer.calls() == 1).await;

    h.workflow.reset();
    let outcome = task.await.unwrap().unwrap();
    assert!(matches!(outcome, SubmitOutcome::Abandoned));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.explainer.calls(), 1);
    assert!(h.history.is_empty());
    assert_eq!(h.workflow.state().phase, Phase::Idle);
}

#[tokio::test(start_paused = true)]
async fn reset_during_retry_discards_the_late_explanation() {
    let gate = Arc::new(Notify::new());
    let h = harness(
        FakeDetector::returning(vec![finding("fracture", 0.9)]),
        FakeExplainer::scripted(vec![Err(server_error()), Ok("Too late.".into())])
            .gated_from(2, gate.clone()),
    );
    h.workflow.select_file(image()).unwrap();

    let wf = h.workflow.clone();
    let task = tokio::spawn(async move { wf.submit().await });
    let explainer = h.explainer.clone();
    wait_until(move || explainer.calls() == 2).await;

    h.workflow.reset();
    gate.notify_one();
    let outcome = task.await.unwrap().unwrap();
    assert!(matches!(outcome, SubmitOutcome::Abandoned));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.explainer.calls(), 2);
    assert!(h.history.is_empty());
    assert_eq!(h.workflow.state(), WorkflowState::default());
}

#[tokio::test(start_paused = true)]
async fn toggle_never_calls_the_explanation_service() {
    let h = harness(
        FakeDetector::returning(vec![finding("fracture", 0.9)]),
        FakeExplainer::default(),
    );
    assert_eq!(
        h.workflow.toggle_explanation().unwrap_err(),
        WorkflowError::NoExplanation
    );

    h.workflow.select_file(image()).unwrap();
    h.workflow.submit().await.unwrap();
    assert_eq!(h.explainer.calls(), 1);

    assert!(!h.workflow.toggle_explanation().unwrap());
    assert!(!h.workflow.state().explanation_visible);
    assert!(h.workflow.toggle_explanation().unwrap());
    assert_eq!(h.explainer.calls(), 1);
    assert_eq!(h.history.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn slow_detection_times_out() {
    let cfg = WorkflowConfig {
        request_timeout: Duration::from_secs(5),
        ..WorkflowConfig::default()
    };
    let h = harness_with(
        cfg,
        FakeDetector::returning(Vec::new()).delayed(Duration::from_secs(60)),
        FakeExplainer::default(),
    );
    h.workflow.select_file(image()).unwrap();

    let outcome = h.workflow.submit().await.unwrap();
    assert!(matches!(
        outcome,
        SubmitOutcome::DetectionFailed(EndpointError::Timeout(_))
    ));
    assert_eq!(h.workflow.state().phase, Phase::Failed);
    assert!(h.history.is_empty());
}

#[tokio::test(start_paused = true)]
async fn progress_never_moves_backwards() {
    let mut h = harness(
        FakeDetector::returning(vec![finding("fracture", 0.9)]),
        FakeExplainer::scripted(vec![Err(server_error())]),
    );
    h.workflow.select_file(image()).unwrap();
    h.workflow.submit().await.unwrap();

    let mut progress = Vec::new();
    let mut appended = 0;
    while let Ok(ev) = h.events.try_recv() {
        match ev {
            WorkflowEvent::Snapshot(s) if s.phase != Phase::Idle => progress.push(s.progress),
            WorkflowEvent::HistoryAppended { .. } => appended += 1,
            _ => {}
        }
    }
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(progress.last(), Some(&100));
    assert!(progress.contains(&80));
    assert_eq!(appended, 1);
}

#[tokio::test(start_paused = true)]
async fn resubmitting_after_completion_adds_a_record() {
    let h = harness(
        FakeDetector::returning(vec![finding("fracture", 0.9)]),
        FakeExplainer::default(),
    );
    h.workflow.select_file(image()).unwrap();
    h.workflow.submit().await.unwrap();
    h.workflow.submit().await.unwrap();

    assert_eq!(h.detector.calls(), 2);
    let records = h.history.list();
    assert_eq!(records.len(), 2);
    assert!(records[0].timestamp >= records[1].timestamp);
    assert_ne!(records[0].id, records[1].id);
}

#[tokio::test(start_paused = true)]
async fn select_then_reset_restores_initial_state() {
    let h = harness(FakeDetector::returning(Vec::new()), FakeExplainer::default());
    let initial = h.workflow.state();

    h.workflow.select_file(image()).unwrap();
    assert_eq!(
        h.workflow.state().selected.map(|f| f.name),
        Some("wrist.png".to_string())
    );
    h.workflow.reset();

    assert_eq!(h.workflow.state(), initial);
    assert_eq!(
        h.workflow.submit().await.unwrap_err(),
        WorkflowError::NoFileSelected
    );
    assert_eq!(h.detector.calls(), 0);
}

#[tokio::test]
async fn command_loop_selects_submits_and_quits() {
    let cfg = WorkflowConfig {
        progress_tick: Duration::from_millis(1),
        ..WorkflowConfig::default()
    };
    let h = harness_with(
        cfg,
        FakeDetector::returning(vec![finding("fracture", 0.9)]),
        FakeExplainer::default(),
    );
    let mut events = h.events;

    let path = std::env::temp_dir().join(format!("fracture-scan-{}.png", std::process::id()));
    tokio::fs::write(&path, b"png").await.unwrap();

    let (ui_tx, ui_rx) = mpsc::unbounded_channel();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let controller = tokio::spawn(run_controller(h.workflow.clone(), ui_tx, cmd_rx));

    cmd_tx.send(UiCommand::SelectFile(path.clone())).unwrap();
    cmd_tx.send(UiCommand::Submit).unwrap();

    loop {
        match events.recv().await {
            Some(WorkflowEvent::HistoryAppended { .. }) => break,
            Some(_) => {}
            None => panic!("controller dropped its event channel"),
        }
    }

    cmd_tx.send(UiCommand::Quit).unwrap();
    controller.await.unwrap().unwrap();
    let _ = tokio::fs::remove_file(&path).await;

    let records = h.history.list();
    assert_eq!(records.len(), 1);
    assert!(records[0].source_file_name.starts_with("fracture-scan-"));
    drop(ui_rx);
}
