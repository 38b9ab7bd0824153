//! Upload-analyze-retry-persist state machine.
//!
//! The controller owns the single [`WorkflowState`] and replaces it wholesale on
//! every transition, publishing each new state as a [`WorkflowEvent::Snapshot`].
//! In-flight submissions are tied to a generation number; `reset`, `select_file`
//! and a new `submit` bump it, and any result produced under an older generation
//! is dropped without touching state or history.

use super::post_process::build_record;
use crate::engine::{DetectionService, ExplanationRequest, ExplanationService};
use crate::error::{EndpointError, WorkflowError};
use crate::history::HistoryStore;
use crate::model::{
    DetectionResult, ExplanationKind, InfoEvent, Phase, SelectedImage, WorkflowConfig,
    WorkflowEvent, WorkflowState, EXPLANATION_FAILURE, NO_ANALYSIS_PLACEHOLDER,
};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc::UnboundedSender, watch};
use tracing::{debug, info, warn};

const PROGRESS_STEP: u8 = 10;
/// Cosmetic progress reached before the detection request goes out.
const PROGRESS_CEILING: u8 = 80;

/// How a submission ended.
#[derive(Debug)]
pub enum SubmitOutcome {
    Completed {
        finding: bool,
        explanation_failed: bool,
    },
    DetectionFailed(EndpointError),
    /// Superseded by `reset` or a newer submission; nothing was applied.
    Abandoned,
}

struct Inner {
    state: WorkflowState,
    image: Option<SelectedImage>,
    generation: u64,
}

/// The submission's generation is no longer current.
struct Superseded;

#[derive(Clone)]
pub struct WorkflowController {
    cfg: Arc<WorkflowConfig>,
    detector: Arc<dyn DetectionService>,
    explainer: Arc<dyn ExplanationService>,
    history: HistoryStore,
    inner: Arc<Mutex<Inner>>,
    generation_tx: Arc<watch::Sender<u64>>,
    event_tx: UnboundedSender<WorkflowEvent>,
}

impl WorkflowController {
    pub fn new(
        cfg: WorkflowConfig,
        detector: Arc<dyn DetectionService>,
        explainer: Arc<dyn ExplanationService>,
        history: HistoryStore,
        event_tx: UnboundedSender<WorkflowEvent>,
    ) -> Self {
        let (generation_tx, _) = watch::channel(0u64);
        Self {
            cfg: Arc::new(cfg),
            detector,
            explainer,
            history,
            inner: Arc::new(Mutex::new(Inner {
                state: WorkflowState::default(),
                image: None,
                generation: 0,
            })),
            generation_tx: Arc::new(generation_tx),
            event_tx,
        }
    }

    /// Current state snapshot.
    pub fn state(&self) -> WorkflowState {
        self.lock().state.clone()
    }

    /// Hold `image` for the next submission, clearing any previous outcome.
    ///
    /// Rejected while a submission is in flight.
    pub fn select_file(&self, image: SelectedImage) -> Result<(), WorkflowError> {
        let mut inner = self.lock();
        if inner.state.phase.is_busy() {
            return Err(WorkflowError::Busy);
        }
        self.bump_generation(&mut inner);
        debug!(file = %image.file_name, bytes = image.bytes.len(), "image selected");
        let next = WorkflowState {
            selected: Some(image.summary()),
            ..WorkflowState::default()
        };
        // Replacing the option drops the previously held bytes.
        inner.image = Some(image);
        self.publish(&mut inner, next);
        Ok(())
    }

    /// Return to `Idle` from any phase, releasing the image and abandoning in-flight work.
    pub fn reset(&self) {
        let mut inner = self.lock();
        let from = inner.state.phase;
        self.bump_generation(&mut inner);
        inner.image = None;
        self.publish(&mut inner, WorkflowState::default());
        debug!(from = ?from, "workflow reset");
    }

    /// Show or hide the current explanation. Never issues a request.
    pub fn toggle_explanation(&self) -> Result<bool, WorkflowError> {
        let mut inner = self.lock();
        if inner.state.explanation.is_none() {
            return Err(WorkflowError::NoExplanation);
        }
        let mut next = inner.state.clone();
        next.explanation_visible = !next.explanation_visible;
        let visible = next.explanation_visible;
        self.publish(&mut inner, next);
        Ok(visible)
    }

    /// Run detection and, when something was found, the explanation stage.
    ///
    /// Resolves once the submission completes, fails, or is abandoned by a
    /// concurrent `reset`. Returns an error without touching state when no
    /// image is held or another submission is running.
    pub async fn submit(&self) -> Result<SubmitOutcome, WorkflowError> {
        let (generation, image, mut superseded) = {
            let mut inner = self.lock();
            if inner.state.phase.is_busy() {
                return Err(WorkflowError::Busy);
            }
            let image = inner.image.clone().ok_or(WorkflowError::NoFileSelected)?;
            let generation = self.bump_generation(&mut inner);
            let superseded = self.generation_tx.subscribe();
            let next = WorkflowState {
                phase: Phase::Submitting,
                selected: inner.state.selected.clone(),
                ..WorkflowState::default()
            };
            self.publish(&mut inner, next);
            (generation, image, superseded)
        };

        let outcome = tokio::select! {
            biased;
            _ = wait_superseded(&mut superseded) => Err(Superseded),
            res = self.run_submission(generation, &image) => res,
        };

        match outcome {
            Ok(outcome) => Ok(outcome),
            Err(Superseded) => {
                debug!(generation, "submission superseded; discarding its results");
                Ok(SubmitOutcome::Abandoned)
            }
        }
    }

    async fn run_submission(
        &self,
        generation: u64,
        image: &SelectedImage,
    ) -> Result<SubmitOutcome, Superseded> {
        // No real upload progress is available from the transport.
        for pct in (PROGRESS_STEP..=PROGRESS_CEILING).step_by(PROGRESS_STEP as usize) {
            tokio::time::sleep(self.cfg.progress_tick).await;
            self.apply(generation, |s| s.progress = pct)?;
        }
        self.apply(generation, |s| s.phase = Phase::Detecting)?;

        let detection = match self.bounded(self.detector.detect(image)).await {
            Ok(detection) => detection,
            Err(e) => {
                self.apply(generation, |s| {
                    s.phase = Phase::Failed;
                    s.detection_error = true;
                    s.progress = 100;
                })?;
                warn!(file = %image.file_name, error = %e, "detection failed");
                self.send_info(InfoEvent::Message(format!("Detection failed: {e}")));
                return Ok(SubmitOutcome::DetectionFailed(e));
            }
        };

        let request = detection
            .primary_finding()
            .map(ExplanationRequest::for_finding);
        self.apply(generation, |s| {
            s.detection = Some(detection.clone());
            s.progress = 100;
        })?;

        let Some(request) = request else {
            self.apply(generation, |s| s.phase = Phase::NoFinding)?;
            self.finish(
                generation,
                &image.file_name,
                &detection,
                NO_ANALYSIS_PLACEHOLDER,
                ExplanationKind::NotRequested,
            )?;
            return Ok(SubmitOutcome::Completed {
                finding: false,
                explanation_failed: false,
            });
        };

        self.apply(generation, |s| s.phase = Phase::ExplainPending)?;
        let max_attempts = self.cfg.retry.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            let err = match self.bounded(self.explainer.explain(&request)).await {
                Ok(text) if !text.trim().is_empty() => {
                    self.finish(
                        generation,
                        &image.file_name,
                        &detection,
                        &text,
                        ExplanationKind::Generated,
                    )?;
                    return Ok(SubmitOutcome::Completed {
                        finding: true,
                        explanation_failed: false,
                    });
                }
                Ok(_) => EndpointError::EmptyResponse("explanation text"),
                Err(e) => e,
            };

            self.ensure_current(generation)?;
            warn!(attempt, max_attempts, error = %err, "explanation attempt failed");
            self.send_info(InfoEvent::ExplanationAttemptFailed {
                attempt,
                max_attempts,
                error: err.to_string(),
            });

            if attempt < max_attempts {
                let delay = self.cfg.retry.backoff_delay(attempt - 1);
                self.apply(generation, |s| {
                    s.phase = Phase::ExplainRetrying {
                        attempt: attempt + 1,
                    }
                })?;
                self.send_info(InfoEvent::RetryScheduled {
                    next_attempt: attempt + 1,
                    delay,
                });
                tokio::time::sleep(delay).await;
            }
        }

        self.finish(
            generation,
            &image.file_name,
            &detection,
            EXPLANATION_FAILURE,
            ExplanationKind::Failed,
        )?;
        Ok(SubmitOutcome::Completed {
            finding: true,
            explanation_failed: true,
        })
    }

    /// Append the history record and move to `Complete`, atomically with the
    /// generation check.
    fn finish(
        &self,
        generation: u64,
        file_name: &str,
        detection: &DetectionResult,
        explanation: &str,
        kind: ExplanationKind,
    ) -> Result<(), Superseded> {
        let mut inner = self.lock();
        if inner.generation != generation {
            return Err(Superseded);
        }

        let record = build_record(file_name, detection, explanation, kind);
        let id = record.id.clone();
        self.history.append(record);

        let mut next = inner.state.clone();
        next.phase = Phase::Complete;
        next.progress = 100;
        match kind {
            ExplanationKind::Generated => {
                next.explanation = Some(explanation.to_string());
                next.explanation_visible = true;
            }
            ExplanationKind::Failed => {
                next.explanation = Some(explanation.to_string());
                next.explanation_visible = true;
                next.explanation_error = true;
            }
            ExplanationKind::NotRequested => {}
        }
        self.publish(&mut inner, next);
        drop(inner);

        info!(id = %id, file = %file_name, kind = ?kind, "analysis recorded");
        let _ = self.event_tx.send(WorkflowEvent::HistoryAppended { id });
        Ok(())
    }

    fn apply(
        &self,
        generation: u64,
        update: impl FnOnce(&mut WorkflowState),
    ) -> Result<(), Superseded> {
        let mut inner = self.lock();
        if inner.generation != generation {
            return Err(Superseded);
        }
        let mut next = inner.state.clone();
        update(&mut next);
        self.publish(&mut inner, next);
        Ok(())
    }

    fn ensure_current(&self, generation: u64) -> Result<(), Superseded> {
        if self.lock().generation == generation {
            Ok(())
        } else {
            Err(Superseded)
        }
    }

    /// Bound a single endpoint attempt by the configured request timeout.
    async fn bounded<T>(
        &self,
        attempt: impl Future<Output = Result<T, EndpointError>>,
    ) -> Result<T, EndpointError> {
        let limit = self.cfg.request_timeout;
        tokio::time::timeout(limit, attempt)
            .await
            .unwrap_or_else(|_| Err(EndpointError::Timeout(limit)))
    }

    fn publish(&self, inner: &mut Inner, next: WorkflowState) {
        inner.state = next.clone();
        let _ = self.event_tx.send(WorkflowEvent::Snapshot(Box::new(next)));
    }

    fn bump_generation(&self, inner: &mut Inner) -> u64 {
        inner.generation += 1;
        self.generation_tx.send_replace(inner.generation);
        inner.generation
    }

    fn send_info(&self, info: InfoEvent) {
        let _ = self.event_tx.send(WorkflowEvent::Info(info));
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Resolves when the generation moves past the one the receiver last saw.
async fn wait_superseded(rx: &mut watch::Receiver<u64>) {
    if rx.changed().await.is_err() {
        futures::future::pending::<()>().await;
    }
}
