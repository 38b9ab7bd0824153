//! Command loop between presentation layers and the workflow controller.
//!
//! Owns the submission task lifecycle and reports outcomes as info events.

use super::workflow::{SubmitOutcome, WorkflowController};
use crate::error::WorkflowError;
use crate::model::{InfoEvent, SelectedImage, WorkflowEvent};
use anyhow::Result;
use std::path::PathBuf;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

/// Commands emitted by UI layers to drive the workflow.
#[derive(Debug, Clone)]
pub enum UiCommand {
    SelectFile(PathBuf),
    Submit,
    Reset,
    ToggleExplanation,
    Quit,
}

type SubmitTask = JoinHandle<Result<SubmitOutcome, WorkflowError>>;

/// Human-readable summary of how a submission ended.
pub fn describe_outcome(outcome: &SubmitOutcome) -> String {
    match outcome {
        SubmitOutcome::Completed { finding: false, .. } => {
            "Analysis complete: no finding detected.".into()
        }
        SubmitOutcome::Completed {
            finding: true,
            explanation_failed: false,
        } => "Analysis complete: finding detected, explanation ready.".into(),
        SubmitOutcome::Completed {
            finding: true,
            explanation_failed: true,
        } => "Analysis complete: finding detected, explanation unavailable.".into(),
        SubmitOutcome::DetectionFailed(_) => {
            "Analysis failed. Press r to start over.".into()
        }
        SubmitOutcome::Abandoned => "Analysis cancelled.".into(),
    }
}

fn info(event_tx: &UnboundedSender<WorkflowEvent>, msg: impl Into<String>) {
    let _ = event_tx.send(WorkflowEvent::Info(InfoEvent::Message(msg.into())));
}

/// Drive the workflow from UI commands until `Quit` or the command channel closes.
pub async fn run_controller(
    workflow: WorkflowController,
    event_tx: UnboundedSender<WorkflowEvent>,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
) -> Result<()> {
    let mut task: Option<SubmitTask> = None;
    let mut quit_pending = false;

    let res = loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(UiCommand::SelectFile(path)) => {
                        match SelectedImage::read_from(&path).await {
                            Ok(image) => {
                                let name = image.file_name.clone();
                                match workflow.select_file(image) {
                                    Ok(()) => info(&event_tx, format!("Selected {name}. Press Enter to analyze.")),
                                    Err(e) => info(&event_tx, format!("Cannot select a new image: {e}")),
                                }
                            }
                            Err(e) => info(&event_tx, format!("Could not read {}: {e}", path.display())),
                        }
                    }
                    Some(UiCommand::Submit) => {
                        if task.is_some() {
                            info(&event_tx, "An analysis is already in progress.");
                        } else {
                            let wf = workflow.clone();
                            task = Some(tokio::spawn(async move { wf.submit().await }));
                        }
                    }
                    Some(UiCommand::Reset) => {
                        // An in-flight submission observes the reset and resolves as abandoned.
                        workflow.reset();
                    }
                    Some(UiCommand::ToggleExplanation) => {
                        if let Err(e) = workflow.toggle_explanation() {
                            info(&event_tx, e.to_string());
                        }
                    }
                    Some(UiCommand::Quit) | None => {
                        quit_pending = true;
                        if task.is_some() {
                            workflow.reset();
                        } else {
                            break Ok(());
                        }
                    }
                }
            }
            // Do not take the JoinHandle before this branch wins; otherwise it can be dropped
            // if another select branch is chosen, and we'll never observe completion.
            maybe_done = async {
                if let Some(h) = task.as_mut() {
                    return Some(h.await);
                }
                futures::future::pending().await
            } => {
                if let Some(join_res) = maybe_done {
                    task = None;
                    match join_res {
                        Ok(Ok(outcome)) => info(&event_tx, describe_outcome(&outcome)),
                        Ok(Err(WorkflowError::NoFileSelected)) => {
                            info(&event_tx, "Select an image first (press o).")
                        }
                        Ok(Err(e)) => info(&event_tx, format!("Submit rejected: {e}")),
                        Err(e) => info(&event_tx, format!("Analysis task failed: {e}")),
                    }
                    if quit_pending {
                        break Ok(());
                    }
                }
            }
        }
    };

    res
}
