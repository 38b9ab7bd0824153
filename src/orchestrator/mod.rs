//! Application-level orchestration.
//!
//! This module owns the analysis workflow state machine, the command loop that
//! UI layers drive it through, and post-submission processing such as record
//! creation and export. UI/CLI layers call into this module to keep
//! responsibilities separated.

mod controller;
mod post_process;
mod workflow;

pub use controller::{describe_outcome, run_controller, UiCommand};
pub use post_process::export_latest;
pub use workflow::{SubmitOutcome, WorkflowController};
