pub mod cli;
pub mod engine;
pub mod error;
pub mod history;
pub mod model;
pub mod orchestrator;
pub mod text_summary;
#[cfg(feature = "tui")]
pub mod tui;
