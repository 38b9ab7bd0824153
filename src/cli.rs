use crate::engine;
use crate::history::{self, HistoryStore};
use crate::model::{
    RetryPolicy, SelectedImage, WorkflowConfig, WorkflowEvent, DEFAULT_EXPLAIN_MODEL,
};
use crate::orchestrator::{SubmitOutcome, WorkflowController};
use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "fracture-scan",
    version,
    about = "X-ray fracture detection with plain-language explanations, with optional TUI"
)]
pub struct Cli {
    /// X-ray image to analyze (required with --json/--text, preselected in the TUI)
    pub image: Option<PathBuf>,

    /// Base URL of the detection inference server
    #[arg(
        long,
        env = "FRACTURE_SCAN_DETECT_URL",
        default_value = "http://127.0.0.1:5000"
    )]
    pub detect_url: String,

    /// Base URL of the explanation (generateContent) service
    #[arg(
        long,
        env = "FRACTURE_SCAN_EXPLAIN_URL",
        default_value = "https://generativelanguage.googleapis.com"
    )]
    pub explain_url: String,

    /// Model used for explanations
    #[arg(
        long,
        env = "FRACTURE_SCAN_EXPLAIN_MODEL",
        default_value = DEFAULT_EXPLAIN_MODEL
    )]
    pub explain_model: String,

    /// API key for the explanation service
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Maximum explanation attempts before giving up
    #[arg(long, default_value_t = 3)]
    pub explain_attempts: u32,

    /// Wait after the first failed explanation attempt; doubles after each failure
    #[arg(long, default_value = "1s")]
    pub backoff_base: humantime::Duration,

    /// Upper bound for a single request to either service
    #[arg(long, default_value = "30s")]
    pub request_timeout: humantime::Duration,

    /// Delay between progress steps while preparing the upload
    #[arg(long, default_value = "100ms")]
    pub progress_tick: humantime::Duration,

    /// Print the history record as JSON and exit (no TUI)
    #[arg(long)]
    pub json: bool,

    /// Print a text summary and exit (no TUI)
    #[arg(long)]
    pub text: bool,

    /// Run silently: suppress all output except errors (for scripting)
    #[arg(long)]
    pub silent: bool,

    /// Export the completed record as JSON
    #[arg(long)]
    pub export_json: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug); RUST_LOG takes precedence
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

pub async fn run(args: Cli) -> Result<()> {
    // Validate that --silent can only be used with --json
    if args.silent && !args.json {
        return Err(anyhow::anyhow!(
            "--silent can only be used with --json. Use --silent --json together."
        ));
    }

    if !args.json && !args.text {
        #[cfg(feature = "tui")]
        {
            return crate::tui::run(args).await;
        }
        #[cfg(not(feature = "tui"))]
        {
            // Fallback when built without TUI support.
            init_tracing(args.verbose);
            return run_text(args).await;
        }
    }

    init_tracing(args.verbose);
    if args.json {
        return run_json(args).await;
    }

    run_text(args).await
}

/// Install the stderr log subscriber for the non-TUI modes.
fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

/// Build a `WorkflowConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> WorkflowConfig {
    WorkflowConfig {
        detect_base_url: args.detect_url.clone(),
        explain_base_url: args.explain_url.clone(),
        explain_model: args.explain_model.clone(),
        api_key: args.api_key.clone().filter(|k| !k.trim().is_empty()),
        user_agent: format!("fracture-scan/{}", env!("CARGO_PKG_VERSION")),
        retry: RetryPolicy {
            max_attempts: args.explain_attempts.max(1),
            backoff_base: Duration::from(args.backoff_base),
        },
        request_timeout: Duration::from(args.request_timeout),
        progress_tick: Duration::from(args.progress_tick),
    }
}

/// Build a controller wired to the HTTP services.
pub fn build_controller(
    args: &Cli,
    history: HistoryStore,
    event_tx: mpsc::UnboundedSender<WorkflowEvent>,
) -> Result<WorkflowController> {
    let cfg = build_config(args);
    let (detector, explainer) = engine::http_services(&cfg)?;
    Ok(WorkflowController::new(cfg, detector, explainer, history, event_tx))
}

async fn load_image(args: &Cli) -> Result<SelectedImage> {
    let path = args
        .image
        .as_deref()
        .context("an image path is required with --json/--text")?;
    SelectedImage::read_from(path)
        .await
        .with_context(|| format!("read image {}", path.display()))
}

/// Run a single submission, forwarding events to `on_event`.
async fn run_single<F>(args: &Cli, history: &HistoryStore, mut on_event: F) -> Result<()>
where
    F: FnMut(WorkflowEvent),
{
    let image = load_image(args).await?;
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<WorkflowEvent>();
    let workflow = build_controller(args, history.clone(), evt_tx)?;
    workflow.select_file(image)?;

    let wf = workflow.clone();
    let mut handle = tokio::spawn(async move { wf.submit().await });
    // The controller keeps a sender alive; stop on the task instead of channel close.
    let outcome = loop {
        tokio::select! {
            Some(ev) = evt_rx.recv() => on_event(ev),
            res = &mut handle => break res.context("analysis task failed")??,
        }
    };
    while let Ok(ev) = evt_rx.try_recv() {
        on_event(ev);
    }

    match outcome {
        SubmitOutcome::Completed { .. } => Ok(()),
        SubmitOutcome::DetectionFailed(e) => Err(e).context("detection failed"),
        SubmitOutcome::Abandoned => Err(anyhow::anyhow!("analysis was cancelled")),
    }
}

async fn run_json(args: Cli) -> Result<()> {
    let history = HistoryStore::new();
    run_single(&args, &history, |_| {}).await?;

    handle_exports(&args, &history)?;
    let record = history
        .list()
        .into_iter()
        .next()
        .context("analysis finished without a history record")?;

    if !args.silent {
        let (out_tx, out_handle) = spawn_output_writer();
        let out = serde_json::to_string_pretty(record.as_ref())?;
        let _ = out_tx.send(OutputLine::Stdout(out));
        drop(out_tx);
        let _ = out_handle.await;
    }
    Ok(())
}

async fn run_text(args: Cli) -> Result<()> {
    let history = HistoryStore::new();
    let (out_tx, out_handle) = spawn_output_writer();
    let mut last_status = String::new();
    let mut last_state = None;

    let res = run_single(&args, &history, |ev| match ev {
        WorkflowEvent::Snapshot(state) => {
            let status = crate::text_summary::status_line(&state);
            if status != last_status {
                let _ = out_tx.send(OutputLine::Stderr(status.clone()));
                last_status = status;
            }
            last_state = Some(*state);
        }
        WorkflowEvent::Info(info) => {
            let _ = out_tx.send(OutputLine::Stderr(info.to_message()));
        }
        WorkflowEvent::HistoryAppended { .. } => {}
    })
    .await;

    if let Some(state) = last_state.as_ref() {
        for line in crate::text_summary::build_text_summary(state).lines {
            let _ = out_tx.send(OutputLine::Stdout(line));
        }
    }
    if res.is_ok() {
        if let Some(record) = history.list().first() {
            let line = crate::text_summary::history_line(record);
            let _ = out_tx.send(OutputLine::Stderr(format!("Recorded: {line}")));
        }
        if let Err(e) = handle_exports(&args, &history) {
            let _ = out_tx.send(OutputLine::Stderr(format!("{e:#}")));
        }
    }

    drop(out_tx);
    let _ = out_handle.await;
    res
}

/// Handle export operations for both text and JSON modes.
fn handle_exports(args: &Cli, history: &HistoryStore) -> Result<()> {
    if let Some(p) = args.export_json.as_deref() {
        history::export_json(p, &history.list())?;
    }
    Ok(())
}
