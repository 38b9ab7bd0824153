mod export;
mod help;
mod state;

use crate::cli::Cli;
use crate::history::HistoryStore;
use crate::model::{ViewStatus, WorkflowEvent};
use crate::orchestrator::{self, UiCommand};
use crate::text_summary;
use anyhow::{Context, Result};
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use export::{copy_to_clipboard, export_record_json};
use help::draw_help;
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, Paragraph, Tabs, Wrap},
    Terminal,
};
use state::{apply_event, push_wrapped_status_kv, UiState, TAB_ANALYSIS, TAB_HELP, TAB_HISTORY};
use std::path::PathBuf;
use std::{io, time::Duration, time::Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

/// Rows used by the history header and its blank separator line.
const HISTORY_HEADER_ROWS: usize = 3;

pub async fn run(args: Cli) -> Result<()> {
    // Unbounded channels avoid backpressure between the controller and the UI thread.
    let (event_tx, event_rx) = mpsc::unbounded_channel::<WorkflowEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();

    let history = HistoryStore::new();
    let workflow = crate::cli::build_controller(&args, history.clone(), event_tx.clone())?;

    if let Some(path) = args.image.clone() {
        let _ = cmd_tx.send(UiCommand::SelectFile(path));
    }

    // TUI runs in a dedicated thread to keep all blocking I/O out of the Tokio runtime.
    let initial_path = args.image.clone();
    let ui_handle =
        std::thread::spawn(move || run_threaded(history, initial_path, event_rx, cmd_tx));

    let res = orchestrator::run_controller(workflow, event_tx, cmd_rx).await;

    let join_res = tokio::task::spawn_blocking(move || ui_handle.join()).await;
    if let Ok(joined) = join_res {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(anyhow::anyhow!("TUI thread panicked")),
        }
    }

    res
}

/// Run the TUI loop on a dedicated thread.
pub fn run_threaded(
    history: HistoryStore,
    initial_path: Option<PathBuf>,
    mut event_rx: UnboundedReceiver<WorkflowEvent>,
    cmd_tx: UnboundedSender<UiCommand>,
) -> Result<()> {
    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).ok();

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;
    terminal.clear().ok();

    // UiState is owned by the UI thread only; no cross-thread mutation.
    let mut state = UiState {
        path_input: initial_path
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        ..Default::default()
    };

    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now();

    let res = loop {
        // Drain events without blocking to keep UI responsive.
        while let Ok(ev) = event_rx.try_recv() {
            apply_event(&mut state, &history, ev);
        }

        if last_tick.elapsed() >= tick_rate {
            terminal.draw(|f| draw(f.area(), f, &state)).ok();
            last_tick = Instant::now();
        }

        // Poll input with a short timeout to avoid blocking the render loop.
        if event::poll(Duration::from_millis(10)).unwrap_or(false) {
            if let Ok(Event::Key(k)) = event::read() {
                if k.kind != KeyEventKind::Press {
                    continue;
                }
                let visible_rows = terminal
                    .size()
                    .map(|s| (s.height as usize).saturating_sub(5 + HISTORY_HEADER_ROWS))
                    .unwrap_or(20);
                if handle_key(&mut state, &history, &cmd_tx, k, visible_rows) {
                    let _ = cmd_tx.send(UiCommand::Quit);
                    break Ok(());
                }
            }
        }
    };

    disable_raw_mode().ok();
    let mut stdout = io::stdout();
    execute!(stdout, LeaveAlternateScreen).ok();
    res
}

/// Apply a key press. Returns true when the user asked to quit.
fn handle_key(
    state: &mut UiState,
    history: &HistoryStore,
    cmd_tx: &UnboundedSender<UiCommand>,
    k: KeyEvent,
    visible_rows: usize,
) -> bool {
    if state.path_editing {
        match k.code {
            KeyCode::Enter => {
                state.path_editing = false;
                let path = state.path_input.trim();
                if path.is_empty() {
                    state.info = "No path entered.".into();
                } else {
                    let _ = cmd_tx.send(UiCommand::SelectFile(PathBuf::from(path)));
                }
            }
            KeyCode::Esc => {
                state.path_editing = false;
                state.info = "Selection cancelled.".into();
            }
            KeyCode::Backspace => {
                state.path_input.pop();
            }
            KeyCode::Char('c') if k.modifiers.contains(KeyModifiers::CONTROL) => return true,
            KeyCode::Char(c) => state.path_input.push(c),
            _ => {}
        }
        return false;
    }

    match (k.modifiers, k.code) {
        (_, KeyCode::Char('q')) | (KeyModifiers::CONTROL, KeyCode::Char('c')) => return true,
        (_, KeyCode::Tab) => {
            state.tab = (state.tab + 1) % 3;
            state.history_detail_view = false;
        }
        (_, KeyCode::Char('?')) => {
            state.tab = TAB_HELP;
        }
        (_, KeyCode::Char('o')) if state.tab == TAB_ANALYSIS => {
            if state.workflow.phase.is_busy() {
                state.info = "Wait for the current analysis to finish or press r.".into();
            } else {
                state.path_editing = true;
                state.info = "Type the image path and press Enter.".into();
            }
        }
        (_, KeyCode::Enter) | (_, KeyCode::Char('s')) if state.tab == TAB_ANALYSIS => {
            let _ = cmd_tx.send(UiCommand::Submit);
        }
        (_, KeyCode::Char('r')) if state.tab == TAB_ANALYSIS => {
            let _ = cmd_tx.send(UiCommand::Reset);
            state.info = "Ready for a new image.".into();
        }
        (_, KeyCode::Char('e')) if state.tab == TAB_ANALYSIS => {
            let _ = cmd_tx.send(UiCommand::ToggleExplanation);
        }
        (_, KeyCode::Char('y')) if state.tab == TAB_ANALYSIS => {
            match state.workflow.explanation.as_deref() {
                Some(text) => {
                    state.info = match copy_to_clipboard(text) {
                        Ok(()) => "✓ Copied explanation to clipboard".into(),
                        Err(e) => format!("Clipboard copy failed: {e:#}"),
                    };
                }
                None => state.info = "No explanation to copy yet.".into(),
            }
        }
        (_, KeyCode::Char('x')) if state.tab == TAB_ANALYSIS => {
            match history.list().first() {
                Some(latest) => {
                    let path = PathBuf::from(export::export_file_name(latest));
                    state.info = orchestrator::export_latest(history, &path);
                }
                None => state.info = "Nothing to export yet.".into(),
            }
        }
        (_, KeyCode::Enter) if state.tab == TAB_HISTORY => {
            if state.selected_record().is_some() {
                state.history_detail_view = !state.history_detail_view;
                state.history_detail_scroll = 0;
            }
        }
        (_, KeyCode::Esc) if state.tab == TAB_HISTORY => {
            state.history_detail_view = false;
        }
        (_, KeyCode::Char('x')) if state.tab == TAB_HISTORY => {
            if let Some(r) = state.selected_record().cloned() {
                match export_record_json(&r) {
                    Ok(p) => {
                        state.last_exported_path = Some(p.to_string_lossy().to_string());
                        state.info =
                            format!("Exported JSON: {} (press 'y' to copy path)", p.display());
                    }
                    Err(e) => state.info = format!("JSON export failed: {e:#}"),
                }
            }
        }
        (_, KeyCode::Char('y')) if state.tab == TAB_HISTORY => {
            state.info = match state.last_exported_path.as_deref() {
                Some(path) => match copy_to_clipboard(path) {
                    Ok(()) => format!("✓ Copied to clipboard: {path}"),
                    Err(e) => format!("Clipboard copy failed: {e:#}"),
                },
                None => "No exported file path to copy. Export a file first (x)".into(),
            };
        }
        (_, KeyCode::Up) | (_, KeyCode::Char('k')) if state.tab == TAB_HISTORY => {
            if state.history_detail_view {
                state.history_detail_scroll = state.history_detail_scroll.saturating_sub(1);
            } else {
                state.select_previous();
            }
        }
        (_, KeyCode::Down) | (_, KeyCode::Char('j')) if state.tab == TAB_HISTORY => {
            if state.history_detail_view {
                state.history_detail_scroll += 1;
            } else {
                state.select_next(visible_rows);
            }
        }
        _ => {}
    }
    false
}

fn draw(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0)].as_ref())
        .split(area);

    let tabs = Tabs::new(vec![
        Line::from("Analysis"),
        Line::from("History"),
        Line::from("Help"),
    ])
    .select(state.tab)
    .block(Block::default().borders(Borders::ALL).title("fracture-scan"))
    .highlight_style(Style::default().fg(Color::Yellow));
    f.render_widget(tabs, chunks[0]);

    match state.tab {
        TAB_ANALYSIS => draw_analysis(chunks[1], f, state),
        TAB_HISTORY => draw_history(chunks[1], f, state),
        _ => draw_help(chunks[1], f),
    }
}

fn draw_analysis(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let main = Layout::default()
        .direction(Direction::Vertical)
        .constraints(
            [
                Constraint::Length(3), // Selected image / path input
                Constraint::Length(3), // Progress
                Constraint::Min(0),    // Result
                Constraint::Length(5), // Status row
            ]
            .as_ref(),
        )
        .split(area);

    let file_line = if state.path_editing {
        Line::from(vec![
            Span::styled("Path: ", Style::default().fg(Color::Gray)),
            Span::styled(
                format!("{}_", state.path_input),
                Style::default().fg(Color::Yellow),
            ),
        ])
    } else {
        match state.workflow.selected.as_ref() {
            Some(file) => Line::from(vec![
                Span::styled("Image: ", Style::default().fg(Color::Gray)),
                Span::raw(file.name.clone()),
                Span::styled(
                    format!("  ({} bytes)", file.size_bytes),
                    Style::default().fg(Color::DarkGray),
                ),
            ]),
            None => Line::from(Span::styled(
                "No image selected.",
                Style::default().fg(Color::DarkGray),
            )),
        }
    };
    f.render_widget(
        Paragraph::new(file_line).block(Block::default().borders(Borders::ALL).title("Image")),
        main[0],
    );

    let (color, pct) = match state.workflow.status() {
        ViewStatus::Ready => (Color::DarkGray, 0),
        ViewStatus::InProgress(p) => (Color::Cyan, p),
        ViewStatus::Success => (Color::Green, 100),
        ViewStatus::Failure => (Color::Red, 100),
    };
    let gauge = Gauge::default()
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(text_summary::status_line(&state.workflow)),
        )
        .gauge_style(Style::default().fg(color))
        .percent(u16::from(pct.min(100)));
    f.render_widget(gauge, main[1]);

    let summary = text_summary::build_text_summary(&state.workflow);
    let mut lines: Vec<Line> = summary
        .lines
        .into_iter()
        .map(|l| {
            if state.workflow.detection_error || l.starts_with("Fracture detected") {
                Line::from(Span::styled(l, Style::default().fg(Color::Red)))
            } else {
                Line::from(l)
            }
        })
        .collect();
    if state.workflow.explanation_loading() {
        lines.push(Line::from(""));
        lines.push(Line::from(Span::styled(
            "Generating explanation...",
            Style::default().fg(Color::Cyan),
        )));
    }
    let result_title = if state.workflow.explanation_error {
        "Result (explanation unavailable)"
    } else {
        "Result"
    };
    f.render_widget(
        Paragraph::new(lines)
            .wrap(Wrap { trim: false })
            .block(Block::default().borders(Borders::ALL).title(result_title)),
        main[2],
    );

    let mut status: Vec<Line<'static>> = Vec::new();
    push_wrapped_status_kv(&mut status, "Info", &state.info, main[3].width);
    status.push(Line::from(vec![
        Span::styled("o", Style::default().fg(Color::Magenta)),
        Span::raw(": open, "),
        Span::styled("Enter", Style::default().fg(Color::Magenta)),
        Span::raw(": analyze, "),
        Span::styled("e", Style::default().fg(Color::Magenta)),
        Span::raw(": explanation, "),
        Span::styled("r", Style::default().fg(Color::Magenta)),
        Span::raw(": start over, "),
        Span::styled("q", Style::default().fg(Color::Magenta)),
        Span::raw(": quit"),
    ]));
    f.render_widget(
        Paragraph::new(status).block(Block::default().borders(Borders::ALL).title("Status")),
        main[3],
    );
}

fn draw_history(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    if state.history_detail_view {
        if let Some(r) = state.selected_record() {
            let json = serde_json::to_string_pretty(r.as_ref())
                .unwrap_or_else(|e| format!("Cannot render record: {e}"));
            let p = Paragraph::new(json)
                .scroll((state.history_detail_scroll.min(u16::MAX as usize) as u16, 0))
                .block(
                    Block::default()
                        .borders(Borders::ALL)
                        .title(format!("Record {} (Esc to close)", r.id)),
                );
            f.render_widget(p, area);
            return;
        }
    }

    let mut lines: Vec<Line> = Vec::new();
    let max_items = (area.height as usize).saturating_sub(2 + HISTORY_HEADER_ROWS);

    let total_count = state.history.len();
    let current_pos = if total_count > 0 {
        state.history_selected + 1
    } else {
        0
    };

    lines.push(Line::from(vec![
        Span::raw(format!("History ({current_pos}/{total_count}) - ")),
        Span::styled("↑/↓/j/k", Style::default().fg(Color::Magenta)),
        Span::raw(": navigate, "),
        Span::styled("Enter", Style::default().fg(Color::Magenta)),
        Span::raw(": details, "),
        Span::styled("x", Style::default().fg(Color::Magenta)),
        Span::raw(": export JSON"),
    ]));
    if state.info.starts_with("Exported")
        || state.info.starts_with("JSON export")
        || state.info.starts_with("✓ Copied to clipboard")
    {
        lines.push(Line::from(vec![
            Span::styled("Info: ", Style::default().fg(Color::Gray)),
            Span::raw(state.info.clone()),
        ]));
    } else {
        lines.push(Line::from(""));
    }
    lines.push(Line::from(""));

    if state.history.is_empty() {
        lines.push(Line::from(Span::styled(
            "No analyses yet in this session.",
            Style::default().fg(Color::DarkGray),
        )));
    }

    // Keep the selected item visible even if the terminal shrank since the last key press.
    let scroll_offset = {
        let mut offset = state
            .history_scroll_offset
            .min(state.history.len().saturating_sub(1));
        if state.history_selected < offset {
            offset = state.history_selected;
        } else if max_items > 0 && state.history_selected >= offset + max_items {
            offset = state.history_selected + 1 - max_items;
        }
        offset
    };

    for (idx, r) in state
        .history
        .iter()
        .enumerate()
        .skip(scroll_offset)
        .take(max_items)
    {
        let is_selected = idx == state.history_selected;
        let marker = if is_selected { "> " } else { "  " };
        let headline_color = if r.has_finding() {
            Color::Red
        } else {
            Color::Green
        };
        let base = if is_selected {
            Style::default().add_modifier(Modifier::BOLD)
        } else {
            Style::default()
        };
        lines.push(Line::from(vec![
            Span::styled(marker, base.fg(Color::Yellow)),
            Span::styled(text_summary::format_timestamp(r), base.fg(Color::Gray)),
            Span::raw("  "),
            Span::styled(r.source_file_name.clone(), base),
            Span::raw("  "),
            Span::styled(r.headline(), base.fg(headline_color)),
        ]));
    }

    f.render_widget(
        Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("History")),
        area,
    );
}
