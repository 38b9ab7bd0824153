use crate::history::HistoryStore;
use crate::model::{HistoryRecord, WorkflowEvent, WorkflowState};
use ratatui::{
    style::Color,
    style::Style,
    text::{Line, Span},
};
use std::sync::Arc;

pub const TAB_ANALYSIS: usize = 0;
pub const TAB_HISTORY: usize = 1;
pub const TAB_HELP: usize = 2;

pub struct UiState {
    pub tab: usize,
    pub info: String,
    /// Last snapshot published by the workflow controller.
    pub workflow: WorkflowState,

    // Image path input
    pub path_input: String,
    pub path_editing: bool,

    pub history: Vec<Arc<HistoryRecord>>,
    pub history_selected: usize, // Index of selected history item (0 = most recent)
    pub history_scroll_offset: usize,
    // History detail view state
    pub history_detail_view: bool,
    pub history_detail_scroll: usize,
    pub last_exported_path: Option<String>,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            tab: TAB_ANALYSIS,
            info: "Press o to choose an X-ray image.".into(),
            workflow: WorkflowState::default(),
            path_input: String::new(),
            path_editing: false,
            history: Vec::new(),
            history_selected: 0,
            history_scroll_offset: 0,
            history_detail_view: false,
            history_detail_scroll: 0,
            last_exported_path: None,
        }
    }
}

impl UiState {
    pub fn selected_record(&self) -> Option<&Arc<HistoryRecord>> {
        self.history.get(self.history_selected)
    }

    pub fn select_previous(&mut self) {
        if self.history_selected > 0 {
            self.history_selected -= 1;
            if self.history_selected < self.history_scroll_offset {
                self.history_scroll_offset = self.history_selected;
            }
        }
    }

    pub fn select_next(&mut self, visible_rows: usize) {
        if self.history_selected + 1 < self.history.len() {
            self.history_selected += 1;
            let visible_rows = visible_rows.max(1);
            if self.history_selected >= self.history_scroll_offset + visible_rows {
                self.history_scroll_offset = self.history_selected + 1 - visible_rows;
            }
        }
    }
}

/// Fold a controller event into the UI state.
pub fn apply_event(state: &mut UiState, history: &HistoryStore, ev: WorkflowEvent) {
    match ev {
        WorkflowEvent::Snapshot(next) => {
            state.workflow = *next;
        }
        WorkflowEvent::Info(info) => {
            state.info = info.to_message();
        }
        WorkflowEvent::HistoryAppended { id } => {
            // Newest first: keep the cursor on the record it pointed at.
            let was_empty = state.history.is_empty();
            match history.get(&id) {
                Some(record) if !state.history.iter().any(|r| r.id == id) => {
                    state.history.insert(0, record);
                }
                _ => state.history = history.list(),
            }
            if !was_empty {
                state.history_selected =
                    (state.history_selected + 1).min(state.history.len().saturating_sub(1));
            }
        }
    }
}

pub fn push_wrapped_status_kv(
    out: &mut Vec<Line<'static>>,
    label: &str,
    value: &str,
    status_area_width: u16,
) {
    let value = value.trim();
    if value.is_empty() {
        return;
    }

    // Account for borders (2 chars on each side)
    let usable_width = status_area_width.saturating_sub(4).max(1);
    let label_text = format!("{label}:");
    let label_width = label_text.chars().count() as u16;

    let value_chars: Vec<char> = value.chars().collect();
    let mut remaining = value_chars.as_slice();
    let mut first = true;

    while !remaining.is_empty() {
        let line_width = if first {
            usable_width.saturating_sub(label_width + 1).max(1)
        } else {
            usable_width.saturating_sub(2).max(1)
        };

        let chars_to_take = remaining.len().min(line_width as usize);
        let (line_chars, rest) = remaining.split_at(chars_to_take);
        let line_text: String = line_chars.iter().collect();

        if first {
            out.push(Line::from(vec![
                Span::styled(label_text.clone(), Style::default().fg(Color::Gray)),
                Span::raw(" "),
                Span::raw(line_text),
            ]));
            first = false;
        } else {
            out.push(Line::from(vec![Span::raw("  "), Span::raw(line_text)]));
        }

        remaining = rest;
    }
}
