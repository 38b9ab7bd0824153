use ratatui::{
    layout::Rect,
    style::Color,
    style::Style,
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
    Frame,
};

fn key_line(key: &'static str, pad: usize, desc: &'static str) -> Line<'static> {
    Line::from(vec![
        Span::raw("  "),
        Span::styled(key, Style::default().fg(Color::Magenta)),
        Span::raw(format!("{:pad$}{desc}", "")),
    ])
}

pub fn draw_help(area: Rect, f: &mut Frame) {
    let p = Paragraph::new(vec![
        Line::from("Keybinds:"),
        Line::from(vec![
            Span::raw("  "),
            Span::styled("q", Style::default().fg(Color::Magenta)),
            Span::raw(" / "),
            Span::styled("Ctrl-C", Style::default().fg(Color::Magenta)),
            Span::raw("  Quit"),
        ]),
        key_line("tab", 9, "Switch tabs"),
        key_line("?", 11, "Show this help"),
        Line::from(""),
        Line::from("Analysis tab:"),
        key_line("o", 11, "Choose an image (type a path, Enter to confirm, Esc to cancel)"),
        key_line("Enter/s", 5, "Analyze the selected image"),
        key_line("e", 11, "Show/hide the explanation"),
        key_line("y", 11, "Copy explanation to clipboard"),
        key_line("x", 11, "Export latest result as JSON"),
        key_line("r", 11, "Start over"),
        Line::from(""),
        Line::from("History tab:"),
        Line::from(vec![
            Span::raw("  "),
            Span::styled("↑/↓", Style::default().fg(Color::Magenta)),
            Span::raw(" or "),
            Span::styled("j/k", Style::default().fg(Color::Magenta)),
            Span::raw("  Navigate"),
        ]),
        key_line("Enter", 7, "Show/hide record details"),
        key_line("x", 11, "Export selected as JSON"),
        key_line("y", 11, "Copy exported path to clipboard"),
        Line::from(""),
        Line::from(Span::styled(
            "Explanations are informational only and are NOT a diagnosis.",
            Style::default().fg(Color::Yellow),
        )),
    ])
    .block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(p, area);
}
