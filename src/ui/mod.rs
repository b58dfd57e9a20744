use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph, Wrap};
use ratatui::Frame;
use unicode_segmentation::UnicodeSegmentation;

use crate::app::{
    AppState, ComposeField, ComposeView, DeliveryMode, EditDraft, EditField, FocusPane,
    InboxView, JoinField, LetterViews, NoticeKind, SentView, TextInput,
};
use crate::clock::display_time;
use crate::letters::{InboxStatus, SentStatus};

pub fn draw_app(frame: &mut Frame, state: &AppState) {
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(3), Constraint::Length(4)])
        .split(frame.size());

    match state.views.as_ref() {
        Some(views) => {
            let columns = Layout::default()
                .direction(Direction::Horizontal)
                .constraints([
                    Constraint::Percentage(30),
                    Constraint::Percentage(40),
                    Constraint::Percentage(30),
                ])
                .split(vertical[0]);
            draw_compose(frame, columns[0], &views.compose, state.focus == FocusPane::Compose);
            draw_inbox(frame, columns[1], &views.inbox, state);
            draw_sent(frame, columns[2], &views.sent, state);
        }
        None => draw_join(frame, vertical[0], state),
    }

    let status = Paragraph::new(build_status_line(state))
        .block(Block::default().borders(Borders::ALL).title("Status"))
        .wrap(Wrap { trim: true });
    frame.render_widget(status, vertical[1]);

    if let Some(draft) = state.views.as_ref().and_then(|views| views.sent.editor()) {
        draw_edit_overlay(frame, draft);
    }
}

fn pane_block(title: String, focused: bool) -> Block<'static> {
    let style = if focused {
        Style::default().fg(Color::Cyan)
    } else {
        Style::default()
    };
    Block::default()
        .borders(Borders::ALL)
        .border_style(style)
        .title(title)
}

fn draw_join(frame: &mut Frame, area: Rect, state: &AppState) {
    let popup = centered_rect(50, 40, area);
    let form = &state.join;
    let lines = vec![
        Line::from("Join a group to start sending letters."),
        Line::from(""),
        input_line("Group code", &form.group, form.field == JoinField::Group),
        input_line("Your name ", &form.name, form.field == JoinField::Name),
        Line::from(""),
        Line::from(Span::styled(
            "Tab switch field • Enter join • Esc quit",
            Style::default().fg(Color::Gray),
        )),
    ];
    let paragraph = Paragraph::new(lines)
        .block(pane_block("Letters".into(), true))
        .wrap(Wrap { trim: false });
    frame.render_widget(Clear, popup);
    frame.render_widget(paragraph, popup);
}

fn draw_compose(frame: &mut Frame, area: Rect, compose: &ComposeView, focused: bool) {
    let active = |field: ComposeField| focused && compose.field == field;
    let mode = match compose.mode {
        DeliveryMode::Now => "Send now",
        DeliveryMode::Later => "Send later",
    };
    let mut lines = vec![
        Line::from(vec![
            Span::raw("Mode: "),
            Span::styled(mode, Style::default().add_modifier(Modifier::BOLD)),
        ]),
        input_line("To  ", &compose.to, active(ComposeField::To)),
    ];
    let recipients = compose
        .recipients()
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    lines.push(Line::from(Span::styled(
        if recipients.is_empty() {
            "  (no known recipients yet)".to_string()
        } else {
            format!("  known: {recipients}")
        },
        Style::default().fg(Color::Gray),
    )));
    lines.push(input_line("Msg ", &compose.message, active(ComposeField::Message)));
    if compose.mode == DeliveryMode::Later {
        lines.push(input_line("When", &compose.when, active(ComposeField::When)));
        lines.push(Line::from(Span::styled(
            "  YYYY-MM-DD HH:MM",
            Style::default().fg(Color::Gray),
        )));
    }
    let paragraph = Paragraph::new(lines)
        .block(pane_block("Compose".into(), focused))
        .wrap(Wrap { trim: false });
    frame.render_widget(paragraph, area);
}

fn draw_inbox(frame: &mut Frame, area: Rect, inbox: &InboxView, state: &AppState) {
    let focused = state.focus == FocusPane::Inbox;
    let mut items = Vec::with_capacity(inbox.entries().len());
    for entry in inbox.entries() {
        let letter = &entry.letter;
        let mut header = vec![Span::raw(if inbox.is_selected(&letter.id) {
            "[x] "
        } else {
            "[ ] "
        })];
        if entry.starred {
            header.push(Span::styled(
                "★ ",
                Style::default()
                    .fg(Color::Yellow)
                    .add_modifier(Modifier::BOLD),
            ));
        }
        header.push(Span::styled(
            format!("From: {}", letter.from),
            Style::default().add_modifier(Modifier::BOLD),
        ));
        if entry.status == InboxStatus::Unread {
            header.push(Span::styled(
                " New",
                Style::default().fg(Color::Black).bg(Color::Yellow),
            ));
        }
        let meta = Line::from(Span::styled(
            format!(
                "{} • {}",
                display_time(letter.deliver_at, state.offset),
                entry.status.label()
            ),
            Style::default()
                .fg(Color::Gray)
                .add_modifier(Modifier::ITALIC),
        ));
        let mut lines = vec![Line::from(header), meta];
        lines.extend(letter.message.lines().map(|line| Line::from(line.to_string())));
        lines.push(Line::from(""));
        items.push(ListItem::new(lines));
    }
    if items.is_empty() {
        items.push(ListItem::new("No letters yet."));
    }

    let title = if inbox.selection().is_empty() {
        format!("Inbox ({} unread)", inbox.unread_count())
    } else {
        format!(
            "Inbox ({} unread) • {} selected",
            inbox.unread_count(),
            inbox.selection().len()
        )
    };
    let list = List::new(items)
        .block(pane_block(title, focused))
        .highlight_style(highlight_style(focused));
    let mut list_state = ListState::default();
    if !inbox.entries().is_empty() {
        list_state.select(Some(inbox.cursor()));
    }
    frame.render_stateful_widget(list, area, &mut list_state);
}

fn draw_sent(frame: &mut Frame, area: Rect, sent: &SentView, state: &AppState) {
    let focused = state.focus == FocusPane::Sent;
    let mut items = Vec::with_capacity(sent.entries().len());
    for entry in sent.entries() {
        let letter = &entry.letter;
        let status_style = match entry.status {
            SentStatus::Pending => Style::default().fg(Color::Yellow),
            SentStatus::Unread => Style::default().fg(Color::Gray),
            SentStatus::Read { .. } => Style::default().fg(Color::Green),
        };
        let mut lines = vec![
            Line::from(Span::styled(
                format!("To: {}", letter.to),
                Style::default().add_modifier(Modifier::BOLD),
            )),
            Line::from(Span::styled(
                format!("Deliver at {}", display_time(letter.deliver_at, state.offset)),
                Style::default().fg(Color::Gray),
            )),
            Line::from(Span::styled(entry.status.describe(state.offset), status_style)),
        ];
        lines.extend(letter.message.lines().map(|line| Line::from(line.to_string())));
        lines.push(Line::from(""));
        items.push(ListItem::new(lines));
    }
    if items.is_empty() {
        items.push(ListItem::new("No sent letters."));
    }
    let list = List::new(items)
        .block(pane_block("Sent".into(), focused))
        .highlight_style(highlight_style(focused));
    let mut list_state = ListState::default();
    if !sent.entries().is_empty() {
        list_state.select(Some(sent.cursor()));
    }
    frame.render_stateful_widget(list, area, &mut list_state);
}

fn draw_edit_overlay(frame: &mut Frame, draft: &EditDraft) {
    let area = centered_rect(60, 30, frame.size());
    let lines = vec![
        input_line("Message", &draft.message, draft.field == EditField::Message),
        input_line("When   ", &draft.when, draft.field == EditField::When),
        Line::from(""),
        Line::from(Span::styled(
            "Tab switch field • Enter save • Esc cancel",
            Style::default().fg(Color::Gray),
        )),
    ];
    let paragraph = Paragraph::new(lines)
        .block(pane_block(format!("Edit letter {}", draft.id.short()), true))
        .wrap(Wrap { trim: false });
    frame.render_widget(Clear, area);
    frame.render_widget(paragraph, area);
}

fn highlight_style(focused: bool) -> Style {
    if focused {
        Style::default().bg(Color::DarkGray)
    } else {
        Style::default()
    }
}

/// `label: value` with a reversed cell at the cursor when the field is active.
fn input_line(label: &str, input: &TextInput, active: bool) -> Line<'static> {
    let label_style = if active {
        Style::default()
            .fg(Color::Cyan)
            .add_modifier(Modifier::BOLD)
    } else {
        Style::default().fg(Color::Gray)
    };
    let mut spans = vec![Span::styled(format!("{label}: "), label_style)];
    let value = input.value().replace('\n', "⏎");
    if !active {
        spans.push(Span::raw(value));
        return Line::from(spans);
    }
    let cursor = input.value()[..input.cursor()].replace('\n', "⏎").len();
    let (before, rest) = value.split_at(cursor);
    let mut graphemes = rest.graphemes(true);
    let at_cursor = graphemes.next().unwrap_or(" ").to_string();
    let after: String = graphemes.collect();
    spans.push(Span::raw(before.to_string()));
    spans.push(Span::styled(
        at_cursor,
        Style::default().add_modifier(Modifier::REVERSED),
    ));
    spans.push(Span::raw(after));
    Line::from(spans)
}

fn build_status_line(state: &AppState) -> Text<'static> {
    let mut lines = Vec::with_capacity(2);
    match state.notices.current() {
        Some(notice) => {
            let style = match notice.kind {
                NoticeKind::Success => Style::default()
                    .fg(Color::Green)
                    .add_modifier(Modifier::BOLD),
                NoticeKind::Failure => Style::default()
                    .fg(Color::Red)
                    .add_modifier(Modifier::BOLD),
            };
            lines.push(Line::from(vec![
                Span::styled(notice.message.clone(), style),
                Span::styled("  (Esc to dismiss)", Style::default().fg(Color::Gray)),
            ]));
        }
        None => lines.push(Line::from(session_summary(state.views.as_ref()))),
    }
    let help = if !state.is_joined() {
        "Tab switch field • Enter join • Esc/Ctrl-c quit"
    } else if state.is_editing_sent() {
        "Editing: Tab switch field • Enter save • Esc cancel"
    } else {
        match state.focus {
            FocusPane::Compose => {
                "↑/↓ field • Ctrl-n/p recipient • Ctrl-t now/later • Alt-Enter newline • Enter send • Tab pane"
            }
            FocusPane::Inbox => {
                "j/k move • space select • a all • c clear • r read • d delete • s star • x export • Tab pane • Ctrl-l leave • q quit"
            }
            FocusPane::Sent => "j/k move • e edit • d delete • Tab pane • Ctrl-l leave • q quit",
        }
    };
    lines.push(Line::from(Span::styled(
        help,
        Style::default().fg(Color::Gray),
    )));
    Text::from(lines)
}

fn session_summary(views: Option<&LetterViews>) -> String {
    match views {
        Some(views) => format!(
            "{} in group {}",
            views.session.user, views.session.group_id
        ),
        None => "Not joined".to_string(),
    }
}

fn centered_rect(percent_x: u16, percent_y: u16, area: Rect) -> Rect {
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(area);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(vertical[1])[1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use ratatui::backend::TestBackend;
    use ratatui::Terminal;
    use std::time::Duration;
    use time::UtcOffset;

    fn buffer_text(terminal: &Terminal<TestBackend>) -> String {
        let buffer = terminal.backend().buffer();
        let mut text = String::new();
        for y in 0..buffer.area.height {
            for x in 0..buffer.area.width {
                text.push_str(buffer.get(x, y).symbol());
            }
            text.push('\n');
        }
        text
    }

    #[test]
    fn join_screen_renders_fields_and_notice() -> anyhow::Result<()> {
        let mut state = AppState::new(Duration::from_secs(5), UtcOffset::UTC);
        state.join.group.set("family");
        state.notices.failure("Join failed: name cannot be empty");

        let mut terminal = Terminal::new(TestBackend::new(100, 30))?;
        terminal.draw(|frame| draw_app(frame, &state))?;
        let text = buffer_text(&terminal);
        assert!(text.contains("Group code: family"));
        assert!(text.contains("Join failed: name cannot be empty"));
        Ok(())
    }

    #[test]
    fn input_line_marks_cursor_cell() {
        let mut input = TextInput::new("abc");
        input.move_left();
        let line = input_line("To", &input, true);
        let contents: Vec<_> = line.spans.iter().map(|s| s.content.to_string()).collect();
        assert_eq!(contents, vec!["To: ", "ab", "c", ""]);

        let line = input_line("To", &TextInput::new("a\nb"), false);
        assert_eq!(line.spans[1].content, "a⏎b");
    }
}
