use std::io::Stdout;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossterm::event::{
    self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEvent, KeyEventKind,
    KeyModifiers,
};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::CrosstermBackend;
use ratatui::Terminal;

use crate::clock::{self, Clock};
use crate::config::{AppConfig, ConfigPaths};
use crate::session::{SessionContext, SessionManager};
use crate::store::{LetterStore, SqliteStore};
use crate::ui;

pub mod actions;
pub mod compose;
pub mod inbox;
pub mod notice;
pub mod sent;
pub mod state;

pub use actions::{ActionDispatcher, BulkOutcome, WriteError, WriteResult};
pub use compose::{parse_deliver_at, ComposeField, ComposeView, Delivery, DeliveryMode};
pub use inbox::{InboxEntry, InboxView};
pub use notice::{Notice, NoticeKind, Notices};
pub use sent::{EditDraft, EditField, SentEntry, SentView};
pub use state::{AppState, FocusPane, JoinField, JoinForm, LetterViews, TextInput};

enum Action {
    Quit,
    NextPane,
    PreviousPane,
    Leave,
    SelectNext,
    SelectPrevious,
    ToggleSelect,
    SelectAll,
    ClearSelection,
    MarkRead,
    Delete,
    ToggleStar,
    Export,
    Edit,
}

pub struct App {
    pub config: Arc<AppConfig>,
    store: Arc<SqliteStore>,
    clock: Arc<dyn Clock>,
    sessions: SessionManager,
    state: AppState,
    should_quit: bool,
    tick_rate: Duration,
}

impl App {
    pub fn new(config: Arc<AppConfig>, store: SqliteStore, paths: &ConfigPaths) -> Result<Self> {
        let store = Arc::new(store);
        let clock = clock::from_options(&config.clock, store.clone());
        let sessions = SessionManager::load(&paths.session_file);
        let state = AppState::new(config.notice_ttl(), config.utc_offset());
        let mut app = Self {
            tick_rate: config.tick_rate(),
            config,
            store,
            clock,
            sessions,
            state,
            should_quit: false,
        };
        if let Some(session) = app.sessions.current().cloned() {
            app.open_views(session);
        }
        Ok(app)
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn run(&mut self) -> Result<()> {
        let mut terminal = setup_terminal()?;
        let result = self.event_loop(&mut terminal);
        restore_terminal(&mut terminal)?;
        result
    }

    fn event_loop(&mut self, terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
        let mut last_tick = Instant::now();
        loop {
            terminal
                .draw(|frame| ui::draw_app(frame, &self.state))
                .context("rendering frame")?;

            if self.should_quit {
                break;
            }

            let timeout = self
                .tick_rate
                .checked_sub(last_tick.elapsed())
                .unwrap_or_else(|| Duration::from_millis(0));

            if event::poll(timeout).context("polling for terminal events")? {
                if let Event::Key(key) = event::read().context("reading terminal event")? {
                    self.handle_key(key);
                }
            }

            if last_tick.elapsed() >= self.tick_rate {
                self.on_tick();
                last_tick = Instant::now();
            }
        }
        Ok(())
    }

    fn on_tick(&mut self) {
        if self.state.is_joined() {
            if let Err(err) = self.store.poll_changes() {
                tracing::warn!(?err, "polling for external changes failed");
            }
        }
        self.sync_views();
        self.state.notices.expire(Instant::now());
    }

    fn sync_views(&mut self) {
        let now = self.clock.now();
        if let Some(views) = self.state.views.as_mut() {
            views.sync(now);
        }
    }

    fn open_views(&mut self, session: SessionContext) {
        match LetterViews::open(self.store.as_ref(), session, self.clock.now()) {
            Ok(views) => {
                tracing::info!(
                    group = %views.session.group_id,
                    user = %views.session.user,
                    "views opened"
                );
                self.state.enter(views);
            }
            Err(err) => self.state.notices.write_failed("Opening letters", &err),
        }
    }

    fn handle_key(&mut self, key: KeyEvent) {
        if key.kind != KeyEventKind::Press {
            return;
        }
        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        if ctrl && matches!(key.code, KeyCode::Char('c') | KeyCode::Char('q')) {
            self.should_quit = true;
            return;
        }
        if key.code == KeyCode::Esc && self.state.notices.dismiss() {
            return;
        }

        if !self.state.is_joined() {
            self.handle_join_key(key);
            return;
        }
        if self.state.is_editing_sent() {
            self.handle_edit_key(key);
            return;
        }

        let action = match key.code {
            KeyCode::Tab => Some(Action::NextPane),
            KeyCode::BackTab => Some(Action::PreviousPane),
            KeyCode::Char('l') if ctrl => Some(Action::Leave),
            _ if self.state.focus == FocusPane::Compose => {
                self.handle_compose_key(key);
                None
            }
            KeyCode::Char('q') => Some(Action::Quit),
            KeyCode::Char('j') | KeyCode::Down => Some(Action::SelectNext),
            KeyCode::Char('k') | KeyCode::Up => Some(Action::SelectPrevious),
            KeyCode::Char(' ') => Some(Action::ToggleSelect),
            KeyCode::Char('a') => Some(Action::SelectAll),
            KeyCode::Char('c') => Some(Action::ClearSelection),
            KeyCode::Char('r') => Some(Action::MarkRead),
            KeyCode::Char('d') => Some(Action::Delete),
            KeyCode::Char('s') => Some(Action::ToggleStar),
            KeyCode::Char('x') => Some(Action::Export),
            KeyCode::Char('e') => Some(Action::Edit),
            _ => None,
        };

        if let Some(action) = action {
            self.handle_action(action);
        }
    }

    fn handle_action(&mut self, action: Action) {
        match action {
            Action::Quit => self.should_quit = true,
            Action::NextPane => self.state.focus = self.state.focus.next(),
            Action::PreviousPane => self.state.focus = self.state.focus.previous(),
            Action::Leave => self.handle_leave(),
            Action::SelectNext => self.move_cursor(1),
            Action::SelectPrevious => self.move_cursor(-1),
            Action::ToggleSelect => {
                if let (FocusPane::Inbox, Some(views)) = (self.state.focus, self.state.views.as_mut()) {
                    views.inbox.toggle_focused();
                }
            }
            Action::SelectAll => {
                if let (FocusPane::Inbox, Some(views)) = (self.state.focus, self.state.views.as_mut()) {
                    views.inbox.select_all();
                }
            }
            Action::ClearSelection => {
                if let (FocusPane::Inbox, Some(views)) = (self.state.focus, self.state.views.as_mut()) {
                    views.inbox.clear_selection();
                }
            }
            Action::MarkRead => self.handle_bulk(false),
            Action::Delete => match self.state.focus {
                FocusPane::Inbox => self.handle_bulk(true),
                FocusPane::Sent => self.handle_delete_sent(),
                FocusPane::Compose => {}
            },
            Action::ToggleStar => self.handle_toggle_star(),
            Action::Export => self.handle_export(),
            Action::Edit => self.handle_begin_edit(),
        }
    }

    fn move_cursor(&mut self, delta: isize) {
        let Some(views) = self.state.views.as_mut() else {
            return;
        };
        match self.state.focus {
            FocusPane::Inbox => views.inbox.move_cursor(delta),
            FocusPane::Sent => views.sent.move_cursor(delta),
            FocusPane::Compose => {}
        }
    }

    fn handle_join_key(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Esc => self.should_quit = true,
            KeyCode::Tab | KeyCode::BackTab | KeyCode::Up | KeyCode::Down => {
                self.state.join.toggle_field()
            }
            KeyCode::Enter => self.submit_join(),
            _ => edit_text(self.state.join.active_mut(), key),
        }
    }

    fn submit_join(&mut self) {
        let group = self.state.join.group.value().to_string();
        let name = self.state.join.name.value().to_string();
        match self.sessions.join(&group, &name) {
            Ok(session) => {
                self.open_views(session);
                if self.state.is_joined() {
                    self.state.notices.success("Joined!");
                }
            }
            Err(err) => {
                tracing::warn!(?err, "join rejected");
                self.state.notices.failure(format!("Join failed: {err}"));
            }
        }
    }

    fn handle_leave(&mut self) {
        match self.sessions.leave() {
            Ok(_) => {
                self.state.leave();
                self.state.notices.success("Left the group");
            }
            Err(err) => {
                tracing::error!(?err, "failed to leave group");
                self.state.notices.failure("Leave failed");
            }
        }
    }

    fn handle_compose_key(&mut self, key: KeyEvent) {
        let Some(views) = self.state.views.as_mut() else {
            return;
        };
        let compose = &mut views.compose;
        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        match key.code {
            KeyCode::Char('n') if ctrl => compose.cycle_recipient(1),
            KeyCode::Char('p') if ctrl => compose.cycle_recipient(-1),
            KeyCode::Char('t') if ctrl => compose.toggle_mode(),
            KeyCode::Down => compose.next_field(),
            KeyCode::Up => compose.previous_field(),
            KeyCode::Enter if key.modifiers.contains(KeyModifiers::ALT) => {
                if compose.field == ComposeField::Message {
                    compose.message.insert_char('\n');
                }
            }
            KeyCode::Enter => {
                let actions =
                    ActionDispatcher::new(self.store.as_ref(), self.clock.as_ref(), &views.session);
                match views.compose.submit(&actions, self.state.offset) {
                    Ok(delivery) => {
                        tracing::info!(id = %delivery.id, scheduled = delivery.scheduled, "letter sent");
                        self.state.notices.success(delivery.notice());
                    }
                    Err(err) => self.state.notices.write_failed("Send", &err),
                }
                self.sync_views();
            }
            _ => edit_text(compose.active_input(), key),
        }
    }

    fn handle_edit_key(&mut self, key: KeyEvent) {
        let Some(views) = self.state.views.as_mut() else {
            return;
        };
        match key.code {
            KeyCode::Esc => {
                views.sent.cancel_edit();
                self.state.notices.success("Edit cancelled");
            }
            KeyCode::Tab | KeyCode::BackTab | KeyCode::Up | KeyCode::Down => {
                if let Some(draft) = views.sent.editor_mut() {
                    draft.toggle_field();
                }
            }
            KeyCode::Enter => {
                let actions =
                    ActionDispatcher::new(self.store.as_ref(), self.clock.as_ref(), &views.session);
                match views.sent.submit_edit(&actions, self.state.offset) {
                    Ok(_) => self.state.notices.success("Updated!"),
                    Err(err) => self.state.notices.write_failed("Edit", &err),
                }
                self.sync_views();
            }
            _ => {
                if let Some(draft) = views.sent.editor_mut() {
                    edit_text(draft.active_mut(), key);
                }
            }
        }
    }

    fn handle_bulk(&mut self, delete: bool) {
        if self.state.focus != FocusPane::Inbox {
            return;
        }
        let Some(views) = self.state.views.as_mut() else {
            return;
        };
        if views.inbox.selection().is_empty() {
            self.state.notices.failure("Nothing selected");
            return;
        }
        let actions = ActionDispatcher::new(self.store.as_ref(), self.clock.as_ref(), &views.session);
        let (outcome, verb) = if delete {
            (views.inbox.bulk_delete(&actions), "Delete")
        } else {
            (views.inbox.bulk_mark_read(&actions), "Mark read")
        };
        let summary = outcome.summary(verb);
        if outcome.all_succeeded() {
            self.state.notices.success(summary);
        } else {
            self.state.notices.failure(summary);
        }
        self.sync_views();
    }

    fn handle_delete_sent(&mut self) {
        let Some(views) = self.state.views.as_mut() else {
            return;
        };
        let actions = ActionDispatcher::new(self.store.as_ref(), self.clock.as_ref(), &views.session);
        match views.sent.delete_focused(&actions) {
            Ok(Some(_)) => self.state.notices.success("Deleted"),
            Ok(None) => {}
            Err(err) => self.state.notices.write_failed("Delete", &err),
        }
        self.sync_views();
    }

    fn handle_toggle_star(&mut self) {
        if self.state.focus != FocusPane::Inbox {
            return;
        }
        let Some(views) = self.state.views.as_mut() else {
            return;
        };
        let actions = ActionDispatcher::new(self.store.as_ref(), self.clock.as_ref(), &views.session);
        match views.inbox.toggle_star(&actions) {
            Ok(Some(true)) => self.state.notices.success("Starred"),
            Ok(Some(false)) => self.state.notices.success("Unstarred"),
            Ok(None) => {}
            Err(err) => self.state.notices.write_failed("Star", &err),
        }
        self.sync_views();
    }

    fn handle_export(&mut self) {
        if self.state.focus != FocusPane::Inbox {
            return;
        }
        let Some(views) = self.state.views.as_ref() else {
            return;
        };
        let options = &self.config.export;
        match views
            .inbox
            .export_to(&options.output_path(), options, self.state.offset)
        {
            Ok(Some(path)) => self
                .state
                .notices
                .success(format!("Exported to {}", path.display())),
            Ok(None) => self.state.notices.failure("Nothing selected"),
            Err(err) => {
                tracing::error!(?err, "export failed");
                self.state.notices.failure(format!("Export failed: {err:#}"));
            }
        }
    }

    fn handle_begin_edit(&mut self) {
        if self.state.focus != FocusPane::Sent {
            return;
        }
        let now = self.clock.now();
        let Some(views) = self.state.views.as_mut() else {
            return;
        };
        if let Err(err) = views.sent.begin_edit(now, self.state.offset) {
            self.state.notices.write_failed("Edit", &err);
        }
    }
}

/// Shared line-editing keys for every text field.
fn edit_text(input: &mut TextInput, key: KeyEvent) {
    match key.code {
        KeyCode::Backspace => {
            input.backspace();
        }
        KeyCode::Delete => {
            input.delete();
        }
        KeyCode::Left => {
            input.move_left();
        }
        KeyCode::Right => {
            input.move_right();
        }
        KeyCode::Home => input.move_home(),
        KeyCode::End => input.move_end(),
        KeyCode::Char(ch)
            if !key.modifiers.intersects(
                KeyModifiers::CONTROL | KeyModifiers::ALT | KeyModifiers::SUPER,
            ) =>
        {
            input.insert_char(ch);
        }
        _ => {}
    }
}

fn setup_terminal() -> Result<Terminal<CrosstermBackend<Stdout>>> {
    enable_raw_mode().context("enabling raw mode")?;
    let mut stdout = std::io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)
        .context("switching to alternate screen")?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("creating terminal backend")?;
    terminal.hide_cursor().context("hiding cursor")?;
    Ok(terminal)
}

fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
    terminal.show_cursor().ok();
    disable_raw_mode().context("disabling raw mode")?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )
    .context("restoring screen state")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crossterm::event::KeyEventState;
    use tempfile::TempDir;

    fn press(code: KeyCode) -> KeyEvent {
        KeyEvent {
            code,
            modifiers: KeyModifiers::NONE,
            kind: KeyEventKind::Press,
            state: KeyEventState::NONE,
        }
    }

    fn ctrl(ch: char) -> KeyEvent {
        KeyEvent {
            modifiers: KeyModifiers::CONTROL,
            ..press(KeyCode::Char(ch))
        }
    }

    fn type_text(app: &mut App, text: &str) {
        for ch in text.chars() {
            app.handle_key(press(KeyCode::Char(ch)));
        }
    }

    fn app_in(temp: &TempDir) -> Result<App> {
        let paths = ConfigPaths::rooted_at(temp.path());
        let config = AppConfig {
            clock: crate::config::ClockOptions {
                use_store_clock: false,
                ..Default::default()
            },
            ..AppConfig::default()
        };
        let store = SqliteStore::open(&paths.database_path, &config.storage)?;
        App::new(Arc::new(config), store, &paths)
    }

    #[test]
    fn join_compose_and_leave_through_keys() -> Result<()> {
        let temp = TempDir::new()?;
        let mut app = app_in(&temp)?;
        assert!(!app.state().is_joined());

        type_text(&mut app, "family");
        app.handle_key(press(KeyCode::Tab));
        type_text(&mut app, "ann");
        app.handle_key(press(KeyCode::Enter));
        assert!(app.state().is_joined());
        assert_eq!(app.state().session().map(|s| s.user.as_str()), Some("ann"));

        app.handle_key(press(KeyCode::BackTab));
        assert_eq!(app.state().focus, FocusPane::Compose);
        type_text(&mut app, "bob");
        app.handle_key(press(KeyCode::Down));
        type_text(&mut app, "hello bob");
        app.handle_key(press(KeyCode::Enter));
        assert_eq!(
            app.state().notices.current().map(|n| n.message.as_str()),
            Some("Sent!")
        );
        let views = app.state().views.as_ref().expect("views");
        assert_eq!(views.sent.entries().len(), 1);
        assert!(views.compose.recipients().contains("bob"));

        app.handle_key(ctrl('l'));
        assert!(!app.state().is_joined());
        assert_eq!(app.store.active_subscriptions(), 0);

        let rejoined = app_in(&temp)?;
        assert!(!rejoined.state().is_joined());
        Ok(())
    }

    #[test]
    fn bulk_keys_report_tally_and_esc_dismisses() -> Result<()> {
        let temp = TempDir::new()?;
        let mut app = app_in(&temp)?;
        let bob = SessionContext {
            group_id: "family".into(),
            user: "bob".into(),
        };
        ActionDispatcher::new(app.store.as_ref(), &SystemClock, &bob).send("ann", "one", None)?;
        ActionDispatcher::new(app.store.as_ref(), &SystemClock, &bob).send("ann", "two", None)?;

        app.sessions.join("family", "ann")?;
        let session = app.sessions.current().cloned().expect("session");
        app.open_views(session);

        app.handle_key(press(KeyCode::Char('r')));
        assert_eq!(
            app.state().notices.current().map(|n| n.kind),
            Some(NoticeKind::Failure)
        );
        app.handle_key(press(KeyCode::Esc));
        assert!(app.state().notices.current().is_none());

        app.handle_key(press(KeyCode::Char('a')));
        app.handle_key(press(KeyCode::Char('r')));
        assert_eq!(
            app.state().notices.current().map(|n| n.message.as_str()),
            Some("Mark read: 2 ok, 0 failed")
        );
        let inbox = &app.state().views.as_ref().expect("views").inbox;
        assert!(inbox.selection().is_empty());
        assert_eq!(inbox.unread_count(), 0);
        Ok(())
    }
}
