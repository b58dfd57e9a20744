use std::time::Duration;

use time::{OffsetDateTime, UtcOffset};
use unicode_segmentation::UnicodeSegmentation;

use crate::session::SessionContext;
use crate::store::{LetterStore, StoreResult};

use super::compose::ComposeView;
use super::inbox::InboxView;
use super::notice::Notices;
use super::sent::SentView;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusPane {
    Compose,
    Inbox,
    Sent,
}

impl FocusPane {
    pub fn next(self) -> Self {
        match self {
            FocusPane::Compose => FocusPane::Inbox,
            FocusPane::Inbox => FocusPane::Sent,
            FocusPane::Sent => FocusPane::Compose,
        }
    }

    pub fn previous(self) -> Self {
        match self {
            FocusPane::Compose => FocusPane::Sent,
            FocusPane::Inbox => FocusPane::Compose,
            FocusPane::Sent => FocusPane::Inbox,
        }
    }
}

/// Editable text with a grapheme-aware cursor (byte offset into `buffer`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextInput {
    buffer: String,
    cursor: usize,
}

impl TextInput {
    pub fn new(text: impl Into<String>) -> Self {
        let buffer = text.into();
        let cursor = buffer.len();
        Self { buffer, cursor }
    }

    pub fn value(&self) -> &str {
        &self.buffer
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn is_blank(&self) -> bool {
        self.buffer.trim().is_empty()
    }

    pub fn set(&mut self, text: impl Into<String>) {
        self.buffer = text.into();
        self.cursor = self.buffer.len();
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.cursor = 0;
    }

    pub fn insert_char(&mut self, ch: char) {
        let mut scratch = [0u8; 4];
        let encoded = ch.encode_utf8(&mut scratch);
        self.buffer.insert_str(self.cursor, encoded);
        self.cursor += encoded.len();
    }

    pub fn backspace(&mut self) -> bool {
        if self.cursor == 0 {
            return false;
        }
        let prev = prev_grapheme_boundary(&self.buffer, self.cursor);
        self.buffer.drain(prev..self.cursor);
        self.cursor = prev;
        true
    }

    pub fn delete(&mut self) -> bool {
        let next = next_grapheme_boundary(&self.buffer, self.cursor);
        if next == self.cursor {
            return false;
        }
        self.buffer.drain(self.cursor..next);
        true
    }

    pub fn move_left(&mut self) -> bool {
        if self.cursor == 0 {
            return false;
        }
        self.cursor = prev_grapheme_boundary(&self.buffer, self.cursor);
        true
    }

    pub fn move_right(&mut self) -> bool {
        let next = next_grapheme_boundary(&self.buffer, self.cursor);
        if next == self.cursor {
            return false;
        }
        self.cursor = next;
        true
    }

    pub fn move_home(&mut self) {
        self.cursor = 0;
    }

    pub fn move_end(&mut self) {
        self.cursor = self.buffer.len();
    }
}

fn prev_grapheme_boundary(text: &str, cursor: usize) -> usize {
    text[..cursor]
        .grapheme_indices(true)
        .last()
        .map(|(idx, _)| idx)
        .unwrap_or(0)
}

fn next_grapheme_boundary(text: &str, cursor: usize) -> usize {
    text[cursor..]
        .graphemes(true)
        .next()
        .map(|grapheme| cursor + grapheme.len())
        .unwrap_or(text.len())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinField {
    Group,
    Name,
}

#[derive(Debug, Clone)]
pub struct JoinForm {
    pub group: TextInput,
    pub name: TextInput,
    pub field: JoinField,
}

impl Default for JoinForm {
    fn default() -> Self {
        Self {
            group: TextInput::default(),
            name: TextInput::default(),
            field: JoinField::Group,
        }
    }
}

impl JoinForm {
    pub fn active_mut(&mut self) -> &mut TextInput {
        match self.field {
            JoinField::Group => &mut self.group,
            JoinField::Name => &mut self.name,
        }
    }

    pub fn toggle_field(&mut self) {
        self.field = match self.field {
            JoinField::Group => JoinField::Name,
            JoinField::Name => JoinField::Group,
        };
    }
}

/// The three views of a joined session. Dropping it releases their subscriptions.
pub struct LetterViews {
    pub session: SessionContext,
    pub compose: ComposeView,
    pub inbox: InboxView,
    pub sent: SentView,
}

impl LetterViews {
    pub fn open(
        store: &dyn LetterStore,
        session: SessionContext,
        now: OffsetDateTime,
    ) -> StoreResult<Self> {
        let mut views = Self {
            compose: ComposeView::open(store, &session)?,
            inbox: InboxView::open(store, &session)?,
            sent: SentView::open(store, &session)?,
            session,
        };
        views.sync(now);
        Ok(views)
    }

    /// Drains pending snapshots and re-derives against `now`.
    pub fn sync(&mut self, now: OffsetDateTime) -> bool {
        let compose = self.compose.sync();
        let inbox = self.inbox.sync(now);
        let sent = self.sent.sync(now);
        compose || inbox || sent
    }
}

pub struct AppState {
    pub focus: FocusPane,
    pub join: JoinForm,
    pub views: Option<LetterViews>,
    pub notices: Notices,
    pub offset: UtcOffset,
}

impl AppState {
    pub fn new(notice_ttl: Duration, offset: UtcOffset) -> Self {
        Self {
            focus: FocusPane::Inbox,
            join: JoinForm::default(),
            views: None,
            notices: Notices::new(notice_ttl),
            offset,
        }
    }

    pub fn is_joined(&self) -> bool {
        self.views.is_some()
    }

    pub fn session(&self) -> Option<&SessionContext> {
        self.views.as_ref().map(|views| &views.session)
    }

    pub fn enter(&mut self, views: LetterViews) {
        self.views = Some(views);
        self.focus = FocusPane::Inbox;
        self.join = JoinForm::default();
    }

    pub fn leave(&mut self) {
        self.views = None;
        self.focus = FocusPane::Inbox;
    }

    pub fn is_editing_sent(&self) -> bool {
        self.views
            .as_ref()
            .map(|views| views.sent.editor().is_some())
            .unwrap_or(false)
    }
}
