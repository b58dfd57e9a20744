use time::{OffsetDateTime, UtcOffset};

use crate::letters::{
    is_pending, sent_status, sort_for_sent, Letter, LetterFilter, LetterId, SentStatus,
};
use crate::session::SessionContext;
use crate::store::{LetterStore, StoreError, StoreResult, Subscription};

use super::actions::{ActionDispatcher, WriteResult};
use super::compose::{format_deliver_at, parse_deliver_at};
use super::state::TextInput;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentEntry {
    pub letter: Letter,
    pub status: SentStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditField {
    Message,
    When,
}

/// In-progress edit of a pending letter.
#[derive(Debug, Clone)]
pub struct EditDraft {
    pub id: LetterId,
    pub message: TextInput,
    pub when: TextInput,
    pub field: EditField,
}

impl EditDraft {
    pub fn active_mut(&mut self) -> &mut TextInput {
        match self.field {
            EditField::Message => &mut self.message,
            EditField::When => &mut self.when,
        }
    }

    pub fn toggle_field(&mut self) {
        self.field = match self.field {
            EditField::Message => EditField::When,
            EditField::When => EditField::Message,
        };
    }
}

pub struct SentView {
    subscription: Option<Subscription>,
    user: String,
    letters: Vec<Letter>,
    entries: Vec<SentEntry>,
    cursor: usize,
    editor: Option<EditDraft>,
}

impl SentView {
    pub fn new(session: &SessionContext) -> Self {
        Self {
            subscription: None,
            user: session.user.clone(),
            letters: Vec::new(),
            entries: Vec::new(),
            cursor: 0,
            editor: None,
        }
    }

    pub fn open(store: &dyn LetterStore, session: &SessionContext) -> StoreResult<Self> {
        let mut view = Self::new(session);
        view.subscription = Some(store.subscribe(LetterFilter::authored_by(
            &session.group_id,
            &session.user,
        ))?);
        Ok(view)
    }

    pub fn sync(&mut self, now: OffsetDateTime) -> bool {
        let snapshot = self.subscription.as_ref().and_then(Subscription::latest);
        let changed = snapshot.is_some();
        if let Some(snapshot) = snapshot {
            self.letters = snapshot.letters;
        }
        self.rederive(now);
        changed
    }

    pub fn apply_snapshot(&mut self, letters: Vec<Letter>, now: OffsetDateTime) {
        self.letters = letters;
        self.rederive(now);
    }

    pub fn rederive(&mut self, now: OffsetDateTime) {
        let focused = self.focused().map(|entry| entry.letter.id.clone());
        let mut entries: Vec<SentEntry> = self
            .letters
            .iter()
            .filter_map(|letter| {
                sent_status(letter, &self.user, now).map(|status| SentEntry {
                    letter: letter.clone(),
                    status,
                })
            })
            .collect();
        sort_for_sent(&mut entries, |entry| entry.letter.deliver_at);
        self.entries = entries;
        self.cursor = focused
            .and_then(|id| self.entries.iter().position(|entry| entry.letter.id == id))
            .unwrap_or(self.cursor)
            .min(self.entries.len().saturating_sub(1));
    }

    pub fn entries(&self) -> &[SentEntry] {
        &self.entries
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn focused(&self) -> Option<&SentEntry> {
        self.entries.get(self.cursor)
    }

    pub fn move_cursor(&mut self, delta: isize) {
        if self.entries.is_empty() {
            self.cursor = 0;
            return;
        }
        let max = self.entries.len() as isize - 1;
        self.cursor = (self.cursor as isize + delta).clamp(0, max) as usize;
    }

    /// Hides the focused letter from the sender's list only.
    pub fn delete_focused(&self, actions: &ActionDispatcher<'_>) -> WriteResult<Option<LetterId>> {
        let Some(entry) = self.focused() else {
            return Ok(None);
        };
        actions.delete_sent(&entry.letter.id)?;
        Ok(Some(entry.letter.id.clone()))
    }

    pub fn editor(&self) -> Option<&EditDraft> {
        self.editor.as_ref()
    }

    pub fn editor_mut(&mut self) -> Option<&mut EditDraft> {
        self.editor.as_mut()
    }

    /// Opens the editor on the focused letter, prefilled with its current values.
    pub fn begin_edit(&mut self, now: OffsetDateTime, offset: UtcOffset) -> WriteResult<()> {
        let Some(entry) = self.focused() else {
            return Err(StoreError::validation("no letter selected"));
        };
        if !is_pending(&entry.letter, now) {
            return Err(StoreError::validation(
                "only letters that are still pending can be edited",
            ));
        }
        let draft = EditDraft {
            id: entry.letter.id.clone(),
            message: TextInput::new(entry.letter.message.clone()),
            when: TextInput::new(format_deliver_at(entry.letter.deliver_at, offset)),
            field: EditField::Message,
        };
        self.editor = Some(draft);
        Ok(())
    }

    pub fn cancel_edit(&mut self) -> bool {
        self.editor.take().is_some()
    }

    /// Writes the draft. The editor stays open when the write is rejected.
    pub fn submit_edit(
        &mut self,
        actions: &ActionDispatcher<'_>,
        offset: UtcOffset,
    ) -> WriteResult<LetterId> {
        let Some(draft) = self.editor.as_ref() else {
            return Err(StoreError::validation("no edit in progress"));
        };
        let deliver_at = parse_deliver_at(draft.when.value(), offset)?;
        actions.edit(&draft.id, Some(draft.message.value()), Some(deliver_at))?;
        let id = draft.id.clone();
        self.editor = None;
        Ok(id)
    }
}
