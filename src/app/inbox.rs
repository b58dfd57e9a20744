use std::path::{Path, PathBuf};

use indexmap::IndexSet;
use time::{OffsetDateTime, UtcOffset};

use crate::config::ExportOptions;
use crate::export::{self, ExportDocument};
use crate::letters::{inbox_status, sort_for_inbox, InboxStatus, Letter, LetterFilter, LetterId};
use crate::session::SessionContext;
use crate::store::{LetterStore, StoreResult, Subscription};

use super::actions::{ActionDispatcher, BulkOutcome, WriteResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxEntry {
    pub letter: Letter,
    pub status: InboxStatus,
    pub starred: bool,
}

/// Letters delivered to the current user, plus the bulk selection over them.
pub struct InboxView {
    subscription: Option<Subscription>,
    user: String,
    letters: Vec<Letter>,
    entries: Vec<InboxEntry>,
    selection: IndexSet<LetterId>,
    cursor: usize,
}

impl InboxView {
    pub fn new(session: &SessionContext) -> Self {
        Self {
            subscription: None,
            user: session.user.clone(),
            letters: Vec::new(),
            entries: Vec::new(),
            selection: IndexSet::new(),
            cursor: 0,
        }
    }

    pub fn open(store: &dyn LetterStore, session: &SessionContext) -> StoreResult<Self> {
        let mut view = Self::new(session);
        view.subscription = Some(store.subscribe(LetterFilter::addressed_to(
            &session.group_id,
            &session.user,
        ))?);
        Ok(view)
    }

    /// Takes the newest snapshot, if any, and re-derives against `now`.
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
        let mut entries: Vec<InboxEntry> = self
            .letters
            .iter()
            .filter_map(|letter| {
                inbox_status(letter, &self.user, now).map(|status| InboxEntry {
                    starred: letter.is_starred_by(&self.user),
                    letter: letter.clone(),
                    status,
                })
            })
            .collect();
        sort_for_inbox(&mut entries, |entry| entry.letter.deliver_at);
        self.entries = entries;

        let entries = &self.entries;
        self.selection
            .retain(|id| entries.iter().any(|entry| &entry.letter.id == id));

        self.cursor = focused
            .and_then(|id| self.position(&id))
            .unwrap_or(self.cursor)
            .min(self.entries.len().saturating_sub(1));
    }

    pub fn entries(&self) -> &[InboxEntry] {
        &self.entries
    }

    pub fn unread_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| !entry.status.is_read())
            .count()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn focused(&self) -> Option<&InboxEntry> {
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

    pub fn selection(&self) -> &IndexSet<LetterId> {
        &self.selection
    }

    pub fn is_selected(&self, id: &LetterId) -> bool {
        self.selection.contains(id)
    }

    /// Ids that are not currently visible are ignored.
    pub fn toggle_selected(&mut self, id: &LetterId) -> bool {
        if self.position(id).is_none() {
            return false;
        }
        if !self.selection.shift_remove(id) {
            self.selection.insert(id.clone());
        }
        true
    }

    pub fn toggle_focused(&mut self) -> bool {
        match self.focused().map(|entry| entry.letter.id.clone()) {
            Some(id) => self.toggle_selected(&id),
            None => false,
        }
    }

    pub fn select_all(&mut self) {
        self.selection = self
            .entries
            .iter()
            .map(|entry| entry.letter.id.clone())
            .collect();
    }

    pub fn clear_selection(&mut self) {
        self.selection.clear();
    }

    /// Selected ids in display order.
    pub fn selected_ids(&self) -> Vec<LetterId> {
        self.entries
            .iter()
            .filter(|entry| self.selection.contains(&entry.letter.id))
            .map(|entry| entry.letter.id.clone())
            .collect()
    }

    pub fn bulk_mark_read(&mut self, actions: &ActionDispatcher<'_>) -> BulkOutcome {
        self.run_bulk(actions, |actions, id| actions.mark_read(id))
    }

    pub fn bulk_delete(&mut self, actions: &ActionDispatcher<'_>) -> BulkOutcome {
        self.run_bulk(actions, |actions, id| actions.delete_received(id))
    }

    fn run_bulk<F>(&mut self, actions: &ActionDispatcher<'_>, op: F) -> BulkOutcome
    where
        F: Fn(&ActionDispatcher<'_>, &LetterId) -> WriteResult<()> + Sync,
    {
        let ids = self.selected_ids();
        if ids.is_empty() {
            return BulkOutcome::default();
        }
        let outcome = actions.for_each_concurrently(&ids, op);
        for id in &outcome.succeeded {
            self.selection.shift_remove(id);
        }
        tracing::info!(
            ok = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            "bulk inbox action finished"
        );
        outcome
    }

    /// Stars or unstars the focused letter; returns the new state.
    pub fn toggle_star(&self, actions: &ActionDispatcher<'_>) -> WriteResult<Option<bool>> {
        let Some(entry) = self.focused() else {
            return Ok(None);
        };
        let starred = !entry.starred;
        actions.set_starred(&entry.letter.id, starred)?;
        Ok(Some(starred))
    }

    /// Selected letters laid out in display order; empty when nothing is selected.
    pub fn export(&self, options: &ExportOptions, offset: UtcOffset) -> ExportDocument {
        let selected = self
            .entries
            .iter()
            .filter(|entry| self.selection.contains(&entry.letter.id))
            .map(|entry| &entry.letter);
        export::layout(selected, options, offset)
    }

    pub fn export_to(
        &self,
        path: &Path,
        options: &ExportOptions,
        offset: UtcOffset,
    ) -> anyhow::Result<Option<PathBuf>> {
        let document = self.export(options, offset);
        if document.is_empty() {
            return Ok(None);
        }
        export::write_document(&document, path).map(Some)
    }

    fn position(&self, id: &LetterId) -> Option<usize> {
        self.entries.iter().position(|entry| &entry.letter.id == id)
    }
}
