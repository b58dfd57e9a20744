use std::thread;

use time::OffsetDateTime;

use crate::clock::Clock;
use crate::letters::{LetterId, LetterPatch, MarkSet, NewLetter, PatchGuard};
use crate::session::SessionContext;
use crate::store::{LetterStore, StoreError};

pub type WriteError = StoreError;
pub type WriteResult<T> = Result<T, WriteError>;

/// Per-item result of a fan-out write.
#[derive(Debug, Default)]
pub struct BulkOutcome {
    pub succeeded: Vec<LetterId>,
    pub failed: Vec<(LetterId, WriteError)>,
}

impl BulkOutcome {
    pub fn is_empty(&self) -> bool {
        self.succeeded.is_empty() && self.failed.is_empty()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn summary(&self, verb: &str) -> String {
        format!(
            "{verb}: {} ok, {} failed",
            self.succeeded.len(),
            self.failed.len()
        )
    }
}

/// Every write a user can make, scoped to their session.
#[derive(Clone, Copy)]
pub struct ActionDispatcher<'a> {
    store: &'a dyn LetterStore,
    clock: &'a dyn Clock,
    session: &'a SessionContext,
}

impl<'a> ActionDispatcher<'a> {
    pub fn new(
        store: &'a dyn LetterStore,
        clock: &'a dyn Clock,
        session: &'a SessionContext,
    ) -> Self {
        Self {
            store,
            clock,
            session,
        }
    }

    /// `None` delivers immediately.
    pub fn send(
        &self,
        to: &str,
        message: &str,
        deliver_at: Option<OffsetDateTime>,
    ) -> WriteResult<LetterId> {
        let to = to.trim();
        if to.is_empty() {
            return Err(StoreError::validation("recipient is required"));
        }
        if message.trim().is_empty() {
            return Err(StoreError::validation("message cannot be empty"));
        }
        let deliver_at = deliver_at.unwrap_or_else(|| self.clock.now());
        self.store.create(NewLetter {
            group_id: self.session.group_id.clone(),
            from: self.session.user.clone(),
            to: to.to_string(),
            message: message.to_string(),
            deliver_at,
        })
    }

    pub fn mark_read(&self, id: &LetterId) -> WriteResult<()> {
        let patch = LetterPatch::mark_read(self.clock.now(), &self.session.user);
        self.store.update(id, &patch)
    }

    pub fn delete_received(&self, id: &LetterId) -> WriteResult<()> {
        let mut patch = LetterPatch::add_mark(MarkSet::DeletedByRecipient, &self.session.user);
        patch.guard = self.as_recipient();
        self.store.update(id, &patch)
    }

    pub fn delete_sent(&self, id: &LetterId) -> WriteResult<()> {
        let mut patch = LetterPatch::add_mark(MarkSet::DeletedBySender, &self.session.user);
        patch.guard = self.as_sender();
        self.store.update(id, &patch)
    }

    pub fn set_starred(&self, id: &LetterId, starred: bool) -> WriteResult<()> {
        let mut patch = if starred {
            LetterPatch::add_mark(MarkSet::Starred, &self.session.user)
        } else {
            LetterPatch::remove_mark(MarkSet::Starred, &self.session.user)
        };
        patch.guard = self.as_recipient();
        self.store.update(id, &patch)
    }

    /// Replaces the body and/or delivery time of a letter that is still pending.
    pub fn edit(
        &self,
        id: &LetterId,
        message: Option<&str>,
        deliver_at: Option<OffsetDateTime>,
    ) -> WriteResult<()> {
        let message = message.map(str::trim);
        if message.is_some_and(str::is_empty) {
            return Err(StoreError::validation("message cannot be empty"));
        }
        if message.is_none() && deliver_at.is_none() {
            return Err(StoreError::validation("nothing to change"));
        }
        let mut guard = self.as_sender();
        guard.pending_at = Some(self.clock.now());
        let patch = LetterPatch {
            message: message.map(str::to_string),
            deliver_at,
            guard,
            ..LetterPatch::default()
        };
        self.store.update(id, &patch)
    }

    /// Runs `op` for every id on its own scoped thread and gathers the results.
    pub fn for_each_concurrently<F>(&self, ids: &[LetterId], op: F) -> BulkOutcome
    where
        F: Fn(&Self, &LetterId) -> WriteResult<()> + Sync,
    {
        let (tx, rx) = crossbeam_channel::unbounded();
        thread::scope(|scope| {
            for id in ids {
                let tx = tx.clone();
                let op = &op;
                let dispatcher = *self;
                scope.spawn(move || {
                    let result = op(&dispatcher, id);
                    // The receiver outlives the scope.
                    let _ = tx.send((id.clone(), result));
                });
            }
        });
        drop(tx);

        let mut outcome = BulkOutcome::default();
        for (id, result) in rx.try_iter() {
            match result {
                Ok(()) => outcome.succeeded.push(id),
                Err(err) => {
                    tracing::warn!(?err, %id, "bulk write failed");
                    outcome.failed.push((id, err));
                }
            }
        }
        outcome
    }

    fn as_sender(&self) -> PatchGuard {
        PatchGuard {
            sender: Some(self.session.user.clone()),
            ..PatchGuard::default()
        }
    }

    fn as_recipient(&self) -> PatchGuard {
        PatchGuard {
            recipient: Some(self.session.user.clone()),
            ..PatchGuard::default()
        }
    }
}
