use std::collections::BTreeSet;
use std::fmt;

use strum::{AsRefStr, EnumString};
use time::OffsetDateTime;

pub mod status;

pub use status::{
    distinct_participants, inbox_status, is_pending, sent_status, sort_for_inbox, sort_for_sent,
    InboxStatus, SentStatus,
};

/// Opaque letter identifier assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LetterId(String);

impl LetterId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix used when listing letters in a terminal.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(idx, _)| idx)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl From<String> for LetterId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for LetterId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for LetterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Letter {
    pub id: LetterId,
    pub group_id: String,
    pub from: String,
    pub to: String,
    pub message: String,
    pub deliver_at: OffsetDateTime,
    pub read_at: Option<OffsetDateTime>,
    pub starred_by: BTreeSet<String>,
    pub deleted_by_recipient: BTreeSet<String>,
    pub deleted_by_sender: BTreeSet<String>,
}

impl Letter {
    pub fn marks_mut(&mut self, set: MarkSet) -> &mut BTreeSet<String> {
        match set {
            MarkSet::Starred => &mut self.starred_by,
            MarkSet::DeletedByRecipient => &mut self.deleted_by_recipient,
            MarkSet::DeletedBySender => &mut self.deleted_by_sender,
        }
    }

    pub fn is_starred_by(&self, user: &str) -> bool {
        self.starred_by.contains(user)
    }
}

/// Per-user sets carried by a letter. The string form is what the store persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum MarkSet {
    Starred,
    DeletedByRecipient,
    DeletedBySender,
}

/// Fields supplied by the composer; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLetter {
    pub group_id: String,
    pub from: String,
    pub to: String,
    pub message: String,
    pub deliver_at: OffsetDateTime,
}

/// Equality filter for live queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LetterFilter {
    pub group_id: String,
    pub to: Option<String>,
    pub from: Option<String>,
}

impl LetterFilter {
    pub fn group(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            to: None,
            from: None,
        }
    }

    pub fn addressed_to(group_id: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            to: Some(user.into()),
            from: None,
        }
    }

    pub fn authored_by(group_id: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            to: None,
            from: Some(user.into()),
        }
    }

    pub fn matches(&self, letter: &Letter) -> bool {
        if letter.group_id != self.group_id {
            return false;
        }
        if let Some(to) = &self.to {
            if &letter.to != to {
                return false;
            }
        }
        if let Some(from) = &self.from {
            if &letter.from != from {
                return false;
            }
        }
        true
    }
}

/// Conditions the store evaluates atomically with an update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchGuard {
    pub sender: Option<String>,
    pub recipient: Option<String>,
    /// Reject the write unless `deliver_at` is still after this instant.
    pub pending_at: Option<OffsetDateTime>,
}

/// Partial update merged into an existing letter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LetterPatch {
    pub message: Option<String>,
    pub deliver_at: Option<OffsetDateTime>,
    /// Stamped only when the letter has no `read_at` yet.
    pub read_at: Option<OffsetDateTime>,
    pub add_marks: Vec<(MarkSet, String)>,
    pub remove_marks: Vec<(MarkSet, String)>,
    pub guard: PatchGuard,
}

impl LetterPatch {
    pub fn mark_read(at: OffsetDateTime, recipient: &str) -> Self {
        Self {
            read_at: Some(at),
            guard: PatchGuard {
                recipient: Some(recipient.to_string()),
                ..PatchGuard::default()
            },
            ..Self::default()
        }
    }

    pub fn add_mark(set: MarkSet, user: &str) -> Self {
        Self {
            add_marks: vec![(set, user.to_string())],
            ..Self::default()
        }
    }

    pub fn remove_mark(set: MarkSet, user: &str) -> Self {
        Self {
            remove_marks: vec![(set, user.to_string())],
            ..Self::default()
        }
    }

    pub fn has_field_changes(&self) -> bool {
        self.message.is_some() || self.deliver_at.is_some() || self.read_at.is_some()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_field_changes() && self.add_marks.is_empty() && self.remove_marks.is_empty()
    }

    /// Applies the merge to an in-memory copy, mirroring what the store does.
    pub fn apply_to(&self, letter: &mut Letter) {
        if let Some(message) = &self.message {
            letter.message = message.clone();
        }
        if let Some(deliver_at) = self.deliver_at {
            letter.deliver_at = deliver_at;
        }
        if letter.read_at.is_none() {
            letter.read_at = self.read_at;
        }
        for (set, user) in &self.add_marks {
            letter.marks_mut(*set).insert(user.clone());
        }
        for (set, user) in &self.remove_marks {
            letter.marks_mut(*set).remove(user);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::{letter, T0};
    use super::*;
    use std::str::FromStr;
    use time::Duration;

    #[test]
    fn mark_set_names_round_trip_through_strum() {
        assert_eq!(MarkSet::DeletedByRecipient.as_ref(), "deleted-by-recipient");
        assert_eq!(MarkSet::from_str("starred").ok(), Some(MarkSet::Starred));
        assert!(MarkSet::from_str("bogus").is_err());
    }

    #[test]
    fn filter_matches_on_group_and_participants() {
        let l = letter("a", "ann", "bob", T0);
        assert!(LetterFilter::group("g1").matches(&l));
        assert!(LetterFilter::addressed_to("g1", "bob").matches(&l));
        assert!(!LetterFilter::addressed_to("g1", "ann").matches(&l));
        assert!(LetterFilter::authored_by("g1", "ann").matches(&l));
        assert!(!LetterFilter::group("g2").matches(&l));
    }

    #[test]
    fn patch_keeps_first_read_stamp() {
        let mut l = letter("a", "ann", "bob", T0);
        LetterPatch::mark_read(T0, "bob").apply_to(&mut l);
        LetterPatch::mark_read(T0 + Duration::hours(1), "bob").apply_to(&mut l);
        assert_eq!(l.read_at, Some(T0));
    }

    #[test]
    fn short_id_truncates_to_eight_chars() {
        let id = LetterId::from("0123456789abcdef");
        assert_eq!(id.short(), "01234567");
        assert_eq!(LetterId::from("abc").short(), "abc");
    }
}
