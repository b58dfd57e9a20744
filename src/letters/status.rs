//! Pure visibility and status derivation over `{deliver_at, read_at, deleted_by_*}`
//! and a caller-supplied `now`.

use indexmap::IndexSet;
use time::{OffsetDateTime, UtcOffset};

use crate::clock::display_time;

use super::Letter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxStatus {
    Unread,
    Read { at: OffsetDateTime },
}

impl InboxStatus {
    pub fn is_read(&self) -> bool {
        matches!(self, InboxStatus::Read { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            InboxStatus::Unread => "Unread",
            InboxStatus::Read { .. } => "Read",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentStatus {
    Pending,
    Unread,
    Read { at: OffsetDateTime },
}

impl SentStatus {
    pub fn describe(&self, offset: UtcOffset) -> String {
        match self {
            SentStatus::Pending => "Pending".to_string(),
            SentStatus::Unread => "Unread".to_string(),
            SentStatus::Read { at } => format!("Read at {}", display_time(*at, offset)),
        }
    }
}

pub fn is_pending(letter: &Letter, now: OffsetDateTime) -> bool {
    letter.deliver_at > now
}

/// `None` means the letter is hidden from `user`'s inbox.
pub fn inbox_status(letter: &Letter, user: &str, now: OffsetDateTime) -> Option<InboxStatus> {
    if letter.to != user || is_pending(letter, now) || letter.deleted_by_recipient.contains(user) {
        return None;
    }
    Some(match letter.read_at {
        Some(at) => InboxStatus::Read { at },
        None => InboxStatus::Unread,
    })
}

/// `None` means the letter is hidden from `user`'s sent list.
pub fn sent_status(letter: &Letter, user: &str, now: OffsetDateTime) -> Option<SentStatus> {
    if letter.from != user || letter.deleted_by_sender.contains(user) {
        return None;
    }
    if is_pending(letter, now) {
        return Some(SentStatus::Pending);
    }
    Some(match letter.read_at {
        Some(at) => SentStatus::Read { at },
        None => SentStatus::Unread,
    })
}

/// Most recently delivered first; stable for equal instants.
pub fn sort_for_inbox<T>(items: &mut [T], deliver_at: impl Fn(&T) -> OffsetDateTime) {
    items.sort_by(|a, b| deliver_at(b).cmp(&deliver_at(a)));
}

/// Soonest delivery first; stable for equal instants.
pub fn sort_for_sent<T>(items: &mut [T], deliver_at: impl Fn(&T) -> OffsetDateTime) {
    items.sort_by_key(|item| deliver_at(item));
}

/// Everyone who appears as sender or recipient, minus `current_user`, in first-seen order.
pub fn distinct_participants<'a, I>(letters: I, current_user: &str) -> IndexSet<String>
where
    I: IntoIterator<Item = &'a Letter>,
{
    let mut names = IndexSet::new();
    for letter in letters {
        for name in [&letter.from, &letter.to] {
            let name = name.trim();
            if !name.is_empty() && name != current_user && !names.contains(name) {
                names.insert(name.to_string());
            }
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::letters::fixtures::{letter, T0};
    use time::Duration;

    #[test]
    fn inbox_hides_undelivered_and_recipient_deleted_letters() {
        let delivered = letter("a", "ann", "bob", T0 - Duration::minutes(1));
        assert_eq!(inbox_status(&delivered, "bob", T0), Some(InboxStatus::Unread));
        assert_eq!(inbox_status(&delivered, "ann", T0), None);

        let future = letter("b", "ann", "bob", T0 + Duration::minutes(1));
        assert_eq!(inbox_status(&future, "bob", T0), None);

        let mut deleted = delivered.clone();
        deleted.deleted_by_recipient.insert("bob".into());
        assert_eq!(inbox_status(&deleted, "bob", T0), None);

        let mut deleted_by_other = delivered.clone();
        deleted_by_other.deleted_by_recipient.insert("carol".into());
        assert!(inbox_status(&deleted_by_other, "bob", T0).is_some());
    }

    #[test]
    fn delivery_instant_equal_to_now_is_visible() {
        let exact = letter("a", "ann", "bob", T0);
        assert_eq!(inbox_status(&exact, "bob", T0), Some(InboxStatus::Unread));
        assert_eq!(sent_status(&exact, "ann", T0), Some(SentStatus::Unread));
    }

    #[test]
    fn sent_status_derives_pending_unread_read() {
        let mut l = letter("a", "ann", "bob", T0 + Duration::hours(1));
        assert_eq!(sent_status(&l, "ann", T0), Some(SentStatus::Pending));
        assert_eq!(
            sent_status(&l, "ann", T0 + Duration::hours(2)),
            Some(SentStatus::Unread)
        );

        let read_at = T0 + Duration::hours(3);
        l.read_at = Some(read_at);
        assert_eq!(
            sent_status(&l, "ann", T0 + Duration::hours(4)),
            Some(SentStatus::Read { at: read_at })
        );
        assert_eq!(sent_status(&l, "bob", T0), None);

        l.deleted_by_sender.insert("ann".into());
        assert_eq!(sent_status(&l, "ann", T0), None);
    }

    #[test]
    fn sender_deletion_does_not_touch_inbox_visibility() {
        let mut l = letter("a", "ann", "bob", T0);
        l.deleted_by_sender.insert("ann".into());
        assert_eq!(inbox_status(&l, "bob", T0), Some(InboxStatus::Unread));
    }

    #[test]
    fn sorting_is_stable_for_ties() {
        let mut items = vec![
            letter("first", "a", "b", T0),
            letter("late", "a", "b", T0 + Duration::hours(1)),
            letter("second", "a", "b", T0),
        ];
        sort_for_inbox(&mut items, |l| l.deliver_at);
        let ids: Vec<_> = items.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["late", "first", "second"]);

        sort_for_sent(&mut items, |l| l.deliver_at);
        let ids: Vec<_> = items.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second", "late"]);
    }

    #[test]
    fn participants_exclude_current_user_and_ignore_state() {
        let mut hidden = letter("a", "ann", "bob", T0 + Duration::days(3));
        hidden.deleted_by_recipient.insert("bob".into());
        let letters = vec![
            hidden,
            letter("b", "carol", "ann", T0),
            letter("c", "bob", "carol", T0),
        ];
        let names: Vec<_> = distinct_participants(&letters, "ann").into_iter().collect();
        assert_eq!(names, vec!["bob".to_string(), "carol".to_string()]);
    }
}
