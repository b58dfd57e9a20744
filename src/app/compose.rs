use indexmap::IndexSet;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

use crate::letters::{distinct_participants, Letter, LetterFilter, LetterId};
use crate::session::SessionContext;
use crate::store::{LetterStore, StoreError, StoreResult, Subscription};

use super::actions::{ActionDispatcher, WriteResult};
use super::state::TextInput;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Now,
    Later,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposeField {
    To,
    Message,
    When,
}

/// A successfully submitted letter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: LetterId,
    pub scheduled: bool,
}

impl Delivery {
    pub fn notice(&self) -> &'static str {
        if self.scheduled {
            "Scheduled!"
        } else {
            "Sent!"
        }
    }
}

pub struct ComposeView {
    subscription: Option<Subscription>,
    user: String,
    recipients: IndexSet<String>,
    recipient_index: Option<usize>,
    pub to: TextInput,
    pub message: TextInput,
    pub when: TextInput,
    pub mode: DeliveryMode,
    pub field: ComposeField,
}

impl ComposeView {
    pub fn new(session: &SessionContext) -> Self {
        Self {
            subscription: None,
            user: session.user.clone(),
            recipients: IndexSet::new(),
            recipient_index: None,
            to: TextInput::default(),
            message: TextInput::default(),
            when: TextInput::default(),
            mode: DeliveryMode::Now,
            field: ComposeField::To,
        }
    }

    /// Watches every letter in the group to discover recipients.
    pub fn open(store: &dyn LetterStore, session: &SessionContext) -> StoreResult<Self> {
        let mut view = Self::new(session);
        view.subscription = Some(store.subscribe(LetterFilter::group(&session.group_id))?);
        Ok(view)
    }

    pub fn sync(&mut self) -> bool {
        let Some(snapshot) = self.subscription.as_ref().and_then(Subscription::latest) else {
            return false;
        };
        self.apply_snapshot(&snapshot.letters);
        true
    }

    pub fn apply_snapshot(&mut self, letters: &[Letter]) {
        self.recipients = distinct_participants(letters, &self.user);
        if let Some(idx) = self.recipient_index {
            if idx >= self.recipients.len() {
                self.recipient_index = None;
            }
        }
    }

    pub fn recipients(&self) -> &IndexSet<String> {
        &self.recipients
    }

    /// Steps through discovered recipients and fills the "to" field.
    pub fn cycle_recipient(&mut self, delta: isize) {
        let len = self.recipients.len();
        if len == 0 {
            return;
        }
        let next = match self.recipient_index {
            None if delta < 0 => len - 1,
            None => 0,
            Some(idx) => (idx as isize + delta).rem_euclid(len as isize) as usize,
        };
        self.recipient_index = Some(next);
        if let Some(name) = self.recipients.get_index(next) {
            self.to.set(name.clone());
        }
    }

    pub fn toggle_mode(&mut self) {
        self.mode = match self.mode {
            DeliveryMode::Now => DeliveryMode::Later,
            DeliveryMode::Later => DeliveryMode::Now,
        };
        if self.mode == DeliveryMode::Now && self.field == ComposeField::When {
            self.field = ComposeField::Message;
        }
    }

    pub fn next_field(&mut self) {
        self.field = match (self.field, self.mode) {
            (ComposeField::To, _) => ComposeField::Message,
            (ComposeField::Message, DeliveryMode::Later) => ComposeField::When,
            (ComposeField::Message, DeliveryMode::Now) | (ComposeField::When, _) => ComposeField::To,
        };
    }

    pub fn previous_field(&mut self) {
        self.field = match (self.field, self.mode) {
            (ComposeField::To, DeliveryMode::Later) => ComposeField::When,
            (ComposeField::To, DeliveryMode::Now) => ComposeField::Message,
            (ComposeField::Message, _) => ComposeField::To,
            (ComposeField::When, _) => ComposeField::Message,
        };
    }

    pub fn active_input(&mut self) -> &mut TextInput {
        match self.field {
            ComposeField::To => &mut self.to,
            ComposeField::Message => &mut self.message,
            ComposeField::When => &mut self.when,
        }
    }

    pub fn submit(
        &mut self,
        actions: &ActionDispatcher<'_>,
        offset: UtcOffset,
    ) -> WriteResult<Delivery> {
        match self.mode {
            DeliveryMode::Now => self.send_now(actions),
            DeliveryMode::Later => self.send_later(actions, offset),
        }
    }

    pub fn send_now(&mut self, actions: &ActionDispatcher<'_>) -> WriteResult<Delivery> {
        let id = actions.send(self.to.value(), self.message.value(), None)?;
        self.clear();
        Ok(Delivery {
            id,
            scheduled: false,
        })
    }

    pub fn send_later(
        &mut self,
        actions: &ActionDispatcher<'_>,
        offset: UtcOffset,
    ) -> WriteResult<Delivery> {
        if self.to.is_blank() {
            return Err(StoreError::validation("recipient is required"));
        }
        if self.message.is_blank() {
            return Err(StoreError::validation("message cannot be empty"));
        }
        let deliver_at = parse_deliver_at(self.when.value(), offset)?;
        let id = actions.send(self.to.value(), self.message.value(), Some(deliver_at))?;
        self.clear();
        Ok(Delivery {
            id,
            scheduled: true,
        })
    }

    pub fn clear(&mut self) {
        self.to.clear();
        self.message.clear();
        self.when.clear();
        self.recipient_index = None;
        self.mode = DeliveryMode::Now;
        self.field = ComposeField::To;
    }
}

/// Accepts `YYYY-MM-DDTHH:MM[:SS]`, the same with a space, or RFC 3339.
/// Inputs without an offset are read in `offset`.
pub fn parse_deliver_at(input: &str, offset: UtcOffset) -> WriteResult<OffsetDateTime> {
    let input = input.trim();
    if input.is_empty() {
        return Err(StoreError::validation("delivery time is required"));
    }
    if let Ok(at) = OffsetDateTime::parse(input, &Rfc3339) {
        return Ok(at);
    }
    let naive = [
        format_description!("[year]-[month]-[day]T[hour]:[minute]"),
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"),
        format_description!("[year]-[month]-[day] [hour]:[minute]"),
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
    ];
    naive
        .iter()
        .find_map(|format| PrimitiveDateTime::parse(input, format).ok())
        .map(|at| at.assume_offset(offset))
        .ok_or_else(|| {
            StoreError::validation(format!(
                "cannot read delivery time {input:?}, expected YYYY-MM-DD HH:MM"
            ))
        })
}

/// Inverse of [`parse_deliver_at`] for prefilling an input.
pub fn format_deliver_at(at: OffsetDateTime, offset: UtcOffset) -> String {
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]");
    at.to_offset(offset)
        .format(&format)
        .unwrap_or_else(|_| at.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::letters::fixtures::{letter, T0};
    use crate::store::testing::temp_store;
    use crate::store::ErrorKind;
    use time::macros::{datetime, offset};
    use time::Duration;

    fn ann() -> SessionContext {
        SessionContext {
            group_id: "g1".into(),
            user: "ann".into(),
        }
    }

    #[test]
    fn parses_supported_delivery_formats() -> WriteResult<()> {
        let plus_two = offset!(+2);
        assert_eq!(
            parse_deliver_at("2024-05-01T14:00", plus_two)?,
            datetime!(2024-05-01 12:00 UTC)
        );
        assert_eq!(
            parse_deliver_at(" 2024-05-01 14:00:30 ", plus_two)?,
            datetime!(2024-05-01 12:00:30 UTC)
        );
        assert_eq!(
            parse_deliver_at("2024-05-01T12:00:00Z", plus_two)?,
            datetime!(2024-05-01 12:00 UTC)
        );
        let err = parse_deliver_at("tomorrow", plus_two).expect_err("not a date");
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(parse_deliver_at("", plus_two).is_err());
        Ok(())
    }

    #[test]
    fn format_round_trips_through_parse() -> WriteResult<()> {
        let at = datetime!(2024-05-01 09:45 UTC);
        let text = format_deliver_at(at, offset!(-5));
        assert_eq!(text, "2024-05-01 04:45");
        assert_eq!(parse_deliver_at(&text, offset!(-5))?, at);
        Ok(())
    }

    #[test]
    fn recipients_follow_snapshots_and_cycle() {
        let mut view = ComposeView::new(&ann());
        view.apply_snapshot(&[
            letter("a", "bob", "ann", T0),
            letter("b", "ann", "carol", T0 + Duration::days(1)),
            letter("c", "bob", "dave", T0),
        ]);
        let names: Vec<_> = view.recipients().iter().cloned().collect();
        assert_eq!(names, vec!["bob", "carol", "dave"]);

        view.cycle_recipient(1);
        assert_eq!(view.to.value(), "bob");
        view.cycle_recipient(-1);
        assert_eq!(view.to.value(), "dave");
    }

    #[test]
    fn send_now_clears_form_and_validation_keeps_it() -> anyhow::Result<()> {
        let (_temp, store) = temp_store()?;
        let clock = ManualClock::new(T0);
        let session = ann();
        let actions = ActionDispatcher::new(&store, &clock, &session);
        let mut view = ComposeView::open(&store, &session)?;

        view.to.set("bob");
        let err = view.send_now(&actions).expect_err("empty message");
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(view.to.value(), "bob");

        view.message.set("hi");
        let delivery = view.send_now(&actions)?;
        assert_eq!(delivery.notice(), "Sent!");
        assert!(view.to.value().is_empty());
        assert!(view.message.value().is_empty());

        assert!(view.sync());
        assert!(view.recipients().contains("bob"));
        Ok(())
    }

    #[test]
    fn send_later_requires_parseable_time_but_allows_past() -> anyhow::Result<()> {
        let (_temp, store) = temp_store()?;
        let clock = ManualClock::new(T0);
        let session = ann();
        let actions = ActionDispatcher::new(&store, &clock, &session);
        let mut view = ComposeView::new(&session);
        view.toggle_mode();
        view.to.set("bob");
        view.message.set("later");
        view.when.set("soon");

        let err = view
            .send_later(&actions, UtcOffset::UTC)
            .expect_err("bad time");
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(view.message.value(), "later");

        view.when.set("2020-01-01 00:00");
        let delivery = view.send_later(&actions, UtcOffset::UTC)?;
        assert_eq!(delivery.notice(), "Scheduled!");
        assert_eq!(view.mode, DeliveryMode::Now);
        let stored = store.fetch_letter(&delivery.id)?.expect("letter");
        assert_eq!(stored.deliver_at, datetime!(2020-01-01 00:00 UTC));
        Ok(())
    }

    #[test]
    fn field_navigation_skips_time_when_sending_now() {
        let mut view = ComposeView::new(&ann());
        view.next_field();
        assert_eq!(view.field, ComposeField::Message);
        view.next_field();
        assert_eq!(view.field, ComposeField::To);
        view.toggle_mode();
        view.previous_field();
        assert_eq!(view.field, ComposeField::When);
        view.toggle_mode();
        assert_eq!(view.field, ComposeField::Message);
    }
}
