use std::time::{Duration, Instant};

use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Success,
    Failure,
}

#[derive(Debug, Clone)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
    shown_at: Instant,
}

/// Single transient notification slot; a newer notice replaces the older one.
#[derive(Debug)]
pub struct Notices {
    current: Option<Notice>,
    ttl: Duration,
}

impl Notices {
    pub fn new(ttl: Duration) -> Self {
        Self { current: None, ttl }
    }

    pub fn success(&mut self, message: impl Into<String>) {
        self.show(NoticeKind::Success, message.into(), Instant::now());
    }

    pub fn failure(&mut self, message: impl Into<String>) {
        self.show(NoticeKind::Failure, message.into(), Instant::now());
    }

    /// Failure notice for a write, prefixed with what was attempted.
    pub fn write_failed(&mut self, action: &str, err: &StoreError) {
        tracing::error!(?err, action, "write failed");
        self.failure(format!("{action} failed ({}): {err}", err.kind()));
    }

    pub fn show(&mut self, kind: NoticeKind, message: String, at: Instant) {
        self.current = Some(Notice {
            kind,
            message,
            shown_at: at,
        });
    }

    pub fn current(&self) -> Option<&Notice> {
        self.current.as_ref()
    }

    pub fn dismiss(&mut self) -> bool {
        self.current.take().is_some()
    }

    /// Drops the notice once it has been visible for the configured time.
    pub fn expire(&mut self, now: Instant) {
        let expired = self
            .current
            .as_ref()
            .map(|notice| now.saturating_duration_since(notice.shown_at) >= self.ttl)
            .unwrap_or(false);
        if expired {
            self.current = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notice_expires_after_ttl() {
        let mut notices = Notices::new(Duration::from_millis(2_500));
        let start = Instant::now();
        notices.show(NoticeKind::Success, "Sent!".into(), start);

        notices.expire(start + Duration::from_millis(2_499));
        assert_eq!(notices.current().map(|n| n.message.as_str()), Some("Sent!"));

        notices.expire(start + Duration::from_millis(2_500));
        assert!(notices.current().is_none());
    }

    #[test]
    fn dismiss_clears_early_and_newer_replaces_older() {
        let mut notices = Notices::new(Duration::from_secs(5));
        notices.success("Sent!");
        notices.failure("Delete failed");
        let current = notices.current().expect("notice");
        assert_eq!(current.kind, NoticeKind::Failure);
        assert!(notices.dismiss());
        assert!(!notices.dismiss());
    }

    #[test]
    fn write_failure_names_the_error_kind() {
        let mut notices = Notices::new(Duration::from_secs(5));
        notices.write_failed("Send", &StoreError::validation("message cannot be empty"));
        assert_eq!(
            notices.current().map(|n| n.message.as_str()),
            Some("Send failed (invalid input): message cannot be empty")
        );
    }
}
