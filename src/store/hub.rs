use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::letters::{Letter, LetterFilter};

use super::StoreResult;

/// Full result set of a live query at one point in time.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub letters: Vec<Letter>,
}

struct Subscriber {
    filter: LetterFilter,
    tx: Sender<Snapshot>,
}

/// Fans query results out to every live subscription.
///
/// Publishes are serialized: each one queries after the previous one has sent,
/// so the last snapshot in a channel always reflects every commit published
/// before it.
#[derive(Default)]
pub struct SubscriptionHub {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    publishing: Mutex<()>,
}

impl SubscriptionHub {
    /// Runs the initial query and registers the listener without letting a
    /// concurrent publish slip in between.
    pub fn register<F>(self: &Arc<Self>, filter: LetterFilter, load: F) -> StoreResult<Subscription>
    where
        F: FnOnce(&LetterFilter) -> StoreResult<Vec<Letter>>,
    {
        let _publishing = self.publishing.lock();
        let initial = load(&filter)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(id, group = %filter.group_id, "subscription registered");
        let (tx, rx) = crossbeam_channel::unbounded();
        // Receiver is alive, the send cannot fail.
        let _ = tx.send(Snapshot { letters: initial });
        self.subscribers.lock().insert(id, Subscriber { filter, tx });
        Ok(Subscription {
            id,
            rx,
            hub: Arc::downgrade(self),
        })
    }

    /// Re-runs every subscriber's query and pushes the result.
    pub fn publish<F>(&self, mut query: F)
    where
        F: FnMut(&LetterFilter) -> StoreResult<Vec<Letter>>,
    {
        let _publishing = self.publishing.lock();
        let targets = {
            let subscribers = self.subscribers.lock();
            subscribers
                .iter()
                .map(|(id, sub)| (*id, sub.filter.clone(), sub.tx.clone()))
                .collect::<Vec<_>>()
        };

        let mut disconnected = Vec::new();
        for (id, filter, tx) in targets {
            match query(&filter) {
                Ok(letters) => {
                    if tx.send(Snapshot { letters }).is_err() {
                        disconnected.push(id);
                    }
                }
                Err(err) => {
                    tracing::warn!(?err, id, "live query failed, subscriber keeps last snapshot");
                }
            }
        }

        if !disconnected.is_empty() {
            let mut subscribers = self.subscribers.lock();
            for id in disconnected {
                subscribers.remove(&id);
            }
        }
    }

    pub fn active(&self) -> usize {
        self.subscribers.lock().len()
    }

    fn remove(&self, id: u64) {
        if self.subscribers.lock().remove(&id).is_some() {
            tracing::debug!(id, "subscription cancelled");
        }
    }
}

/// Live query handle. Dropping it unregisters the listener.
pub struct Subscription {
    id: u64,
    rx: Receiver<Snapshot>,
    hub: Weak<SubscriptionHub>,
}

impl Subscription {
    /// Newest pending snapshot, skipping any older ones still queued.
    pub fn latest(&self) -> Option<Snapshot> {
        self.rx.try_iter().last()
    }

    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::letters::fixtures::{letter, T0};

    #[test]
    fn initial_snapshot_is_delivered_and_drop_unregisters() {
        let hub = Arc::new(SubscriptionHub::default());
        let sub = hub
            .register(LetterFilter::group("g1"), |_| {
                Ok(vec![letter("a", "ann", "bob", T0)])
            })
            .expect("register");
        assert_eq!(hub.active(), 1);
        let first = sub.latest().expect("initial snapshot");
        assert_eq!(first.letters.len(), 1);
        assert!(sub.latest().is_none());

        drop(sub);
        assert_eq!(hub.active(), 0);
    }

    #[test]
    fn publish_runs_each_filter_and_latest_skips_stale_snapshots() {
        let hub = Arc::new(SubscriptionHub::default());
        let inbox = hub
            .register(LetterFilter::addressed_to("g1", "bob"), |_| Ok(Vec::new()))
            .expect("register");
        let sent = hub
            .register(LetterFilter::authored_by("g1", "ann"), |_| Ok(Vec::new()))
            .expect("register");
        let _ = inbox.latest();
        let _ = sent.latest();

        let all = vec![letter("a", "ann", "bob", T0), letter("b", "bob", "ann", T0)];
        for _ in 0..3 {
            hub.publish(|filter| Ok(all.iter().filter(|l| filter.matches(l)).cloned().collect()));
        }

        let inbox_snapshot = inbox.latest().expect("inbox snapshot");
        assert_eq!(inbox_snapshot.letters.len(), 1);
        assert_eq!(inbox_snapshot.letters[0].id.as_str(), "a");
        assert!(inbox.latest().is_none());

        let sent_snapshot = sent.latest().expect("sent snapshot");
        assert_eq!(sent_snapshot.letters[0].id.as_str(), "a");
    }

    #[test]
    fn cancel_stops_delivery() {
        let hub = Arc::new(SubscriptionHub::default());
        let sub = hub
            .register(LetterFilter::group("g1"), |_| Ok(Vec::new()))
            .expect("register");
        sub.cancel();
        let mut calls = 0;
        hub.publish(|_| {
            calls += 1;
            Ok(Vec::new())
        });
        assert_eq!(calls, 0);
    }

    #[test]
    fn concurrent_publishes_leave_the_newest_snapshot_last() {
        use std::sync::atomic::AtomicUsize;
        use std::thread;

        let hub = Arc::new(SubscriptionHub::default());
        let sub = hub
            .register(LetterFilter::group("g1"), |_| Ok(Vec::new()))
            .expect("register");
        let _ = sub.latest();

        // Each publish sees one more committed letter than the one before it.
        let committed = AtomicUsize::new(0);
        thread::scope(|scope| {
            for _ in 0..16 {
                scope.spawn(|| {
                    hub.publish(|_| {
                        let count = committed.fetch_add(1, Ordering::SeqCst) + 1;
                        thread::yield_now();
                        Ok((0..count)
                            .map(|n| letter(&format!("l{n}"), "ann", "bob", T0))
                            .collect())
                    });
                });
            }
        });

        let last = sub.latest().expect("snapshot");
        assert_eq!(last.letters.len(), 16);
    }

    #[test]
    fn failed_initial_query_registers_nothing() {
        let hub = Arc::new(SubscriptionHub::default());
        let result = hub.register(LetterFilter::group("g1"), |_| {
            Err(crate::store::StoreError::validation("boom"))
        });
        assert!(result.is_err());
        assert_eq!(hub.active(), 0);
    }
}
