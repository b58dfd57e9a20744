use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use time::macros::format_description;
use time::{Duration, OffsetDateTime, UtcOffset};

use crate::config::ClockOptions;
use crate::store::LetterStore;

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: OffsetDateTime) {
        *self.now.lock() = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock()
    }
}

/// Server-authoritative time: samples the store clock and applies the measured
/// offset to the local clock between resyncs.
pub struct StoreClock {
    store: Arc<dyn LetterStore>,
    resync_every: std::time::Duration,
    state: Mutex<Option<ClockSample>>,
}

#[derive(Debug, Clone, Copy)]
struct ClockSample {
    offset: Duration,
    taken_at: Instant,
}

impl StoreClock {
    pub fn new(store: Arc<dyn LetterStore>, resync_every: std::time::Duration) -> Self {
        Self {
            store,
            resync_every,
            state: Mutex::new(None),
        }
    }

    pub fn offset(&self) -> Option<Duration> {
        self.state.lock().map(|sample| sample.offset)
    }

    fn resync(&self) -> Option<ClockSample> {
        let local_before = OffsetDateTime::now_utc();
        match self.store.now() {
            Ok(server) => {
                let local_after = OffsetDateTime::now_utc();
                let midpoint = local_before + (local_after - local_before) / 2_i32;
                let sample = ClockSample {
                    offset: server - midpoint,
                    taken_at: Instant::now(),
                };
                tracing::debug!(
                    offset_ms = sample.offset.whole_milliseconds() as i64,
                    "store clock resynced"
                );
                Some(sample)
            }
            Err(err) => {
                tracing::warn!(?err, "store clock unavailable, using local clock");
                None
            }
        }
    }
}

impl Clock for StoreClock {
    fn now(&self) -> OffsetDateTime {
        let mut state = self.state.lock();
        let stale = state
            .map(|sample| sample.taken_at.elapsed() >= self.resync_every)
            .unwrap_or(true);
        if stale {
            if let Some(sample) = self.resync() {
                *state = Some(sample);
            }
        }
        let offset = state.map(|sample| sample.offset).unwrap_or(Duration::ZERO);
        OffsetDateTime::now_utc() + offset
    }
}

/// Store-backed when configured, otherwise the local clock.
pub fn from_options(options: &ClockOptions, store: Arc<dyn LetterStore>) -> Arc<dyn Clock> {
    if options.use_store_clock {
        Arc::new(StoreClock::new(store, options.resync_interval()))
    } else {
        Arc::new(SystemClock)
    }
}

pub fn to_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn from_millis(ms: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

/// Human-readable instant in the display offset, minute precision.
pub fn display_time(at: OffsetDateTime, offset: UtcOffset) -> String {
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]");
    at.to_offset(offset)
        .format(&format)
        .unwrap_or_else(|_| at.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::letters::{LetterFilter, LetterId, LetterPatch, NewLetter};
    use crate::store::testing::temp_store;
    use crate::store::{StoreError, StoreResult, Subscription};

    /// Store whose clock answers with a scripted time, or fails when unset.
    #[derive(Default)]
    struct ScriptedStore {
        server: Mutex<Option<OffsetDateTime>>,
        calls: AtomicUsize,
    }

    impl ScriptedStore {
        fn answer(&self, at: Option<OffsetDateTime>) {
            *self.server.lock() = at;
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn unsupported() -> StoreError {
        StoreError::validation("not supported here")
    }

    impl LetterStore for ScriptedStore {
        fn subscribe(&self, _filter: LetterFilter) -> StoreResult<Subscription> {
            Err(unsupported())
        }

        fn fetch(&self, _filter: &LetterFilter) -> StoreResult<Vec<crate::letters::Letter>> {
            Ok(Vec::new())
        }

        fn create(&self, _letter: NewLetter) -> StoreResult<LetterId> {
            Err(unsupported())
        }

        fn update(&self, _id: &LetterId, _patch: &LetterPatch) -> StoreResult<()> {
            Err(unsupported())
        }

        fn now(&self) -> StoreResult<OffsetDateTime> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (*self.server.lock()).ok_or_else(|| {
                StoreError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionRefused))
            })
        }

        fn poll_changes(&self) -> StoreResult<bool> {
            Ok(false)
        }
    }

    fn close_to(actual: Duration, expected: Duration) -> bool {
        (actual - expected).abs() < Duration::seconds(5)
    }

    #[test]
    fn manual_clock_advances_and_jumps() {
        let clock = ManualClock::new(datetime!(2024-01-01 00:00 UTC));
        clock.advance(Duration::minutes(90));
        assert_eq!(clock.now(), datetime!(2024-01-01 01:30 UTC));
        clock.set(datetime!(2023-06-01 12:00 UTC));
        assert_eq!(clock.now(), datetime!(2023-06-01 12:00 UTC));
    }

    #[test]
    fn store_clock_samples_sqlite_time() -> anyhow::Result<()> {
        let (_temp, store) = temp_store()?;
        let clock = StoreClock::new(Arc::new(store), std::time::Duration::from_secs(60));
        assert!(clock.offset().is_none());

        let now = clock.now();
        let offset = clock.offset().expect("sampled offset");
        assert!(close_to(offset, Duration::ZERO), "offset {offset}");
        assert!(close_to(now - OffsetDateTime::now_utc(), Duration::ZERO));
        Ok(())
    }

    #[test]
    fn store_clock_caches_offset_until_resync_is_due() {
        let store = Arc::new(ScriptedStore::default());
        store.answer(Some(OffsetDateTime::now_utc() + Duration::hours(1)));
        let clock = StoreClock::new(store.clone(), std::time::Duration::from_millis(250));

        let ahead = clock.now() - OffsetDateTime::now_utc();
        assert!(close_to(ahead, Duration::hours(1)), "ahead by {ahead}");
        clock.now();
        assert_eq!(store.calls(), 1);

        store.answer(Some(OffsetDateTime::now_utc() - Duration::hours(1)));
        std::thread::sleep(std::time::Duration::from_millis(300));
        let behind = clock.now() - OffsetDateTime::now_utc();
        assert!(close_to(behind, -Duration::hours(1)), "behind by {behind}");
        assert_eq!(store.calls(), 2);
        assert!(close_to(clock.offset().expect("offset"), -Duration::hours(1)));
    }

    #[test]
    fn store_clock_falls_back_to_local_time_when_store_fails() {
        let store = Arc::new(ScriptedStore::default());
        let clock = StoreClock::new(store.clone(), std::time::Duration::from_secs(3600));

        let drift = clock.now() - OffsetDateTime::now_utc();
        assert!(close_to(drift, Duration::ZERO));
        assert!(clock.offset().is_none());

        // Without a sample every read retries the store.
        store.answer(Some(OffsetDateTime::now_utc() + Duration::minutes(30)));
        let ahead = clock.now() - OffsetDateTime::now_utc();
        assert!(close_to(ahead, Duration::minutes(30)));
        assert_eq!(store.calls(), 2);
    }

    #[test]
    fn store_clock_keeps_last_offset_when_a_resync_fails() {
        let store = Arc::new(ScriptedStore::default());
        store.answer(Some(OffsetDateTime::now_utc() + Duration::hours(2)));
        let clock = StoreClock::new(store.clone(), std::time::Duration::from_millis(20));
        clock.now();

        store.answer(None);
        std::thread::sleep(std::time::Duration::from_millis(40));
        let ahead = clock.now() - OffsetDateTime::now_utc();
        assert!(close_to(ahead, Duration::hours(2)));
        assert_eq!(store.calls(), 2);
    }

    #[test]
    fn from_options_picks_the_configured_clock() -> anyhow::Result<()> {
        let (_temp, store) = temp_store()?;
        let store: Arc<dyn LetterStore> = Arc::new(store);
        let mut options = ClockOptions {
            use_store_clock: false,
            ..ClockOptions::default()
        };
        let local = from_options(&options, store.clone());
        assert!(close_to(local.now() - OffsetDateTime::now_utc(), Duration::ZERO));

        options.use_store_clock = true;
        let shared = from_options(&options, store);
        assert!(close_to(shared.now() - OffsetDateTime::now_utc(), Duration::ZERO));
        Ok(())
    }

    #[test]
    fn millis_conversion_truncates_sub_millisecond_precision() {
        let at = datetime!(2024-01-01 00:00:00.123456 UTC);
        assert_eq!(from_millis(to_millis(at)), datetime!(2024-01-01 00:00:00.123 UTC));
    }

    #[test]
    fn display_time_applies_offset() {
        let at = datetime!(2024-01-01 23:30 UTC);
        let offset = UtcOffset::from_hms(2, 0, 0).expect("valid offset");
        assert_eq!(display_time(at, offset), "2024-01-02 01:30");
    }
}
