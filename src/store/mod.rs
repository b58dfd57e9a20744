use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::Mutex;
use rusqlite::config::DbConfig;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use thiserror::Error;
use time::OffsetDateTime;

use crate::clock::{from_millis, to_millis};
use crate::config::{ConfigPaths, StorageOptions};
use crate::letters::{Letter, LetterFilter, LetterId, LetterPatch, MarkSet, NewLetter};

mod hub;
mod schema;

pub use hub::{Snapshot, Subscription, SubscriptionHub};

pub type StoreResult<T> = Result<T, StoreError>;

/// Coarse failure classes surfaced to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Unavailable,
    PermissionDenied,
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Validation => "invalid input",
            ErrorKind::Unavailable => "store unavailable",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::Unknown => "unexpected error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}")]
    Validation(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("letter {0} not found")]
    NotFound(LetterId),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        StoreError::Validation(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Validation(_) => ErrorKind::Validation,
            StoreError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            StoreError::NotFound(_) => ErrorKind::Unknown,
            StoreError::Io(_) => ErrorKind::Unavailable,
            StoreError::Database(err) => match err.sqlite_error_code() {
                Some(
                    ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::CannotOpen
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::DiskFull
                    | ErrorCode::FileLockingProtocolFailed,
                ) => ErrorKind::Unavailable,
                Some(
                    ErrorCode::ReadOnly
                    | ErrorCode::PermissionDenied
                    | ErrorCode::AuthorizationForStatementDenied,
                ) => ErrorKind::PermissionDenied,
                _ => ErrorKind::Unknown,
            },
        }
    }
}

/// The document store the views consume.
pub trait LetterStore: Send + Sync {
    /// Live query; the current result set is delivered immediately.
    fn subscribe(&self, filter: LetterFilter) -> StoreResult<Subscription>;

    fn fetch(&self, filter: &LetterFilter) -> StoreResult<Vec<Letter>>;

    fn create(&self, letter: NewLetter) -> StoreResult<LetterId>;

    fn update(&self, id: &LetterId, patch: &LetterPatch) -> StoreResult<()>;

    /// Store-assigned current time.
    fn now(&self) -> StoreResult<OffsetDateTime>;

    /// Picks up commits made by other processes. Returns `true` when
    /// subscribers were refreshed.
    fn poll_changes(&self) -> StoreResult<bool>;
}

struct ChangeWatcher {
    conn: Connection,
    last_version: i64,
}

/// Shared SQLite database acting as the group's document store.
#[derive(Clone)]
pub struct SqliteStore {
    db_path: Arc<PathBuf>,
    options: Arc<StorageOptions>,
    hub: Arc<SubscriptionHub>,
    watcher: Arc<Mutex<Option<ChangeWatcher>>>,
}

impl SqliteStore {
    pub fn open(db_path: &Path, options: &StorageOptions) -> StoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        prepare_connection(&conn, options)?;
        schema::apply(&conn)?;
        Ok(Self {
            db_path: Arc::new(db_path.to_path_buf()),
            options: Arc::new(options.clone()),
            hub: Arc::new(SubscriptionHub::default()),
            watcher: Arc::new(Mutex::new(None)),
        })
    }

    pub fn connect(&self) -> StoreResult<Connection> {
        let conn = Connection::open(&*self.db_path)?;
        prepare_connection(&conn, &self.options)?;
        Ok(conn)
    }

    pub fn with_connection<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T>,
    {
        let conn = self.connect()?;
        f(&conn)
    }

    pub fn active_subscriptions(&self) -> usize {
        self.hub.active()
    }

    pub fn fetch_letter(&self, id: &LetterId) -> StoreResult<Option<Letter>> {
        self.with_connection(|conn| load_letter(conn, id))
    }

    fn publish_local(&self) {
        {
            let mut watcher = self.watcher.lock();
            if let Some(state) = watcher.as_mut() {
                match read_data_version(&state.conn) {
                    Ok(version) => state.last_version = version,
                    Err(err) => tracing::warn!(?err, "failed to refresh data_version"),
                }
            }
        }
        self.publish();
    }

    fn publish(&self) {
        self.hub
            .publish(|filter| self.with_connection(|conn| load_letters(conn, filter)));
    }
}

impl LetterStore for SqliteStore {
    fn subscribe(&self, filter: LetterFilter) -> StoreResult<Subscription> {
        self.hub.register(filter, |filter| self.fetch(filter))
    }

    fn fetch(&self, filter: &LetterFilter) -> StoreResult<Vec<Letter>> {
        self.with_connection(|conn| load_letters(conn, filter))
    }

    fn create(&self, letter: NewLetter) -> StoreResult<LetterId> {
        let group_id = letter.group_id.trim();
        let from = letter.from.trim();
        let to = letter.to.trim();
        if group_id.is_empty() || from.is_empty() || to.is_empty() {
            return Err(StoreError::validation(
                "group, sender and recipient are required",
            ));
        }
        if letter.message.trim().is_empty() {
            return Err(StoreError::validation("message cannot be empty"));
        }

        let id = LetterId::generate();
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO letters (id, group_id, sender, recipient, message, deliver_at, read_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7)",
                params![
                    id.as_str(),
                    group_id,
                    from,
                    to,
                    letter.message,
                    to_millis(letter.deliver_at),
                    to_millis(OffsetDateTime::now_utc()),
                ],
            )?;
            Ok(())
        })?;
        tracing::info!(%id, group = group_id, from, to, "letter created");
        self.publish_local();
        Ok(id)
    }

    fn update(&self, id: &LetterId, patch: &LetterPatch) -> StoreResult<()> {
        if patch.is_empty() {
            return Ok(());
        }
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<(String, String, i64)> = tx
            .query_row(
                "SELECT sender, recipient, deliver_at FROM letters WHERE id = ?1",
                params![id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((sender, recipient, deliver_at)) = current else {
            return Err(StoreError::NotFound(id.clone()));
        };

        let guard = &patch.guard;
        if let Some(expected) = &guard.sender {
            if &sender != expected {
                return Err(StoreError::PermissionDenied(format!(
                    "{expected} did not send letter {id}"
                )));
            }
        }
        if let Some(expected) = &guard.recipient {
            if &recipient != expected {
                return Err(StoreError::PermissionDenied(format!(
                    "letter {id} is not addressed to {expected}"
                )));
            }
        }
        if let Some(now) = guard.pending_at {
            if deliver_at <= to_millis(now) {
                return Err(StoreError::validation(format!(
                    "letter {id} was already delivered"
                )));
            }
        }

        if patch.has_field_changes() {
            tx.execute(
                "UPDATE letters
                 SET message = COALESCE(?2, message),
                     deliver_at = COALESCE(?3, deliver_at),
                     read_at = COALESCE(read_at, ?4)
                 WHERE id = ?1",
                params![
                    id.as_str(),
                    patch.message.as_deref(),
                    patch.deliver_at.map(to_millis),
                    patch.read_at.map(to_millis),
                ],
            )?;
        }
        for (set, user) in &patch.add_marks {
            tx.execute(
                "INSERT OR IGNORE INTO letter_marks (letter_id, mark, user_name) VALUES (?1, ?2, ?3)",
                params![id.as_str(), set.as_ref(), user],
            )?;
        }
        for (set, user) in &patch.remove_marks {
            tx.execute(
                "DELETE FROM letter_marks WHERE letter_id = ?1 AND mark = ?2 AND user_name = ?3",
                params![id.as_str(), set.as_ref(), user],
            )?;
        }
        tx.commit()?;
        tracing::debug!(%id, "letter updated");
        self.publish_local();
        Ok(())
    }

    fn now(&self) -> StoreResult<OffsetDateTime> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO server_time (stamped_at)
             VALUES (CAST(ROUND((julianday('now') - 2440587.5) * 86400000.0) AS INTEGER))",
            [],
        )?;
        let sentinel = tx.last_insert_rowid();
        let stamped: i64 = tx.query_row(
            "SELECT stamped_at FROM server_time WHERE id = ?1",
            params![sentinel],
            |row| row.get(0),
        )?;
        tx.execute("DELETE FROM server_time WHERE id <= ?1", params![sentinel])?;
        tx.commit()?;
        Ok(from_millis(stamped))
    }

    fn poll_changes(&self) -> StoreResult<bool> {
        let changed = {
            let mut watcher = self.watcher.lock();
            match watcher.as_mut() {
                None => {
                    let conn = self.connect()?;
                    let last_version = read_data_version(&conn)?;
                    *watcher = Some(ChangeWatcher { conn, last_version });
                    false
                }
                Some(state) => {
                    let version = read_data_version(&state.conn)?;
                    if version != state.last_version {
                        state.last_version = version;
                        true
                    } else {
                        false
                    }
                }
            }
        };
        if changed {
            tracing::debug!("external change detected, refreshing subscribers");
            self.publish();
        }
        Ok(changed)
    }
}

fn read_data_version(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("PRAGMA data_version", [], |row| row.get(0))
}

fn row_to_letter(row: &rusqlite::Row<'_>) -> rusqlite::Result<Letter> {
    let id: String = row.get(0)?;
    Ok(Letter {
        id: LetterId::from(id),
        group_id: row.get(1)?,
        from: row.get(2)?,
        to: row.get(3)?,
        message: row.get(4)?,
        deliver_at: from_millis(row.get(5)?),
        read_at: row.get::<_, Option<i64>>(6)?.map(from_millis),
        starred_by: Default::default(),
        deleted_by_recipient: Default::default(),
        deleted_by_sender: Default::default(),
    })
}

fn load_letters(conn: &Connection, filter: &LetterFilter) -> StoreResult<Vec<Letter>> {
    let mut stmt = conn.prepare(
        "SELECT id, group_id, sender, recipient, message, deliver_at, read_at
         FROM letters
         WHERE group_id = ?1
           AND (?2 IS NULL OR recipient = ?2)
           AND (?3 IS NULL OR sender = ?3)
         ORDER BY created_at, rowid",
    )?;
    let mut letters = stmt
        .query_map(
            params![filter.group_id, filter.to.as_deref(), filter.from.as_deref()],
            row_to_letter,
        )?
        .collect::<Result<Vec<_>, _>>()?;

    let mut marks_stmt = conn.prepare(
        "SELECT m.letter_id, m.mark, m.user_name
         FROM letter_marks m
         INNER JOIN letters l ON l.id = m.letter_id
         WHERE l.group_id = ?1
           AND (?2 IS NULL OR l.recipient = ?2)
           AND (?3 IS NULL OR l.sender = ?3)",
    )?;
    let rows = marks_stmt.query_map(
        params![filter.group_id, filter.to.as_deref(), filter.from.as_deref()],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        },
    )?;

    let index: HashMap<String, usize> = letters
        .iter()
        .enumerate()
        .map(|(idx, letter)| (letter.id.as_str().to_string(), idx))
        .collect();
    for row in rows {
        let (letter_id, mark, user) = row?;
        let Ok(set) = MarkSet::from_str(&mark) else {
            tracing::warn!(%letter_id, %mark, "ignoring unknown mark");
            continue;
        };
        if let Some(&idx) = index.get(&letter_id) {
            letters[idx].marks_mut(set).insert(user);
        }
    }
    Ok(letters)
}

fn load_letter(conn: &Connection, id: &LetterId) -> StoreResult<Option<Letter>> {
    let letter = conn
        .query_row(
            "SELECT id, group_id, sender, recipient, message, deliver_at, read_at
             FROM letters WHERE id = ?1",
            params![id.as_str()],
            row_to_letter,
        )
        .optional()?;
    let Some(mut letter) = letter else {
        return Ok(None);
    };
    let mut stmt =
        conn.prepare("SELECT mark, user_name FROM letter_marks WHERE letter_id = ?1")?;
    let rows = stmt.query_map(params![id.as_str()], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    for row in rows {
        let (mark, user) = row?;
        if let Ok(set) = MarkSet::from_str(&mark) {
            letter.marks_mut(set).insert(user);
        }
    }
    Ok(Some(letter))
}

pub fn init(paths: &ConfigPaths, storage: &StorageOptions) -> anyhow::Result<SqliteStore> {
    let db_path = if storage.database_path.as_os_str().is_empty() {
        &paths.database_path
    } else {
        &storage.database_path
    };
    let existed = db_path.exists();
    let store = SqliteStore::open(db_path, storage)
        .with_context(|| format!("opening letters database {}", db_path.display()))?;
    if !existed {
        tracing::info!(path = %db_path.display(), "created letters database");
    }
    Ok(store)
}

fn prepare_connection(conn: &Connection, storage: &StorageOptions) -> rusqlite::Result<()> {
    conn.set_db_config(DbConfig::SQLITE_DBCONFIG_ENABLE_FKEY, true)?;
    conn.busy_timeout(Duration::from_millis(storage.busy_timeout_ms))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(
        None,
        "wal_autocheckpoint",
        storage.wal_autocheckpoint.to_string(),
    )?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::testing::{new_letter, temp_store};
    use super::*;
    use assert_matches::assert_matches;
    use time::macros::datetime;
    use time::Duration as TimeDuration;

    const T0: OffsetDateTime = datetime!(2024-05-01 12:00 UTC);

    #[test]
    fn create_and_fetch_by_participant() -> anyhow::Result<()> {
        let (_temp, store) = temp_store()?;
        let id = store.create(new_letter("ann", "bob", "hi", T0))?;
        store.create(new_letter("bob", "ann", "hey", T0))?;

        let to_bob = store.fetch(&LetterFilter::addressed_to("g1", "bob"))?;
        assert_eq!(to_bob.len(), 1);
        assert_eq!(to_bob[0].id, id);
        assert_eq!(to_bob[0].deliver_at, T0);
        assert_eq!(to_bob[0].read_at, None);

        let from_bob = store.fetch(&LetterFilter::authored_by("g1", "bob"))?;
        assert_eq!(from_bob.len(), 1);
        assert_eq!(store.fetch(&LetterFilter::group("g1"))?.len(), 2);
        assert!(store.fetch(&LetterFilter::group("other"))?.is_empty());
        Ok(())
    }

    #[test]
    fn create_rejects_blank_fields() -> anyhow::Result<()> {
        let (_temp, store) = temp_store()?;
        let err = store
            .create(new_letter("ann", "  ", "hi", T0))
            .expect_err("blank recipient");
        assert_eq!(err.kind(), ErrorKind::Validation);
        let err = store
            .create(new_letter("ann", "bob", "   ", T0))
            .expect_err("blank message");
        assert_matches!(err, StoreError::Validation(_));
        Ok(())
    }

    #[test]
    fn mark_read_keeps_first_stamp() -> anyhow::Result<()> {
        let (_temp, store) = temp_store()?;
        let id = store.create(new_letter("ann", "bob", "hi", T0))?;
        store.update(&id, &LetterPatch::mark_read(T0, "bob"))?;
        store.update(
            &id,
            &LetterPatch::mark_read(T0 + TimeDuration::hours(1), "bob"),
        )?;
        let letter = store.fetch_letter(&id)?.expect("letter");
        assert_eq!(letter.read_at, Some(T0));
        Ok(())
    }

    #[test]
    fn mark_sets_support_add_and_remove_idempotently() -> anyhow::Result<()> {
        let (_temp, store) = temp_store()?;
        let id = store.create(new_letter("ann", "bob", "hi", T0))?;
        let delete = LetterPatch::add_mark(MarkSet::DeletedByRecipient, "bob");
        store.update(&id, &delete)?;
        store.update(&id, &delete)?;
        store.update(&id, &LetterPatch::add_mark(MarkSet::Starred, "bob"))?;
        store.update(&id, &LetterPatch::remove_mark(MarkSet::Starred, "bob"))?;

        let letter = store.fetch_letter(&id)?.expect("letter");
        assert_eq!(letter.deleted_by_recipient.len(), 1);
        assert!(letter.deleted_by_recipient.contains("bob"));
        assert!(letter.starred_by.is_empty());

        let listed = store.fetch(&LetterFilter::addressed_to("g1", "bob"))?;
        assert!(listed[0].deleted_by_recipient.contains("bob"));
        Ok(())
    }

    #[test]
    fn guards_reject_wrong_actor_and_delivered_edits() -> anyhow::Result<()> {
        let (_temp, store) = temp_store()?;
        let id = store.create(new_letter("ann", "bob", "hi", T0))?;

        let err = store
            .update(&id, &LetterPatch::mark_read(T0, "carol"))
            .expect_err("carol is not the recipient");
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);

        let mut edit = LetterPatch {
            message: Some("changed".into()),
            ..LetterPatch::default()
        };
        edit.guard.sender = Some("ann".into());
        edit.guard.pending_at = Some(T0 + TimeDuration::minutes(5));
        let err = store.update(&id, &edit).expect_err("already delivered");
        assert_eq!(err.kind(), ErrorKind::Validation);

        edit.guard.pending_at = Some(T0 - TimeDuration::minutes(5));
        store.update(&id, &edit)?;
        assert_eq!(store.fetch_letter(&id)?.expect("letter").message, "changed");
        Ok(())
    }

    #[test]
    fn update_of_missing_letter_is_not_found() -> anyhow::Result<()> {
        let (_temp, store) = temp_store()?;
        let err = store
            .update(&LetterId::from("missing"), &LetterPatch::mark_read(T0, "bob"))
            .expect_err("missing");
        assert_matches!(err, StoreError::NotFound(_));
        assert_eq!(err.kind(), ErrorKind::Unknown);
        Ok(())
    }

    #[test]
    fn subscription_receives_snapshots_after_writes() -> anyhow::Result<()> {
        let (_temp, store) = temp_store()?;
        let sub = store.subscribe(LetterFilter::addressed_to("g1", "bob"))?;
        assert!(sub.latest().expect("initial").letters.is_empty());

        store.create(new_letter("ann", "bob", "hi", T0))?;
        store.create(new_letter("ann", "carol", "not for bob", T0))?;
        let snapshot = sub.latest().expect("snapshot after create");
        assert_eq!(snapshot.letters.len(), 1);
        assert_eq!(snapshot.letters[0].message, "hi");

        assert_eq!(store.active_subscriptions(), 1);
        drop(sub);
        assert_eq!(store.active_subscriptions(), 0);
        Ok(())
    }

    #[test]
    fn poll_changes_sees_writes_from_another_handle() -> anyhow::Result<()> {
        let (temp, store) = temp_store()?;
        let other = SqliteStore::open(&temp.path().join("letters.db"), &StorageOptions::default())?;
        let sub = store.subscribe(LetterFilter::group("g1"))?;
        let _ = sub.latest();

        assert!(!store.poll_changes()?);
        other.create(new_letter("ann", "bob", "from elsewhere", T0))?;
        assert!(sub.latest().is_none());

        assert!(store.poll_changes()?);
        let snapshot = sub.latest().expect("refreshed snapshot");
        assert_eq!(snapshot.letters.len(), 1);
        assert!(!store.poll_changes()?);
        Ok(())
    }

    #[test]
    fn server_time_is_close_to_local_time() -> anyhow::Result<()> {
        let (_temp, store) = temp_store()?;
        let server = store.now()?;
        let drift = (server - OffsetDateTime::now_utc()).abs();
        assert!(drift < TimeDuration::seconds(5), "drift too large: {drift}");
        Ok(())
    }
}
