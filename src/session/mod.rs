use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

const SESSION_TMP_EXTENSION: &str = "json.tmp";

/// Who the user is and which group they are reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub group_id: String,
    pub user: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionRecord {
    group_id: String,
    name: String,
    joined: bool,
}

/// Owns the persisted membership and the join/leave transitions.
#[derive(Debug)]
pub struct SessionManager {
    path: PathBuf,
    current: Option<SessionContext>,
}

impl SessionManager {
    /// Reads the persisted session. Unreadable files count as not joined.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let current = match read_record(&path) {
            Ok(Some(record)) if record.joined => {
                let group_id = record.group_id.trim().to_string();
                let user = record.name.trim().to_string();
                if group_id.is_empty() || user.is_empty() {
                    None
                } else {
                    Some(SessionContext { group_id, user })
                }
            }
            Ok(_) => None,
            Err(err) => {
                tracing::warn!(?err, path = %path.display(), "ignoring unreadable session file");
                None
            }
        };
        Self { path, current }
    }

    pub fn current(&self) -> Option<&SessionContext> {
        self.current.as_ref()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join(&mut self, group_id: &str, name: &str) -> Result<SessionContext> {
        let group_id = group_id.trim();
        let name = name.trim();
        if group_id.is_empty() {
            bail!("group code cannot be empty");
        }
        if name.is_empty() {
            bail!("name cannot be empty");
        }
        let record = SessionRecord {
            group_id: group_id.to_string(),
            name: name.to_string(),
            joined: true,
        };
        write_record(&self.path, &record)?;
        let context = SessionContext {
            group_id: record.group_id,
            user: record.name,
        };
        tracing::info!(group = %context.group_id, user = %context.user, "joined group");
        self.current = Some(context.clone());
        Ok(context)
    }

    /// Clears the session. Returns the context that was active, if any.
    pub fn leave(&mut self) -> Result<Option<SessionContext>> {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("removing session file {}", self.path.display()))
            }
        }
        let previous = self.current.take();
        if let Some(context) = &previous {
            tracing::info!(group = %context.group_id, user = %context.user, "left group");
        }
        Ok(previous)
    }
}

fn read_record(path: &Path) -> Result<Option<SessionRecord>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("reading session file {}", path.display()))
        }
    };
    let record = serde_json::from_slice(&raw)
        .with_context(|| format!("parsing session file {}", path.display()))?;
    Ok(Some(record))
}

fn write_record(path: &Path, record: &SessionRecord) -> Result<()> {
    let json = serde_json::to_vec_pretty(record).context("serialising session")?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("ensuring state dir {}", parent.display()))?;
    }
    let tmp_path = path.with_extension(SESSION_TMP_EXTENSION);
    fs::write(&tmp_path, &json)
        .with_context(|| format!("writing temporary session file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("persisting session file {}", path.display()))?;
    Ok(())
}
