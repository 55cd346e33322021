use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use burrow_core::model::{Entity, EntityId, EntityKind, Payload, RemoteRef, RemoteSnapshot};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::RemoteError;
use crate::tracker::{IssueTracker, PushMode, PushReceipt};

pub const FOLDER_TRACKER: &str = "folder";

/// One issue file, `<dir>/<key>.json`. Plain JSON: this is the remote's
/// copy, outside the encrypted store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderIssue {
    pub key: String,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,
    pub origin: EntityId,
    pub kind: EntityKind,
    pub payload: Payload,
}

/// A directory of JSON issue files standing in for a remote tracker.
/// Keys are sequential numbers.
#[derive(Debug, Clone)]
pub struct FolderTracker {
    dir: PathBuf,
}

impl FolderTracker {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, RemoteError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| transport(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn issue_path(&self, key: &str) -> Result<PathBuf, RemoteError> {
        if key.is_empty() || !key.bytes().all(|b| b.is_ascii_digit()) {
            return Err(RemoteError::NotFound(format!("{FOLDER_TRACKER}:{key}")));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }

    pub fn read_issue(&self, key: &str) -> Result<FolderIssue, RemoteError> {
        let path = self.issue_path(key)?;
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RemoteError::NotFound(format!("{FOLDER_TRACKER}:{key}")))
            }
            Err(e) => return Err(transport(&path, e)),
        };
        serde_json::from_slice(&raw)
            .map_err(|e| RemoteError::Transport(format!("{}: malformed issue: {e}", path.display())))
    }

    pub fn write_issue(&self, issue: &FolderIssue) -> Result<(), RemoteError> {
        let path = self.issue_path(&issue.key)?;
        let json = serde_json::to_vec_pretty(issue)
            .map_err(|e| RemoteError::Transport(format!("serialize issue: {e}")))?;
        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(|e| transport(&self.dir, e))?;
        tmp.write_all(&json).map_err(|e| transport(&path, e))?;
        tmp.persist(&path).map_err(|e| transport(&path, e.error))?;
        Ok(())
    }

    /// The next free key, and the live issue already created for `origin`.
    fn scan(&self, origin: &EntityId) -> Result<(String, Option<FolderIssue>), RemoteError> {
        let mut highest = 0u64;
        let mut live = None;
        for entry in fs::read_dir(&self.dir).map_err(|e| transport(&self.dir, e))? {
            let entry = entry.map_err(|e| transport(&self.dir, e))?;
            let name = entry.file_name();
            let Some(n) = name
                .to_str()
                .and_then(|n| n.strip_suffix(".json"))
                .and_then(|n| n.parse::<u64>().ok())
            else {
                continue;
            };
            highest = highest.max(n);
            let issue = self.read_issue(&n.to_string())?;
            if issue.origin == *origin && !issue.deleted {
                live = Some(issue);
            }
        }
        Ok(((highest + 1).to_string(), live))
    }
}

impl IssueTracker for FolderTracker {
    fn name(&self) -> &str {
        FOLDER_TRACKER
    }

    fn pull(&self, remote_ref: &RemoteRef) -> Result<RemoteSnapshot, RemoteError> {
        let issue = self.read_issue(&remote_ref.key)?;
        Ok(RemoteSnapshot {
            remote_ref: RemoteRef::new(FOLDER_TRACKER, issue.key),
            remote_version: issue.version,
            updated_at: issue.updated_at,
            deleted: issue.deleted,
            payload: issue.payload,
        })
    }

    fn push(&self, entity: &Entity, mode: PushMode) -> Result<PushReceipt, RemoteError> {
        let now = Utc::now();
        let issue = match (mode, entity.remote_ref()) {
            (PushMode::Create, _) => match self.scan(&entity.id)? {
                (_, Some(live)) => {
                    debug!(key = %live.key, id = %entity.id, "create retried, reusing issue");
                    revise(live, entity, mode, now)
                }
                (key, None) => FolderIssue {
                    key,
                    version: 1,
                    updated_at: now,
                    deleted: false,
                    origin: entity.id.clone(),
                    kind: entity.kind,
                    payload: entity.payload.clone(),
                },
            },
            (_, Some(remote_ref)) => revise(self.read_issue(&remote_ref.key)?, entity, mode, now),
            (_, None) => {
                return Err(RemoteError::NotFound(format!(
                    "{} has no remote link",
                    entity.id
                )))
            }
        };
        self.write_issue(&issue)?;
        debug!(key = %issue.key, mode = mode.as_str(), "wrote folder issue");

        Ok(PushReceipt {
            remote_ref: RemoteRef::new(FOLDER_TRACKER, issue.key),
            remote_version: issue.version,
            remote_updated_at: issue.updated_at,
        })
    }
}

fn revise(mut issue: FolderIssue, entity: &Entity, mode: PushMode, now: DateTime<Utc>) -> FolderIssue {
    issue.version += 1;
    // Keep remote timestamps increasing for reconciliation.
    issue.updated_at = if now > issue.updated_at {
        now
    } else {
        issue.updated_at + Duration::milliseconds(1)
    };
    match mode {
        PushMode::Delete => issue.deleted = true,
        PushMode::Create | PushMode::Update => issue.payload = entity.payload.clone(),
    }
    issue
}

fn transport(path: &Path, e: std::io::Error) -> RemoteError {
    RemoteError::Transport(format!("{}: {e}", path.display()))
}
