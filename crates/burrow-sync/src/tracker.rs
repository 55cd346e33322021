use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use burrow_core::config::BurrowConfig;
use burrow_core::model::{Entity, EntityId, Payload, RemoteRef, RemoteSnapshot};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RemoteError, SyncError};
use crate::folder::{FolderTracker, FOLDER_TRACKER};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushMode {
    Create,
    Update,
    Delete,
}

impl PushMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PushMode::Create => "create",
            PushMode::Update => "update",
            PushMode::Delete => "delete",
        }
    }
}

/// What the remote reports after accepting a push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushReceipt {
    pub remote_ref: RemoteRef,
    pub remote_version: u64,
    pub remote_updated_at: DateTime<Utc>,
}

/// A remote issue tracker. Network access, retries and timeouts live
/// behind this trait and surface as `RemoteError`.
pub trait IssueTracker {
    /// Tracker name recorded in every `RemoteRef` this adapter issues.
    fn name(&self) -> &str;

    fn pull(&self, remote_ref: &RemoteRef) -> Result<RemoteSnapshot, RemoteError>;

    /// `Create` ignores any existing link; `Update` and `Delete` require one.
    fn push(&self, entity: &Entity, mode: PushMode) -> Result<PushReceipt, RemoteError>;
}

/// Build the tracker named by `sync.provider`.
pub fn tracker_from_config(config: &BurrowConfig) -> Result<Box<dyn IssueTracker>, SyncError> {
    match config.sync_provider.as_deref() {
        Some(FOLDER_TRACKER) => {
            let dir = config.sync_folder.as_ref().ok_or_else(|| {
                SyncError::NotConfigured("sync.provider is folder but sync.folder is unset".into())
            })?;
            Ok(Box::new(FolderTracker::open(dir)?))
        }
        Some(other) => Err(SyncError::NotConfigured(format!(
            "unknown sync.provider '{other}'"
        ))),
        None => Err(SyncError::NotConfigured(
            "no sync.provider set (run `burrow init --remote-folder <dir>`)".into(),
        )),
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    issues: BTreeMap<String, RemoteSnapshot>,
    /// Issue key created for each local entity.
    origins: BTreeMap<EntityId, String>,
    next_key: u64,
    pull_failure: Option<RemoteError>,
    failing_pushes: BTreeSet<EntityId>,
    pushes: Vec<(EntityId, PushMode)>,
    last_stamp: Option<DateTime<Utc>>,
}

/// In-process tracker with failure injection.
#[derive(Debug)]
pub struct MemoryTracker {
    name: String,
    state: Mutex<MemoryState>,
}

impl MemoryTracker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(MemoryState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        // Test double: a poisoned lock only follows a panic elsewhere.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn issue(&self, remote_ref: &RemoteRef) -> Option<RemoteSnapshot> {
        self.state().issues.get(&remote_ref.key).cloned()
    }

    pub fn issue_count(&self) -> usize {
        self.state().issues.len()
    }

    /// Simulate someone editing the issue on the remote side.
    pub fn edit_remote(
        &self,
        remote_ref: &RemoteRef,
        at: DateTime<Utc>,
        edit: impl FnOnce(&mut Payload),
    ) -> Result<(), RemoteError> {
        let mut state = self.state();
        let issue = state
            .issues
            .get_mut(&remote_ref.key)
            .ok_or_else(|| RemoteError::NotFound(remote_ref.to_string()))?;
        edit(&mut issue.payload);
        issue.remote_version += 1;
        issue.updated_at = at;
        Ok(())
    }

    /// Simulate the issue being closed on the remote side.
    pub fn delete_remote(&self, remote_ref: &RemoteRef, at: DateTime<Utc>) -> Result<(), RemoteError> {
        let mut state = self.state();
        let issue = state
            .issues
            .get_mut(&remote_ref.key)
            .ok_or_else(|| RemoteError::NotFound(remote_ref.to_string()))?;
        issue.deleted = true;
        issue.remote_version += 1;
        issue.updated_at = at;
        Ok(())
    }

    pub fn fail_pulls(&self, error: Option<RemoteError>) {
        self.state().pull_failure = error;
    }

    pub fn fail_pushes_for(&self, id: &EntityId) {
        self.state().failing_pushes.insert(id.clone());
    }

    pub fn clear_push_failures(&self) {
        self.state().failing_pushes.clear();
    }

    /// Every push attempted, in order, including failed ones.
    pub fn push_log(&self) -> Vec<(EntityId, PushMode)> {
        self.state().pushes.clone()
    }
}

impl MemoryState {
    /// Strictly increasing timestamps, so two pushes never share one.
    fn stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamp = match self.last_stamp {
            Some(last) if now <= last => last + Duration::milliseconds(1),
            _ => now,
        };
        self.last_stamp = Some(stamp);
        stamp
    }
}

impl IssueTracker for MemoryTracker {
    fn name(&self) -> &str {
        &self.name
    }

    fn pull(&self, remote_ref: &RemoteRef) -> Result<RemoteSnapshot, RemoteError> {
        let state = self.state();
        if let Some(error) = &state.pull_failure {
            return Err(error.clone());
        }
        state
            .issues
            .get(&remote_ref.key)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(remote_ref.to_string()))
    }

    fn push(&self, entity: &Entity, mode: PushMode) -> Result<PushReceipt, RemoteError> {
        let mut state = self.state();
        state.pushes.push((entity.id.clone(), mode));
        if state.failing_pushes.contains(&entity.id) {
            return Err(RemoteError::Transport(format!(
                "injected failure for {}",
                entity.id
            )));
        }

        let updated_at = state.stamp();
        let remote_ref = match (mode, entity.remote_ref()) {
            (PushMode::Create, _) => {
                // A retried create lands on the live issue made for this entity.
                let live = state
                    .origins
                    .get(&entity.id)
                    .filter(|key| state.issues.get(*key).is_some_and(|i| !i.deleted))
                    .cloned();
                let key = match live {
                    Some(key) => key,
                    None => {
                        state.next_key += 1;
                        let key = state.next_key.to_string();
                        state.origins.insert(entity.id.clone(), key.clone());
                        key
                    }
                };
                RemoteRef::new(&self.name, key)
            }
            (_, Some(existing)) => existing.clone(),
            (_, None) => {
                return Err(RemoteError::NotFound(format!(
                    "{} has no remote link",
                    entity.id
                )))
            }
        };

        let issue = state
            .issues
            .entry(remote_ref.key.clone())
            .or_insert_with(|| RemoteSnapshot {
                remote_ref: remote_ref.clone(),
                remote_version: 0,
                updated_at,
                deleted: false,
                payload: Payload::default(),
            });
        issue.remote_version += 1;
        issue.updated_at = updated_at;
        match mode {
            PushMode::Delete => issue.deleted = true,
            PushMode::Create | PushMode::Update => issue.payload = entity.payload.clone(),
        }

        Ok(PushReceipt {
            remote_ref,
            remote_version: issue.remote_version,
            remote_updated_at: updated_at,
        })
    }
}
