//! Settling `Manual` conflicts. The user's choice is journaled as an
//! ordinary local write, so the next sync cycle carries it out.

use burrow_core::model::{EntityId, Operation, RemoteLink, RemoteSnapshot, Resolution};
use burrow_core::{CoreError, Workspace};
use serde::Serialize;
use tracing::info;

use crate::error::SyncError;
use crate::session::SessionLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Keep {
    Local,
    Remote,
}

impl Keep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Keep::Local => "local",
            Keep::Remote => "remote",
        }
    }
}

/// Resolve the latest open `Manual` conflict of `id` and acknowledge every
/// open conflict of that entity.
///
/// Keeping local re-links the entity to the remote state it lost against
/// (or unlinks it when the issue is gone) so the next cycle pushes it.
/// Keeping remote stores the remote state as already synced. Returns the
/// journal sequence of the resolving write, or `None` when both sides
/// already agree the entity is gone.
pub fn resolve_conflict(
    workspace: &Workspace,
    id: &EntityId,
    keep: Keep,
) -> Result<Option<u64>, SyncError> {
    let _lock = SessionLock::acquire(workspace.root())?;
    let record = workspace
        .conflicts()
        .list(false)?
        .into_iter()
        .map(|c| c.record)
        .filter(|r| r.entity_id == *id && r.resolution == Resolution::Manual)
        .max_by_key(|r| r.local_sequence)
        .ok_or_else(|| CoreError::NotFound {
            id: format!("open manual conflict for {id}"),
        })?;
    let remote = &record.remote_snapshot;

    let sequence = workspace.write(|w| {
        let stored = w.get(id)?;
        let exists = stored.is_some();
        let mut entity = stored.unwrap_or_else(|| record.local_snapshot.clone());
        let synced = entity
            .remote
            .as_ref()
            .map_or(0, |link| link.synced_local_version);

        let operation = match (keep, exists, remote.deleted) {
            (_, false, true) => return Ok(None),
            (Keep::Remote, true, true) => {
                entity.touch();
                Operation::Delete
            }
            (Keep::Remote, _, false) => {
                entity.touch();
                entity.payload = remote.payload.clone();
                entity.remote = Some(link_to(remote, entity.local_version));
                if exists {
                    Operation::Update
                } else {
                    Operation::Create
                }
            }
            (Keep::Local, true, true) => {
                // The issue is gone; the next cycle opens a new one.
                entity.remote = None;
                entity.touch();
                Operation::Update
            }
            (Keep::Local, _, false) => {
                entity.touch();
                entity.remote = Some(link_to(remote, synced));
                if exists {
                    Operation::Update
                } else {
                    Operation::Delete
                }
            }
        };
        w.commit(operation, &entity).map(Some)
    })?;

    let acknowledged = workspace.conflicts().acknowledge(id)?;
    info!(
        id = %id,
        keep = keep.as_str(),
        sequence = ?sequence,
        acknowledged,
        "conflict resolved"
    );
    Ok(sequence)
}

fn link_to(remote: &RemoteSnapshot, synced_local_version: u64) -> RemoteLink {
    RemoteLink {
        remote_ref: remote.remote_ref.clone(),
        remote_version: remote.remote_version,
        remote_updated_at: remote.updated_at,
        synced_local_version,
    }
}
