//! Pure reconciliation of local journal entries against remote snapshots.
//!
//! Nothing here touches disk, the network or the clock: the same inputs
//! always produce the same result, which is what makes dry runs repeatable.

use std::collections::{BTreeMap, BTreeSet};

use burrow_core::model::{
    ConflictRecord, Entity, EntityId, JournalEntry, Operation, RemoteLink, RemoteRef,
    RemoteSnapshot, Resolution,
};
use serde::Serialize;

use crate::tracker::PushMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateAction {
    /// Store the remote's content locally.
    Apply,
    /// The remote issue is gone; remove the local record.
    Remove,
}

/// A remote change to write locally. `entity` is the exact state to store
/// (for `Remove`, the journaled tombstone); it only applies if the stored
/// entity is still at `expected_local_version`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityUpdate {
    pub entity_id: EntityId,
    pub action: UpdateAction,
    pub expected_local_version: u64,
    pub entity: Entity,
}

/// A local change to send to the tracker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundChange {
    pub entity_id: EntityId,
    pub mode: PushMode,
    pub local_sequence: u64,
    pub entity: Entity,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileResult {
    pub updates_to_apply: Vec<EntityUpdate>,
    pub outbound_changes: Vec<OutboundChange>,
    pub conflicts: Vec<ConflictRecord>,
    /// Highest journal sequence among the inputs.
    pub highest_sequence: Option<u64>,
}

impl ReconcileResult {
    pub fn is_empty(&self) -> bool {
        self.updates_to_apply.is_empty()
            && self.outbound_changes.is_empty()
            && self.conflicts.is_empty()
    }

    /// Where the checkpoint may move once everything applied cleanly. An
    /// unresolved `Manual` conflict holds it just below the conflicting local
    /// entry, so that entry is reconsidered (and its remote ref pulled) on
    /// every cycle until the user resolves it.
    pub fn checkpoint_target(&self) -> Option<u64> {
        self.conflicts
            .iter()
            .filter(|c| c.resolution == Resolution::Manual)
            .map(|c| c.local_sequence.saturating_sub(1))
            .min()
            .or(self.highest_sequence)
    }
}

/// Decide, per entity, what to push, what to apply and what conflicts.
///
/// `local_entries` are the journal entries past the checkpoint, `remote`
/// the freshly pulled snapshots keyed by local id, and `linked` the stored
/// state of every linked entity (the last synced baseline).
pub fn reconcile(
    local_entries: &[JournalEntry],
    remote: &BTreeMap<EntityId, RemoteSnapshot>,
    linked: &BTreeMap<EntityId, Entity>,
) -> ReconcileResult {
    let mut latest: BTreeMap<&EntityId, &JournalEntry> = BTreeMap::new();
    for entry in local_entries {
        match latest.get(&entry.entity_id) {
            Some(seen) if seen.sequence >= entry.sequence => {}
            _ => {
                latest.insert(&entry.entity_id, entry);
            }
        }
    }

    let mut result = ReconcileResult {
        highest_sequence: local_entries.iter().map(|e| e.sequence).max(),
        ..ReconcileResult::default()
    };

    let ids: BTreeSet<&EntityId> = latest.keys().copied().chain(remote.keys()).collect();
    for id in ids {
        let stored = linked.get(id);
        let entry = latest.get(id).copied();
        let link = stored
            .and_then(|e| e.remote.as_ref())
            .or_else(|| entry.and_then(|e| e.snapshot.remote.as_ref()));
        let pending = entry.filter(|e| is_pending(e, link));
        let snapshot = remote.get(id);
        let remote_changed = match (snapshot, link) {
            (Some(snapshot), Some(link)) => snapshot.updated_at > link.remote_updated_at,
            (Some(_), None) => true,
            (None, _) => false,
        };

        match (pending, snapshot) {
            (Some(local), _) if local.operation == Operation::Delete => {
                reconcile_local_delete(&mut result, local, link, snapshot, remote_changed);
            }
            (Some(local), None) => {
                let mode = if link.is_some() {
                    PushMode::Update
                } else {
                    PushMode::Create
                };
                push(&mut result, local, mode);
            }
            (Some(local), Some(_)) if link.is_none() => {
                push(&mut result, local, PushMode::Create);
            }
            (Some(local), Some(_)) if !remote_changed => {
                push(&mut result, local, PushMode::Update);
            }
            (Some(local), Some(snapshot)) => {
                reconcile_both_changed(&mut result, local, stored, snapshot);
            }
            (None, Some(snapshot)) if remote_changed => {
                if let Some(base) = stored {
                    let action = if snapshot.deleted {
                        UpdateAction::Remove
                    } else {
                        UpdateAction::Apply
                    };
                    result
                        .updates_to_apply
                        .push(remote_update(base, snapshot, action));
                }
            }
            (None, _) => {}
        }
    }

    result
}

/// Entries written by sync carry `synced_local_version == local_version`
/// and are never pending.
fn is_pending(entry: &JournalEntry, link: Option<&RemoteLink>) -> bool {
    match link {
        Some(link) => entry.snapshot.local_version > link.synced_local_version,
        None => true,
    }
}

fn reconcile_local_delete(
    result: &mut ReconcileResult,
    local: &JournalEntry,
    link: Option<&RemoteLink>,
    snapshot: Option<&RemoteSnapshot>,
    remote_changed: bool,
) {
    // Never reached the remote: nothing to delete there.
    if link.is_none() {
        return;
    }
    match snapshot {
        None => push(result, local, PushMode::Delete),
        Some(snapshot) if snapshot.deleted => {}
        Some(_) if !remote_changed => push(result, local, PushMode::Delete),
        Some(snapshot) if snapshot.updated_at < local.snapshot.updated_at => {
            conflict(result, local, snapshot, Resolution::LocalWins);
            push(result, local, PushMode::Delete);
        }
        Some(snapshot) => conflict(result, local, snapshot, Resolution::Manual),
    }
}

fn reconcile_both_changed(
    result: &mut ReconcileResult,
    local: &JournalEntry,
    stored: Option<&Entity>,
    snapshot: &RemoteSnapshot,
) {
    let local_time = local.snapshot.updated_at;
    let base = stored.unwrap_or(&local.snapshot);

    if snapshot.deleted {
        if snapshot.updated_at >= local_time {
            conflict(result, local, snapshot, Resolution::RemoteWins);
            result
                .updates_to_apply
                .push(remote_update(base, snapshot, UpdateAction::Remove));
        } else {
            conflict(result, local, snapshot, Resolution::Manual);
        }
        return;
    }

    // Ties prefer local.
    if local_time >= snapshot.updated_at {
        conflict(result, local, snapshot, Resolution::LocalWins);
        push(result, local, PushMode::Update);
    } else {
        conflict(result, local, snapshot, Resolution::RemoteWins);
        result
            .updates_to_apply
            .push(remote_update(base, snapshot, UpdateAction::Apply));
    }
}

fn push(result: &mut ReconcileResult, local: &JournalEntry, mode: PushMode) {
    result.outbound_changes.push(OutboundChange {
        entity_id: local.entity_id.clone(),
        mode,
        local_sequence: local.sequence,
        entity: local.snapshot.clone(),
    });
}

fn conflict(
    result: &mut ReconcileResult,
    local: &JournalEntry,
    snapshot: &RemoteSnapshot,
    resolution: Resolution,
) {
    result.conflicts.push(ConflictRecord {
        entity_id: local.entity_id.clone(),
        local_sequence: local.sequence,
        local_snapshot: local.snapshot.clone(),
        remote_snapshot: snapshot.clone(),
        resolution,
        surfaced: true,
    });
}

/// The state to store for a remote change, derived without a clock: the
/// version moves one past `base` and is marked synced so it is not pushed back.
fn remote_update(base: &Entity, snapshot: &RemoteSnapshot, action: UpdateAction) -> EntityUpdate {
    let mut entity = base.clone();
    entity.local_version = base.local_version + 1;
    entity.updated_at = base.updated_at.max(snapshot.updated_at);
    if action == UpdateAction::Apply {
        entity.payload = snapshot.payload.clone();
    }
    entity.remote = Some(RemoteLink {
        remote_ref: snapshot.remote_ref.clone(),
        remote_version: snapshot.remote_version,
        remote_updated_at: snapshot.updated_at,
        synced_local_version: entity.local_version,
    });
    EntityUpdate {
        entity_id: base.id.clone(),
        action,
        expected_local_version: base.local_version,
        entity,
    }
}

/// Remote refs to pull for a cycle: every stored link plus links carried by
/// pending deletes, whose entities are no longer in the store.
pub fn pull_set(
    local_entries: &[JournalEntry],
    linked: &BTreeMap<EntityId, Entity>,
) -> BTreeMap<EntityId, RemoteRef> {
    let mut refs: BTreeMap<EntityId, RemoteRef> = linked
        .iter()
        .filter_map(|(id, e)| e.remote_ref().map(|r| (id.clone(), r.clone())))
        .collect();

    let mut latest: BTreeMap<&EntityId, &JournalEntry> = BTreeMap::new();
    for entry in local_entries {
        latest.insert(&entry.entity_id, entry);
    }
    for (id, entry) in latest {
        if entry.operation == Operation::Delete
            && entry.snapshot.has_unsynced_changes()
            && !linked.contains_key(id)
        {
            if let Some(remote_ref) = entry.snapshot.remote_ref() {
                refs.insert(id.clone(), remote_ref.clone());
            }
        }
    }
    refs
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_core::model::{Payload, Priority};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn remote_ref(key: &str) -> RemoteRef {
        RemoteRef::new("mem", key)
    }

    /// An entity linked at time `synced_at` with `version == synced_local_version`.
    fn linked_entity(title: &str, key: &str, synced_at: DateTime<Utc>) -> Entity {
        let mut e = Entity::new_task(title, None, Priority::Medium, vec![]);
        e.local_version = 2;
        e.updated_at = synced_at;
        e.remote = Some(RemoteLink {
            remote_ref: remote_ref(key),
            remote_version: 1,
            remote_updated_at: synced_at,
            synced_local_version: 2,
        });
        e
    }

    fn edited(base: &Entity, title: &str, at: DateTime<Utc>) -> Entity {
        let mut e = base.clone();
        e.payload.title = title.to_string();
        e.local_version += 1;
        e.updated_at = at;
        e
    }

    fn entry(sequence: u64, operation: Operation, snapshot: &Entity) -> JournalEntry {
        JournalEntry {
            sequence,
            entity_id: snapshot.id.clone(),
            operation,
            snapshot: snapshot.clone(),
            timestamp: snapshot.updated_at,
        }
    }

    fn snapshot(key: &str, title: &str, at: DateTime<Utc>) -> RemoteSnapshot {
        RemoteSnapshot {
            remote_ref: remote_ref(key),
            remote_version: 2,
            updated_at: at,
            deleted: false,
            payload: Payload {
                title: title.to_string(),
                ..Default::default()
            },
        }
    }

    fn deleted_snapshot(key: &str, at: DateTime<Utc>) -> RemoteSnapshot {
        RemoteSnapshot {
            deleted: true,
            ..snapshot(key, "", at)
        }
    }

    fn map<V>(pairs: Vec<(&Entity, V)>) -> BTreeMap<EntityId, V> {
        pairs.into_iter().map(|(e, v)| (e.id.clone(), v)).collect()
    }

    #[test]
    fn test_unlinked_local_change_is_created() {
        let task = Entity::new_task("new", None, Priority::Low, vec![]);
        let result = reconcile(
            &[entry(1, Operation::Create, &task)],
            &BTreeMap::new(),
            &BTreeMap::new(),
        );
        assert_eq!(result.outbound_changes.len(), 1);
        assert_eq!(result.outbound_changes[0].mode, PushMode::Create);
        assert_eq!(result.highest_sequence, Some(1));
        assert!(result.conflicts.is_empty());
    }

    #[test]
    fn test_later_sequence_wins_within_entity() {
        let task = Entity::new_task("v1", None, Priority::Low, vec![]);
        let v2 = edited(&task, "v2", task.updated_at + Duration::seconds(1));
        let result = reconcile(
            &[entry(1, Operation::Create, &task), entry(2, Operation::Update, &v2)],
            &BTreeMap::new(),
            &BTreeMap::new(),
        );
        assert_eq!(result.outbound_changes.len(), 1);
        assert_eq!(result.outbound_changes[0].entity.payload.title, "v2");
        assert_eq!(result.outbound_changes[0].local_sequence, 2);
    }

    #[test]
    fn test_local_only_change_pushes_update() {
        let base = linked_entity("a", "1", t(0));
        let local = edited(&base, "local", t(10));
        let result = reconcile(
            &[entry(5, Operation::Update, &local)],
            &map(vec![(&base, snapshot("1", "a", t(0)))]),
            &map(vec![(&local, local.clone())]),
        );
        assert_eq!(result.outbound_changes.len(), 1);
        assert_eq!(result.outbound_changes[0].mode, PushMode::Update);
        assert!(result.updates_to_apply.is_empty());
        assert!(result.conflicts.is_empty());
    }

    #[test]
    fn test_remote_only_change_is_applied() {
        let base = linked_entity("a", "1", t(0));
        let result = reconcile(
            &[],
            &map(vec![(&base, snapshot("1", "from remote", t(5)))]),
            &map(vec![(&base, base.clone())]),
        );
        assert_eq!(result.highest_sequence, None);
        assert_eq!(result.updates_to_apply.len(), 1);
        let update = &result.updates_to_apply[0];
        assert_eq!(update.action, UpdateAction::Apply);
        assert_eq!(update.expected_local_version, 2);
        assert_eq!(update.entity.local_version, 3);
        assert_eq!(update.entity.payload.title, "from remote");
        let link = update.entity.remote.as_ref().unwrap();
        assert_eq!(link.synced_local_version, 3);
        assert_eq!(link.remote_updated_at, t(5));
        assert!(result.outbound_changes.is_empty());
    }

    #[test]
    fn test_sync_written_entries_are_not_pending() {
        let base = linked_entity("a", "1", t(0));
        let result = reconcile(
            &[entry(3, Operation::Update, &base)],
            &map(vec![(&base, snapshot("1", "a", t(0)))]),
            &map(vec![(&base, base.clone())]),
        );
        assert!(result.is_empty());
        assert_eq!(result.highest_sequence, Some(3));
    }

    #[test]
    fn test_concurrent_edits_local_newer_wins() {
        // Linked at T0, remote edited at T1, local edited at T2.
        let base = linked_entity("a", "1", t(0));
        let local = edited(&base, "local", t(20));
        let remote_t1 = snapshot("1", "remote", t(10));
        let result = reconcile(
            &[entry(7, Operation::Update, &local)],
            &map(vec![(&base, remote_t1.clone())]),
            &map(vec![(&local, local.clone())]),
        );

        assert_eq!(result.conflicts.len(), 1);
        let conflict = &result.conflicts[0];
        assert_eq!(conflict.resolution, Resolution::LocalWins);
        assert_eq!(conflict.remote_snapshot, remote_t1);
        assert_eq!(conflict.local_sequence, 7);
        assert!(conflict.surfaced);
        assert_eq!(result.outbound_changes.len(), 1);
        assert_eq!(result.outbound_changes[0].mode, PushMode::Update);
        assert!(result.updates_to_apply.is_empty());
    }

    #[test]
    fn test_concurrent_edits_remote_newer_wins() {
        let base = linked_entity("a", "1", t(0));
        let local = edited(&base, "local", t(10));
        let result = reconcile(
            &[entry(7, Operation::Update, &local)],
            &map(vec![(&base, snapshot("1", "remote", t(20)))]),
            &map(vec![(&local, local.clone())]),
        );
        assert_eq!(result.conflicts[0].resolution, Resolution::RemoteWins);
        assert_eq!(result.conflicts[0].local_snapshot, local);
        assert!(result.outbound_changes.is_empty());
        assert_eq!(result.updates_to_apply.len(), 1);
        assert_eq!(result.updates_to_apply[0].expected_local_version, 3);
        assert_eq!(result.updates_to_apply[0].entity.payload.title, "remote");
    }

    #[test]
    fn test_equal_timestamps_prefer_local() {
        let base = linked_entity("a", "1", t(0));
        let local = edited(&base, "local", t(10));
        let result = reconcile(
            &[entry(2, Operation::Update, &local)],
            &map(vec![(&base, snapshot("1", "remote", t(10)))]),
            &map(vec![(&local, local.clone())]),
        );
        assert_eq!(result.conflicts[0].resolution, Resolution::LocalWins);
    }

    #[test]
    fn test_local_delete_against_unchanged_remote() {
        let base = linked_entity("a", "1", t(0));
        let tombstone = edited(&base, "a", t(10));
        let result = reconcile(
            &[entry(4, Operation::Delete, &tombstone)],
            &map(vec![(&base, snapshot("1", "a", t(0)))]),
            &BTreeMap::new(),
        );
        assert_eq!(result.outbound_changes.len(), 1);
        assert_eq!(result.outbound_changes[0].mode, PushMode::Delete);
        assert!(result.conflicts.is_empty());
    }

    #[test]
    fn test_local_delete_beats_older_remote_update() {
        let base = linked_entity("a", "1", t(0));
        let tombstone = edited(&base, "a", t(20));
        let result = reconcile(
            &[entry(4, Operation::Delete, &tombstone)],
            &map(vec![(&base, snapshot("1", "remote", t(10)))]),
            &BTreeMap::new(),
        );
        assert_eq!(result.conflicts[0].resolution, Resolution::LocalWins);
        assert_eq!(result.outbound_changes[0].mode, PushMode::Delete);
    }

    #[test]
    fn test_remote_update_after_local_delete_is_manual() {
        let base = linked_entity("a", "1", t(0));
        let tombstone = edited(&base, "a", t(10));
        let result = reconcile(
            &[entry(4, Operation::Delete, &tombstone)],
            &map(vec![(&base, snapshot("1", "remote", t(20)))]),
            &BTreeMap::new(),
        );
        assert_eq!(result.conflicts[0].resolution, Resolution::Manual);
        assert!(result.outbound_changes.is_empty());
        assert!(result.updates_to_apply.is_empty());
    }

    #[test]
    fn test_manual_conflict_holds_checkpoint_below_its_entry() {
        let base = linked_entity("a", "1", t(0));
        let tombstone = edited(&base, "a", t(10));
        let other = Entity::new_task("other", None, Priority::Low, vec![]);
        let result = reconcile(
            &[
                entry(4, Operation::Delete, &tombstone),
                entry(5, Operation::Create, &other),
            ],
            &map(vec![(&base, snapshot("1", "remote", t(20)))]),
            &BTreeMap::new(),
        );
        assert_eq!(result.highest_sequence, Some(5));
        assert_eq!(result.checkpoint_target(), Some(3));

        let clean = reconcile(&[entry(5, Operation::Create, &other)], &BTreeMap::new(), &BTreeMap::new());
        assert_eq!(clean.checkpoint_target(), Some(5));
    }

    #[test]
    fn test_remote_delete_against_local_update() {
        let base = linked_entity("a", "1", t(0));
        let local = edited(&base, "local", t(10));

        let newer_delete = reconcile(
            &[entry(2, Operation::Update, &local)],
            &map(vec![(&base, deleted_snapshot("1", t(20)))]),
            &map(vec![(&local, local.clone())]),
        );
        assert_eq!(newer_delete.conflicts[0].resolution, Resolution::RemoteWins);
        assert_eq!(newer_delete.updates_to_apply[0].action, UpdateAction::Remove);

        let older_delete = reconcile(
            &[entry(2, Operation::Update, &local)],
            &map(vec![(&base, deleted_snapshot("1", t(5)))]),
            &map(vec![(&local, local.clone())]),
        );
        assert_eq!(older_delete.conflicts[0].resolution, Resolution::Manual);
        assert!(older_delete.updates_to_apply.is_empty());
        assert!(older_delete.outbound_changes.is_empty());
    }

    #[test]
    fn test_remote_only_delete_removes_locally() {
        let base = linked_entity("a", "1", t(0));
        let result = reconcile(
            &[],
            &map(vec![(&base, deleted_snapshot("1", t(5)))]),
            &map(vec![(&base, base.clone())]),
        );
        assert_eq!(result.updates_to_apply.len(), 1);
        assert_eq!(result.updates_to_apply[0].action, UpdateAction::Remove);
        assert!(result.conflicts.is_empty());
    }

    #[test]
    fn test_both_deleted_is_noop() {
        let base = linked_entity("a", "1", t(0));
        let tombstone = edited(&base, "a", t(10));
        let result = reconcile(
            &[entry(4, Operation::Delete, &tombstone)],
            &map(vec![(&base, deleted_snapshot("1", t(5)))]),
            &BTreeMap::new(),
        );
        assert!(result.is_empty());
    }

    #[test]
    fn test_unsynced_create_then_delete_is_noop() {
        let task = Entity::new_task("brief", None, Priority::Low, vec![]);
        let tombstone = edited(&task, "brief", task.updated_at + Duration::seconds(1));
        let result = reconcile(
            &[
                entry(1, Operation::Create, &task),
                entry(2, Operation::Delete, &tombstone),
            ],
            &BTreeMap::new(),
            &BTreeMap::new(),
        );
        assert!(result.is_empty());
        assert_eq!(result.highest_sequence, Some(2));
    }

    #[test]
    fn test_reconcile_is_deterministic() {
        let mut entries = Vec::new();
        let mut remote = BTreeMap::new();
        let mut linked = BTreeMap::new();
        for i in 0..20i64 {
            let base = linked_entity(&format!("task {i}"), &i.to_string(), t(0));
            let local = edited(&base, "local", t(i));
            entries.push(entry(i as u64 + 1, Operation::Update, &local));
            remote.insert(base.id.clone(), snapshot(&i.to_string(), "remote", t(10)));
            linked.insert(local.id.clone(), local);
        }
        let first = reconcile(&entries, &remote, &linked);
        let mut reversed = entries.clone();
        reversed.reverse();
        let second = reconcile(&reversed, &remote, &linked);
        assert_eq!(first, second);
        assert_eq!(first.conflicts.len(), 20);

        let ids: Vec<_> = first.conflicts.iter().map(|c| c.entity_id.clone()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn test_pull_set_includes_pending_delete_links() {
        let kept = linked_entity("kept", "1", t(0));
        let gone = linked_entity("gone", "2", t(0));
        let tombstone = edited(&gone, "gone", t(5));
        let unlinked = Entity::new_task("local only", None, Priority::Low, vec![]);

        let refs = pull_set(
            &[
                entry(1, Operation::Delete, &tombstone),
                entry(2, Operation::Create, &unlinked),
            ],
            &map(vec![(&kept, kept.clone())]),
        );
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[&kept.id], remote_ref("1"));
        assert_eq!(refs[&gone.id], remote_ref("2"));
    }
}
