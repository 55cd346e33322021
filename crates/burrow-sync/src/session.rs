use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use burrow_core::model::{Entity, EntityId, JournalEntry, Operation, RemoteLink};
use burrow_core::Workspace;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::reconcile::{pull_set, reconcile, EntityUpdate, OutboundChange, UpdateAction};
use crate::report::{PushFailure, SyncMode, SyncOutcome, SyncReport, SyncStage};
use crate::tracker::{IssueTracker, PushMode, PushReceipt};

pub const SYNC_LOCK_FILE: &str = "sync.lock";

/// Cooperative cancellation shared between a session and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Pulling,
    Reconciling,
    DryRunReport,
    Applying,
    Checkpointing,
    Failed,
}

/// Exclusive lock on `<root>/sync.lock`, released on drop.
pub(crate) struct SessionLock {
    file: File,
}

impl SessionLock {
    pub(crate) fn acquire(root: &Path) -> Result<Self, SyncError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(root.join(SYNC_LOCK_FILE))
            .map_err(|e| SyncError::Core(e.into()))?;
        fs2::FileExt::try_lock_exclusive(&file).map_err(|_| SyncError::SyncInProgress)?;
        Ok(Self { file })
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// One pull, reconcile and (optionally) apply cycle against a tracker.
pub struct SyncSession<'a> {
    workspace: &'a Workspace,
    tracker: &'a dyn IssueTracker,
    cancel: CancelFlag,
    state: SyncState,
}

impl<'a> SyncSession<'a> {
    pub fn new(workspace: &'a Workspace, tracker: &'a dyn IssueTracker) -> Self {
        Self {
            workspace,
            tracker,
            cancel: CancelFlag::new(),
            state: SyncState::Idle,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    fn transition(&mut self, to: SyncState) {
        debug!(from = ?self.state, to = ?to, "sync state");
        self.state = to;
    }

    /// Run one cycle. Remote failures, and local failures after the remote
    /// accepted a push, come back as a `Failed` report; other store, key
    /// and journal errors are returned unchanged.
    pub fn run(&mut self, mode: SyncMode) -> Result<SyncReport, SyncError> {
        let result = self.run_cycle(mode);
        match &result {
            Ok(report) if matches!(report.outcome, SyncOutcome::Failed { .. }) => {
                self.transition(SyncState::Failed)
            }
            Ok(report) => {
                info!(
                    tracker = self.tracker.name(),
                    mode = mode.as_str(),
                    outcome = ?report.outcome,
                    pushed = report.pushed.len(),
                    applied = report.applied.len(),
                    conflicts = report.conflicts.len(),
                    "sync cycle finished"
                );
                self.transition(SyncState::Idle)
            }
            Err(e) => {
                warn!(error = %e, "sync cycle aborted");
                self.transition(SyncState::Failed)
            }
        }
        result
    }

    fn run_cycle(&mut self, mode: SyncMode) -> Result<SyncReport, SyncError> {
        let workspace = self.workspace;
        let _lock = SessionLock::acquire(workspace.root())?;
        let journal = workspace.journal();
        let checkpoint = journal.last_checkpoint()?;
        let mut report = SyncReport::new(mode, checkpoint);

        self.transition(SyncState::Pulling);
        let entries: Vec<JournalEntry> = journal
            .read_since(checkpoint)?
            .collect::<Result<_, _>>()?;
        let linked: BTreeMap<EntityId, Entity> = workspace
            .store()
            .list_all()?
            .into_iter()
            .filter(|e| e.remote.is_some())
            .map(|e| (e.id.clone(), e))
            .collect();

        let mut remote = BTreeMap::new();
        for (id, remote_ref) in pull_set(&entries, &linked) {
            match self.tracker.pull(&remote_ref) {
                Ok(snapshot) => {
                    remote.insert(id, snapshot);
                }
                Err(e) => {
                    warn!(remote = %remote_ref, error = %e, "pull failed");
                    report.outcome = SyncOutcome::Failed {
                        stage: SyncStage::Pulling,
                        reason: format!("{remote_ref}: {e}"),
                    };
                    return Ok(report);
                }
            }
        }
        debug!(entries = entries.len(), pulled = remote.len(), "pulled remote state");

        if self.cancel.is_cancelled() {
            report.outcome = SyncOutcome::Cancelled {
                stage: SyncStage::Reconciling,
            };
            return Ok(report);
        }
        self.transition(SyncState::Reconciling);
        let plan = reconcile(&entries, &remote, &linked);
        report.updates = plan.updates_to_apply.clone();
        report.outbound = plan.outbound_changes.clone();
        report.conflicts = plan.conflicts.clone();

        if mode == SyncMode::DryRun {
            self.transition(SyncState::DryRunReport);
            report.outcome = SyncOutcome::DryRun;
            return Ok(report);
        }

        if self.cancel.is_cancelled() {
            report.outcome = SyncOutcome::Cancelled {
                stage: SyncStage::Applying,
            };
            return Ok(report);
        }
        self.transition(SyncState::Applying);
        workspace.conflicts().record(&plan.conflicts)?;

        for update in &plan.updates_to_apply {
            if self.apply_update(update)? {
                report.applied.push(update.entity_id.clone());
            } else {
                warn!(id = %update.entity_id, "skipping remote update: local entity changed since reconciliation");
                report.superseded.push(update.entity_id.clone());
            }
        }

        for change in &plan.outbound_changes {
            if self.cancel.is_cancelled() {
                report.outcome = SyncOutcome::Cancelled {
                    stage: SyncStage::Applying,
                };
                return Ok(report);
            }
            match self.tracker.push(&change.entity, change.mode) {
                Ok(receipt) => {
                    report.pushed.push(change.entity_id.clone());
                    // The remote already has it; report what happened so far.
                    if let Err(e) = self.record_push(change, &receipt) {
                        warn!(id = %change.entity_id, error = %e, "pushed but failed to record link");
                        report.outcome = SyncOutcome::Failed {
                            stage: SyncStage::Applying,
                            reason: format!("{}: pushed but link not recorded: {e}", change.entity_id),
                        };
                        return Ok(report);
                    }
                }
                Err(e) => {
                    warn!(id = %change.entity_id, mode = change.mode.as_str(), error = %e, "push failed");
                    report.failed.push(PushFailure {
                        entity_id: change.entity_id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if !report.failed.is_empty() {
            report.outcome = SyncOutcome::PartiallyApplied;
            return Ok(report);
        }

        self.transition(SyncState::Checkpointing);
        if let Some(target) = plan.checkpoint_target() {
            journal.checkpoint(target)?;
        }
        report.checkpoint_after = journal.last_checkpoint()?;
        report.outcome = SyncOutcome::Applied;
        Ok(report)
    }

    /// Write a remote change if the stored entity has not moved since
    /// reconciliation. Returns false when the update was superseded.
    fn apply_update(&self, update: &EntityUpdate) -> Result<bool, SyncError> {
        let applied = self.workspace.write(|w| {
            match w.get(&update.entity_id)? {
                Some(current) if current.local_version == update.expected_local_version => {}
                _ => return Ok(false),
            }
            let operation = match update.action {
                UpdateAction::Apply => Operation::Update,
                UpdateAction::Remove => Operation::Delete,
            };
            w.commit(operation, &update.entity)?;
            Ok(true)
        })?;
        Ok(applied)
    }

    /// Store the link returned by a successful create or update push on the
    /// current entity. Edits made after the pushed snapshot stay pending.
    fn record_push(&self, change: &OutboundChange, receipt: &PushReceipt) -> Result<(), SyncError> {
        if change.mode == PushMode::Delete {
            return Ok(());
        }
        self.workspace.write(|w| {
            let Some(mut current) = w.get(&change.entity_id)? else {
                return Ok(());
            };
            let synced_local_version = if current.local_version == change.entity.local_version {
                current.local_version + 1
            } else {
                change.entity.local_version
            };
            current.remote = Some(RemoteLink {
                remote_ref: receipt.remote_ref.clone(),
                remote_version: receipt.remote_version,
                remote_updated_at: receipt.remote_updated_at,
                synced_local_version,
            });
            current.touch();
            w.commit(Operation::Update, &current)?;
            Ok(())
        })?;
        Ok(())
    }
}
