use burrow_core::model::{ConflictRecord, EntityId};
use serde::Serialize;

use crate::reconcile::{EntityUpdate, OutboundChange};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    DryRun,
    Apply,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::DryRun => "dry-run",
            SyncMode::Apply => "apply",
        }
    }
}

/// Where a cycle stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStage {
    Pulling,
    Reconciling,
    Applying,
    Checkpointing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Plan computed, nothing written.
    DryRun,
    /// Everything applied and pushed; checkpoint advanced.
    Applied,
    /// Some pushes failed; checkpoint left where it was.
    PartiallyApplied,
    /// Stopped by the cancel flag.
    Cancelled { stage: SyncStage },
    /// A remote error stopped the cycle before any mutation, or (stage
    /// `Applying`) a pushed change could not be linked locally. `pushed`
    /// and `failed` still list what happened before the stop.
    Failed { stage: SyncStage, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushFailure {
    pub entity_id: EntityId,
    pub error: String,
}

/// Everything a cycle planned and did. Contains no timestamps of its own,
/// so two dry runs over the same state compare equal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub mode: SyncMode,
    pub outcome: SyncOutcome,
    pub checkpoint_before: u64,
    pub checkpoint_after: u64,
    pub updates: Vec<EntityUpdate>,
    pub outbound: Vec<OutboundChange>,
    pub conflicts: Vec<ConflictRecord>,
    pub applied: Vec<EntityId>,
    pub superseded: Vec<EntityId>,
    pub pushed: Vec<EntityId>,
    pub failed: Vec<PushFailure>,
}

impl SyncReport {
    pub(crate) fn new(mode: SyncMode, checkpoint: u64) -> Self {
        Self {
            mode,
            outcome: SyncOutcome::DryRun,
            checkpoint_before: checkpoint,
            checkpoint_after: checkpoint,
            updates: Vec::new(),
            outbound: Vec::new(),
            conflicts: Vec::new(),
            applied: Vec::new(),
            superseded: Vec::new(),
            pushed: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, SyncOutcome::DryRun | SyncOutcome::Applied)
    }
}
