use serde::{Deserialize, Serialize};

use super::entity::{Entity, EntityId};
use super::remote::RemoteSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    LocalWins,
    RemoteWins,
    /// Surfaced but not auto-resolved; nothing was applied or pushed.
    Manual,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::LocalWins => "local-wins",
            Resolution::RemoteWins => "remote-wins",
            Resolution::Manual => "manual",
        }
    }
}

/// Evidence of divergent concurrent edits. Both sides are kept so the
/// losing version can be reviewed after the winner has been applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub entity_id: EntityId,
    /// Journal sequence of the local side; with `entity_id` this identifies the conflict.
    pub local_sequence: u64,
    pub local_snapshot: Entity,
    pub remote_snapshot: RemoteSnapshot,
    pub resolution: Resolution,
    pub surfaced: bool,
}

impl ConflictRecord {
    pub fn key(&self) -> (EntityId, u64) {
        (self.entity_id.clone(), self.local_sequence)
    }
}
