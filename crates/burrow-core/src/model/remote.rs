use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entity::{Payload, RemoteRef};

/// The state of one remote issue as reported by a tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSnapshot {
    pub remote_ref: RemoteRef,
    pub remote_version: u64,
    pub updated_at: DateTime<Utc>,
    /// Closed/removed on the remote side. `updated_at` is then the deletion time.
    #[serde(default)]
    pub deleted: bool,
    pub payload: Payload,
}
