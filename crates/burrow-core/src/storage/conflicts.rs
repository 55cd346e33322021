use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::crypto::{DataKey, Sealed};
use crate::error::CoreError;
use crate::fsutil::write_atomic;
use crate::model::{ConflictRecord, EntityId};

pub const CONFLICTS_FILE: &str = "conflicts.json";
const CONFLICTS_AAD: &[u8] = b"burrow:conflicts:v1";

/// A conflict as kept on disk, with detection and acknowledgment times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedConflict {
    #[serde(flatten)]
    pub record: ConflictRecord,
    pub detected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize)]
struct ConflictFile {
    version: u32,
    sealed: Sealed,
}

/// Encrypted, persistent log of sync conflicts. Records stay until the
/// user acknowledges them; acknowledged records are kept for `--all` listings.
pub struct ConflictLog {
    path: PathBuf,
    key: Arc<DataKey>,
    guard: Mutex<()>,
}

impl ConflictLog {
    pub fn open(root: &Path, key: Arc<DataKey>) -> Self {
        Self {
            path: root.join(CONFLICTS_FILE),
            key,
            guard: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<Vec<LoggedConflict>, CoreError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let file: ConflictFile = serde_json::from_slice(&raw)
            .map_err(|e| CoreError::integrity(CONFLICTS_FILE, format!("unreadable: {e}")))?;
        let plain = self.key.open(&file.sealed, CONFLICTS_AAD, CONFLICTS_FILE)?;
        serde_json::from_slice(&plain)
            .map_err(|e| CoreError::integrity(CONFLICTS_FILE, format!("invalid contents: {e}")))
    }

    fn save(&self, conflicts: &[LoggedConflict]) -> Result<(), CoreError> {
        let file = ConflictFile {
            version: 1,
            sealed: self.key.seal(&serde_json::to_vec(conflicts)?, CONFLICTS_AAD)?,
        };
        write_atomic(&self.path, &serde_json::to_vec(&file)?)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>, CoreError> {
        self.guard
            .lock()
            .map_err(|e| CoreError::Io(std::io::Error::other(format!("conflict log lock poisoned: {e}"))))
    }

    /// Add conflicts not already logged, keyed by entity id and local
    /// sequence. Returns how many were new.
    pub fn record(&self, conflicts: &[ConflictRecord]) -> Result<usize, CoreError> {
        if conflicts.is_empty() {
            return Ok(0);
        }
        let _guard = self.lock()?;
        let mut logged = self.load()?;
        let now = Utc::now();
        let mut added = 0;
        for conflict in conflicts {
            if logged.iter().any(|c| c.record.key() == conflict.key()) {
                continue;
            }
            info!(
                id = %conflict.entity_id,
                sequence = conflict.local_sequence,
                resolution = conflict.resolution.as_str(),
                "conflict recorded"
            );
            logged.push(LoggedConflict {
                record: conflict.clone(),
                detected_at: now,
                acknowledged_at: None,
            });
            added += 1;
        }
        if added > 0 {
            self.save(&logged)?;
        }
        Ok(added)
    }

    /// Conflicts in detection order; acknowledged ones only when `include_acknowledged`.
    pub fn list(&self, include_acknowledged: bool) -> Result<Vec<LoggedConflict>, CoreError> {
        let _guard = self.lock()?;
        let mut logged = self.load()?;
        if !include_acknowledged {
            logged.retain(|c| c.record.surfaced);
        }
        Ok(logged)
    }

    pub fn unacknowledged_count(&self) -> Result<usize, CoreError> {
        Ok(self.list(false)?.len())
    }

    /// Clear the surfaced flag on every open conflict for `id`.
    /// Returns how many were acknowledged.
    pub fn acknowledge(&self, id: &EntityId) -> Result<usize, CoreError> {
        let _guard = self.lock()?;
        let mut logged = self.load()?;
        let now = Utc::now();
        let mut count = 0;
        for conflict in logged
            .iter_mut()
            .filter(|c| c.record.entity_id == *id && c.record.surfaced)
        {
            conflict.record.surfaced = false;
            conflict.acknowledged_at = Some(now);
            count += 1;
        }
        if count > 0 {
            self.save(&logged)?;
            info!(id = %id, count, "conflicts acknowledged");
        }
        Ok(count)
    }
}
