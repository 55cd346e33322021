use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Data key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("Integrity violation in {id}: {reason}")]
    IntegrityViolation { id: String, reason: String },

    #[error(
        "Invalid checkpoint {requested} (current checkpoint {current}, highest sequence {highest})"
    )]
    InvalidCheckpoint {
        requested: u64,
        current: u64,
        highest: u64,
    },

    #[error("Journal corrupt at line {line}: {reason}")]
    JournalCorrupt { line: usize, reason: String },

    #[error("Entity not found: {id}")]
    NotFound { id: String },

    #[error("Ambiguous entity ID prefix '{prefix}': {matches} matches")]
    Ambiguous { prefix: String, matches: usize },

    #[error("Invalid entity ID: {0}")]
    InvalidId(String),

    #[error("Store not initialized (run `burrow init`)")]
    NotInitialized,

    #[error("Config error: {0}")]
    Config(#[from] git2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl CoreError {
    pub(crate) fn integrity(id: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::IntegrityViolation {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Fatal errors must reach the user unchanged and are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoreError::KeyUnavailable(_)
                | CoreError::IntegrityViolation { .. }
                | CoreError::InvalidCheckpoint { .. }
                | CoreError::JournalCorrupt { .. }
        )
    }
}
