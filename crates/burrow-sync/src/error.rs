use burrow_core::error::CoreError;

/// Failure reported by an issue tracker adapter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Remote issue not found: {0}")]
    NotFound(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Another sync session is already running")]
    SyncInProgress,

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Sync is not configured: {0}")]
    NotConfigured(String),
}
