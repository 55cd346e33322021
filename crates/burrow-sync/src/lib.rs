pub mod error;
pub mod folder;
pub mod reconcile;
pub mod report;
pub mod resolve;
pub mod session;
pub mod tracker;

pub use error::{RemoteError, SyncError};
pub use folder::FolderTracker;
pub use reconcile::{reconcile, EntityUpdate, OutboundChange, ReconcileResult, UpdateAction};
pub use report::{PushFailure, SyncMode, SyncOutcome, SyncReport, SyncStage};
pub use resolve::{resolve_conflict, Keep};
pub use session::{CancelFlag, SyncSession, SyncState};
pub use tracker::{tracker_from_config, IssueTracker, MemoryTracker, PushMode, PushReceipt};
