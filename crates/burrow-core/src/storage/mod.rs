pub mod conflicts;
pub mod journal;
pub mod record_store;

pub use conflicts::{ConflictLog, LoggedConflict};
pub use journal::{ChangeJournal, JournalIter};
pub use record_store::RecordStore;
