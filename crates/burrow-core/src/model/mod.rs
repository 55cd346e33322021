pub mod conflict;
pub mod entity;
pub mod journal;
pub mod remote;
pub mod transcript;

pub use conflict::{ConflictRecord, Resolution};
pub use entity::{
    Entity, EntityId, EntityKind, Payload, Priority, RemoteLink, RemoteRef, TaskStatus,
};
pub use journal::{JournalEntry, Operation};
pub use remote::RemoteSnapshot;
pub use transcript::{Role, TranscriptEntry};
