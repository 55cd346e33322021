use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::transcript::{Role, TranscriptEntry};
use crate::error::CoreError;

/// A unique identifier for an entity.
/// Generated as UUID v4 hex (no dashes); also used as the on-disk file stem.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(String);

impl EntityId {
    pub const LEN: usize = 32;

    pub fn new() -> Self {
        Self(Uuid::new_v4().as_simple().to_string())
    }

    /// Parse and validate a full ID: exactly 32 lowercase hex characters.
    pub fn parse(s: impl Into<String>) -> Result<Self, CoreError> {
        let s = s.into();
        if s.len() != Self::LEN {
            return Err(CoreError::InvalidId(format!(
                "ID must be {} characters, got {}",
                Self::LEN,
                s.len()
            )));
        }
        if !is_lower_hex(&s) {
            return Err(CoreError::InvalidId(format!("ID must be lowercase hex: {s}")));
        }
        Ok(Self(s))
    }

    /// The 2-char prefix used for fanout in records/<ab>/<full-id>.json
    pub fn fanout_prefix(&self) -> &str {
        &self.0[..2]
    }

    pub fn short(&self) -> &str {
        &self.0[..8]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub(crate) fn is_lower_hex(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Task,
    Conversation,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Task => "task",
            EntityKind::Conversation => "conversation",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Done,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

/// The user-visible content of an entity. This is what gets encrypted,
/// pushed to trackers, and compared during reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub title: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transcript: Vec<TranscriptEntry>,
}

/// Identifier of an issue in a remote tracker, e.g. `github:owner/repo#12`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RemoteRef {
    pub tracker: String,
    pub key: String,
}

impl RemoteRef {
    pub fn new(tracker: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            tracker: tracker.into(),
            key: key.into(),
        }
    }
}

impl std::fmt::Display for RemoteRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.tracker, self.key)
    }
}

/// Association between a local entity and its remote issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteLink {
    pub remote_ref: RemoteRef,
    pub remote_version: u64,
    /// Remote timestamp as of the last successful sync: the last common version.
    pub remote_updated_at: DateTime<Utc>,
    /// Highest `local_version` whose content is reflected remotely.
    pub synced_local_version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub payload: Payload,
    pub local_version: u64,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteLink>,
}

impl Entity {
    pub fn new(kind: EntityKind, payload: Payload) -> Self {
        Self {
            id: EntityId::new(),
            kind,
            payload,
            local_version: 1,
            updated_at: Utc::now(),
            remote: None,
        }
    }

    pub fn new_task(title: &str, body: Option<&str>, priority: Priority, tags: Vec<String>) -> Self {
        Self::new(
            EntityKind::Task,
            Payload {
                title: title.to_string(),
                body: body.map(String::from),
                priority,
                tags,
                ..Default::default()
            },
        )
    }

    pub fn new_conversation(title: &str) -> Self {
        Self::new(
            EntityKind::Conversation,
            Payload {
                title: title.to_string(),
                ..Default::default()
            },
        )
    }

    /// Record a mutation: bump `local_version` and move `updated_at` strictly forward,
    /// even if the wall clock stalls or steps back.
    pub fn touch(&mut self) {
        self.local_version += 1;
        let now = Utc::now();
        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + Duration::milliseconds(1)
        };
    }

    /// Append a transcript message. Callers going through `Workspace::update`
    /// get the version bump from there.
    pub fn push_message(&mut self, role: Role, text: &str) {
        self.payload.transcript.push(TranscriptEntry {
            timestamp: Utc::now(),
            role,
            text: text.to_string(),
        });
    }

    pub fn remote_ref(&self) -> Option<&RemoteRef> {
        self.remote.as_ref().map(|link| &link.remote_ref)
    }

    /// True when this version carries edits the remote has not seen yet.
    pub fn has_unsynced_changes(&self) -> bool {
        match &self.remote {
            Some(link) => self.local_version > link.synced_local_version,
            None => true,
        }
    }
}
