use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crypto::{DataKey, Sealed};
use crate::error::CoreError;
use crate::fsutil::write_atomic;
use crate::model::entity::is_lower_hex;
use crate::model::{Entity, EntityId, EntityKind};

pub const RECORDS_DIR: &str = "records";
const ENVELOPE_VERSION: u32 = 1;

/// On-disk form of one record. Only `id` and `kind` are in clear text,
/// and both are bound into the tag as associated data.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    id: EntityId,
    kind: EntityKind,
    #[serde(flatten)]
    sealed: Sealed,
}

/// Encrypted entity snapshots, one file per entity:
///   records/<ab>/<full-id>.json
pub struct RecordStore {
    dir: PathBuf,
    key: Arc<DataKey>,
}

impl RecordStore {
    pub fn open(root: &Path, key: Arc<DataKey>) -> Result<Self, CoreError> {
        let dir = root.join(RECORDS_DIR);
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, key })
    }

    fn path_for(&self, id: &EntityId) -> PathBuf {
        self.dir
            .join(id.fanout_prefix())
            .join(format!("{}.json", id.as_str()))
    }

    /// Encrypt and persist an entity, replacing any previous version.
    pub fn put(&self, entity: &Entity) -> Result<(), CoreError> {
        let plaintext = serde_json::to_vec(entity)?;
        let sealed = self
            .key
            .seal(&plaintext, &record_aad(&entity.id, entity.kind))?;
        let envelope = Envelope {
            version: ENVELOPE_VERSION,
            id: entity.id.clone(),
            kind: entity.kind,
            sealed,
        };
        write_atomic(&self.path_for(&entity.id), &serde_json::to_vec(&envelope)?)?;
        debug!(id = %entity.id, version = entity.local_version, "stored record");
        Ok(())
    }

    /// Load and verify an entity. A record that exists but fails to parse or
    /// authenticate is an `IntegrityViolation`, never `None`.
    pub fn get(&self, id: &EntityId) -> Result<Option<Entity>, CoreError> {
        let path = self.path_for(id);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let envelope = parse_envelope(id, &raw)?;
        self.decrypt(&envelope).map(Some)
    }

    /// Remove a record. Deleting a missing record is not an error.
    pub fn delete(&self, id: &EntityId) -> Result<(), CoreError> {
        match fs::remove_file(self.path_for(id)) {
            Ok(()) => {
                debug!(id = %id, "deleted record");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// All entities of one kind, ordered by id.
    pub fn list(&self, kind: EntityKind) -> Result<Vec<Entity>, CoreError> {
        let mut entities = Vec::new();
        for id in self.ids()? {
            let raw = fs::read(self.path_for(&id))?;
            let envelope = parse_envelope(&id, &raw)?;
            if envelope.kind == kind {
                entities.push(self.decrypt(&envelope)?);
            }
        }
        Ok(entities)
    }

    /// All entities of every kind, ordered by id.
    pub fn list_all(&self) -> Result<Vec<Entity>, CoreError> {
        let mut entities = Vec::new();
        for id in self.ids()? {
            if let Some(entity) = self.get(&id)? {
                entities.push(entity);
            }
        }
        Ok(entities)
    }

    /// Ids of every stored record, ordered. Reads file names only.
    pub fn ids(&self) -> Result<Vec<EntityId>, CoreError> {
        scan_ids(&self.dir)
    }

    /// Resolve a full id or a unique prefix.
    pub fn resolve(&self, id_or_prefix: &str) -> Result<EntityId, CoreError> {
        if let Ok(id) = EntityId::parse(id_or_prefix) {
            if self.path_for(&id).is_file() {
                return Ok(id);
            }
            return Err(CoreError::NotFound {
                id: id_or_prefix.to_string(),
            });
        }
        if id_or_prefix.is_empty() || !is_lower_hex(id_or_prefix) {
            return Err(CoreError::InvalidId(id_or_prefix.to_string()));
        }

        let matches: Vec<EntityId> = self
            .ids()?
            .into_iter()
            .filter(|id| id.as_str().starts_with(id_or_prefix))
            .collect();

        match matches.len() {
            0 => Err(CoreError::NotFound {
                id: id_or_prefix.to_string(),
            }),
            1 => Ok(matches[0].clone()),
            n => Err(CoreError::Ambiguous {
                prefix: id_or_prefix.to_string(),
                matches: n,
            }),
        }
    }

    /// Check every envelope parses and matches its file name, without
    /// touching the key. Returns the number of records.
    pub fn verify(root: &Path) -> Result<usize, CoreError> {
        let dir = root.join(RECORDS_DIR);
        if !dir.is_dir() {
            return Ok(0);
        }
        let ids = scan_ids(&dir)?;
        for id in &ids {
            let path = dir
                .join(id.fanout_prefix())
                .join(format!("{}.json", id.as_str()));
            parse_envelope(id, &fs::read(path)?)?;
        }
        Ok(ids.len())
    }

    fn decrypt(&self, envelope: &Envelope) -> Result<Entity, CoreError> {
        let plaintext = self.key.open(
            &envelope.sealed,
            &record_aad(&envelope.id, envelope.kind),
            envelope.id.as_str(),
        )?;
        let entity: Entity = serde_json::from_slice(&plaintext).map_err(|e| {
            CoreError::integrity(envelope.id.as_str(), format!("decrypted record is invalid: {e}"))
        })?;
        if entity.id != envelope.id || entity.kind != envelope.kind {
            return Err(CoreError::integrity(
                envelope.id.as_str(),
                "decrypted record does not match its envelope",
            ));
        }
        Ok(entity)
    }
}

fn record_aad(id: &EntityId, kind: EntityKind) -> Vec<u8> {
    format!("burrow:record:v1:{}:{}", id.as_str(), kind.as_str()).into_bytes()
}

fn parse_envelope(id: &EntityId, raw: &[u8]) -> Result<Envelope, CoreError> {
    let envelope: Envelope = serde_json::from_slice(raw)
        .map_err(|e| CoreError::integrity(id.as_str(), format!("unreadable envelope: {e}")))?;
    if envelope.version != ENVELOPE_VERSION {
        return Err(CoreError::integrity(
            id.as_str(),
            format!("unsupported envelope version {}", envelope.version),
        ));
    }
    if envelope.id != *id {
        return Err(CoreError::integrity(
            id.as_str(),
            format!("envelope claims id {}", envelope.id),
        ));
    }
    Ok(envelope)
}

fn scan_ids(dir: &Path) -> Result<Vec<EntityId>, CoreError> {
    let mut ids = Vec::new();
    let fanouts = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
        Err(e) => return Err(e.into()),
    };
    for fanout in fanouts {
        let fanout = fanout?;
        if !fanout.file_type()?.is_dir() {
            continue;
        }
        for file in fs::read_dir(fanout.path())? {
            let name = file?.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            // Skips temp files left by an interrupted write.
            if let Ok(id) = EntityId::parse(stem) {
                ids.push(id);
            }
        }
    }
    ids.sort();
    Ok(ids)
}
