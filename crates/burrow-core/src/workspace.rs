use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{info, warn};

use crate::config::{BurrowConfig, SecretBackend, CONFIG_FILE};
use crate::crypto::{DataKey, FileSecretStore, KeyManager, KeyringSecretStore, SecretStore};
use crate::error::CoreError;
use crate::model::{Entity, EntityId, JournalEntry, Operation};
use crate::storage::{ChangeJournal, ConflictLog, RecordStore};

/// Name of the data directory created by `burrow init`.
pub const DATA_DIR: &str = ".burrow";
const KEYS_DIR: &str = "keys";

/// Build the secret store named by the config.
pub fn secret_store_for(root: &Path, config: &BurrowConfig) -> Box<dyn SecretStore> {
    match config.secret_backend {
        SecretBackend::Keyring => Box::new(KeyringSecretStore::new(&config.keychain_service)),
        SecretBackend::File => Box::new(FileSecretStore::new(root.join(KEYS_DIR))),
    }
}

/// Result of a health check. Nothing is decrypted to produce it.
#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub store_ok: bool,
    pub keychain_ok: bool,
    pub records: usize,
    pub journal_entries: u64,
    pub problems: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplayReport {
    pub entries: u64,
    pub repaired: Vec<EntityId>,
}

/// Writes made while the workspace write lock is held. Every write is
/// journaled before it reaches the record store.
pub struct WriteScope<'a> {
    store: &'a RecordStore,
    journal: &'a ChangeJournal,
}

impl WriteScope<'_> {
    pub fn get(&self, id: &EntityId) -> Result<Option<Entity>, CoreError> {
        self.store.get(id)
    }

    /// Journal `entity` under `operation`, then apply it to the store.
    pub fn commit(&self, operation: Operation, entity: &Entity) -> Result<u64, CoreError> {
        let sequence = self.journal.append(&entity.id, operation, entity)?;
        match operation {
            Operation::Delete => self.store.delete(&entity.id)?,
            Operation::Create | Operation::Update => self.store.put(entity)?,
        }
        Ok(sequence)
    }
}

/// An open data directory: key, record store, journal and conflict log.
pub struct Workspace {
    root: PathBuf,
    config: BurrowConfig,
    keys: KeyManager,
    store: RecordStore,
    journal: ChangeJournal,
    conflicts: ConflictLog,
    write_lock: Mutex<()>,
}

impl Workspace {
    pub fn is_initialized(root: &Path) -> bool {
        root.join(CONFIG_FILE).is_file()
    }

    /// Walk up from `start` looking for an initialized `.burrow` directory.
    pub fn discover(start: &Path) -> Option<PathBuf> {
        start
            .ancestors()
            .map(|dir| dir.join(DATA_DIR))
            .find(|candidate| Self::is_initialized(candidate))
    }

    /// Write `config` and open the workspace, provisioning the data key.
    pub fn init(
        root: &Path,
        config: &BurrowConfig,
        secrets: Box<dyn SecretStore>,
    ) -> Result<Self, CoreError> {
        config.save_to(root)?;
        let workspace = Self::open(root, secrets)?;
        info!(
            root = %root.display(),
            backend = workspace.keys.backend(),
            "initialized data directory"
        );
        Ok(workspace)
    }

    /// Open an initialized data directory. Fails with `KeyUnavailable`
    /// before touching any record if the data key cannot be obtained.
    pub fn open(root: &Path, secrets: Box<dyn SecretStore>) -> Result<Self, CoreError> {
        if !Self::is_initialized(root) {
            return Err(CoreError::NotInitialized);
        }
        let config = BurrowConfig::load_from(root)?;
        let keys = KeyManager::new(root, secrets, &config.keychain_account);
        let key = keys.unlock()?;

        let store = RecordStore::open(root, Arc::clone(&key))?;
        let journal = ChangeJournal::open(root, Arc::clone(&key))?;
        let conflicts = ConflictLog::open(root, key);
        Ok(Self {
            root: root.to_path_buf(),
            config,
            keys,
            store,
            journal,
            conflicts,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &BurrowConfig {
        &self.config
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn journal(&self) -> &ChangeJournal {
        &self.journal
    }

    pub fn conflicts(&self) -> &ConflictLog {
        &self.conflicts
    }

    pub fn key(&self) -> Result<Arc<DataKey>, CoreError> {
        self.keys.unlock()
    }

    /// Run `f` with the single-writer lock held.
    pub fn write<T>(
        &self,
        f: impl FnOnce(&WriteScope<'_>) -> Result<T, CoreError>,
    ) -> Result<T, CoreError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| CoreError::Io(std::io::Error::other(format!("write lock poisoned: {e}"))))?;
        f(&WriteScope {
            store: &self.store,
            journal: &self.journal,
        })
    }

    /// Load by full id or unique prefix.
    pub fn get(&self, id_or_prefix: &str) -> Result<Entity, CoreError> {
        let id = self.store.resolve(id_or_prefix)?;
        self.store.get(&id)?.ok_or(CoreError::NotFound {
            id: id_or_prefix.to_string(),
        })
    }

    pub fn create(&self, entity: &Entity) -> Result<u64, CoreError> {
        self.write(|w| {
            if w.get(&entity.id)?.is_some() {
                return Err(CoreError::InvalidId(format!("{} already exists", entity.id)));
            }
            w.commit(Operation::Create, entity)
        })
    }

    /// Load, edit and store an entity as one journaled update.
    pub fn update(
        &self,
        id: &EntityId,
        edit: impl FnOnce(&mut Entity),
    ) -> Result<Entity, CoreError> {
        self.write(|w| {
            let mut entity = w.get(id)?.ok_or_else(|| CoreError::NotFound {
                id: id.to_string(),
            })?;
            edit(&mut entity);
            entity.touch();
            w.commit(Operation::Update, &entity)?;
            Ok(entity)
        })
    }

    /// Delete an entity. Deleting a missing entity is a no-op and returns `None`.
    pub fn delete(&self, id: &EntityId) -> Result<Option<u64>, CoreError> {
        self.write(|w| {
            let Some(mut entity) = w.get(id)? else {
                return Ok(None);
            };
            entity.touch();
            w.commit(Operation::Delete, &entity).map(Some)
        })
    }

    /// Re-apply the latest journaled state of each entity to the record
    /// store, repairing writes lost between journal append and store write.
    pub fn replay(&self) -> Result<ReplayReport, CoreError> {
        self.write(|w| {
            let mut report = ReplayReport::default();
            let mut latest: BTreeMap<EntityId, JournalEntry> = BTreeMap::new();
            for entry in self.journal.read_since(0)? {
                let entry = entry?;
                report.entries += 1;
                latest.insert(entry.entity_id.clone(), entry);
            }

            for (id, entry) in latest {
                let stored = w.get(&id)?;
                let stale = match (&entry.operation, &stored) {
                    (Operation::Delete, Some(current)) => {
                        current.local_version < entry.snapshot.local_version
                    }
                    (Operation::Delete, None) => false,
                    (_, Some(current)) => current.local_version < entry.snapshot.local_version,
                    (_, None) => true,
                };
                if !stale {
                    continue;
                }
                warn!(id = %id, op = entry.operation.as_str(), "repairing record from journal");
                match entry.operation {
                    Operation::Delete => self.store.delete(&id)?,
                    Operation::Create | Operation::Update => self.store.put(&entry.snapshot)?,
                }
                report.repaired.push(id);
            }
            Ok(report)
        })
    }

    pub fn flush(&self) -> Result<(), CoreError> {
        self.journal.flush()
    }

    /// Check the data directory without decrypting anything and without
    /// taking the journal lock.
    pub fn health_check(root: &Path, secrets: Box<dyn SecretStore>) -> Health {
        let mut problems = Vec::new();
        let account = BurrowConfig::load_from(root)
            .map(|c| c.keychain_account)
            .unwrap_or_else(|e| {
                problems.push(format!("config: {e}"));
                BurrowConfig::default_init().keychain_account
            });

        let keys = KeyManager::new(root, secrets, &account);
        let keychain_ok = if !keys.is_provisioned() {
            problems.push("no data key has been provisioned".to_string());
            false
        } else if !keys.probe() {
            problems.push(format!("{} secret store does not hold the key", keys.backend()));
            false
        } else {
            true
        };

        let records = RecordStore::verify(root).unwrap_or_else(|e| {
            problems.push(format!("records: {e}"));
            0
        });
        let journal_entries = ChangeJournal::verify(root).unwrap_or_else(|e| {
            problems.push(format!("journal: {e}"));
            0
        });
        let store_ok = !problems
            .iter()
            .any(|p| p.starts_with("records:") || p.starts_with("journal:"));

        Health {
            store_ok,
            keychain_ok,
            records,
            journal_entries,
            problems,
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(error = %e, "failed to flush workspace on close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MemorySecretStore;
    use crate::model::{EntityKind, Priority, TaskStatus};
    use tempfile::TempDir;

    fn init(tmp: &TempDir, secrets: &MemorySecretStore) -> Workspace {
        Workspace::init(
            &tmp.path().join(DATA_DIR),
            &BurrowConfig::default_init(),
            Box::new(secrets.clone()),
        )
        .unwrap()
    }

    #[test]
    fn test_open_requires_init() {
        let tmp = TempDir::new().unwrap();
        let result = Workspace::open(tmp.path(), Box::new(MemorySecretStore::new()));
        assert!(matches!(result, Err(CoreError::NotInitialized)));
    }

    #[test]
    fn test_discover_walks_up() {
        let tmp = TempDir::new().unwrap();
        let secrets = MemorySecretStore::new();
        drop(init(&tmp, &secrets));
        let nested = tmp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        assert_eq!(
            Workspace::discover(&nested),
            Some(tmp.path().join(DATA_DIR))
        );
    }

    #[test]
    fn test_mutations_are_journaled() {
        let tmp = TempDir::new().unwrap();
        let ws = init(&tmp, &MemorySecretStore::new());

        let task = Entity::new_task("ship it", None, Priority::High, vec![]);
        assert_eq!(ws.create(&task).unwrap(), 1);
        let updated = ws
            .update(&task.id, |t| t.payload.status = TaskStatus::Done)
            .unwrap();
        assert_eq!(updated.local_version, 2);
        assert_eq!(ws.delete(&task.id).unwrap(), Some(3));
        assert_eq!(ws.delete(&task.id).unwrap(), None);

        let ops: Vec<Operation> = ws
            .journal()
            .read_since(0)
            .unwrap()
            .map(|e| e.unwrap().operation)
            .collect();
        assert_eq!(
            ops,
            vec![Operation::Create, Operation::Update, Operation::Delete]
        );
        assert!(ws.store().list(EntityKind::Task).unwrap().is_empty());
    }

    #[test]
    fn test_create_rejects_duplicate_id() {
        let tmp = TempDir::new().unwrap();
        let ws = init(&tmp, &MemorySecretStore::new());
        let task = Entity::new_task("once", None, Priority::Low, vec![]);
        ws.create(&task).unwrap();
        assert!(ws.create(&task).is_err());
        assert_eq!(ws.journal().last_sequence().unwrap(), 1);
    }

    #[test]
    fn test_get_by_prefix() {
        let tmp = TempDir::new().unwrap();
        let ws = init(&tmp, &MemorySecretStore::new());
        let task = Entity::new_task("find me", None, Priority::Low, vec![]);
        ws.create(&task).unwrap();
        assert_eq!(ws.get(task.id.short()).unwrap(), task);
    }

    #[test]
    fn test_reopen_with_missing_key_fails_before_reading() {
        let tmp = TempDir::new().unwrap();
        let secrets = MemorySecretStore::new();
        let root = tmp.path().join(DATA_DIR);
        {
            let ws = init(&tmp, &secrets);
            ws.create(&Entity::new_task("x", None, Priority::Low, vec![]))
                .unwrap();
        }
        secrets.forget(&BurrowConfig::default_init().keychain_account);
        assert!(matches!(
            Workspace::open(&root, Box::new(secrets.clone())),
            Err(CoreError::KeyUnavailable(_))
        ));
    }

    #[test]
    fn test_replay_repairs_lost_store_write() {
        let tmp = TempDir::new().unwrap();
        let ws = init(&tmp, &MemorySecretStore::new());
        let task = Entity::new_task("a", None, Priority::Low, vec![]);
        ws.create(&task).unwrap();
        let updated = ws.update(&task.id, |t| t.payload.title = "b".into()).unwrap();

        // Journaled but the store write never happened.
        ws.store().put(&task).unwrap();
        let report = ws.replay().unwrap();
        assert_eq!(report.entries, 2);
        assert_eq!(report.repaired, vec![task.id.clone()]);
        assert_eq!(ws.store().get(&task.id).unwrap(), Some(updated));

        assert!(ws.replay().unwrap().repaired.is_empty());
    }

    #[test]
    fn test_health_check_without_decrypting() {
        let tmp = TempDir::new().unwrap();
        let secrets = MemorySecretStore::new();
        let root = tmp.path().join(DATA_DIR);
        let ws = init(&tmp, &secrets);
        ws.create(&Entity::new_task("x", None, Priority::Low, vec![]))
            .unwrap();

        // Works while the workspace (and its journal lock) is held.
        let health = Workspace::health_check(&root, Box::new(secrets.clone()));
        assert!(health.store_ok);
        assert!(health.keychain_ok);
        assert_eq!(health.records, 1);
        assert_eq!(health.journal_entries, 1);

        let unavailable = Workspace::health_check(&root, Box::new(MemorySecretStore::unavailable()));
        assert!(unavailable.store_ok);
        assert!(!unavailable.keychain_ok);
        assert!(!unavailable.problems.is_empty());
    }
}
