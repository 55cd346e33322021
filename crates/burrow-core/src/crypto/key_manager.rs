use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::Zeroizing;

use super::cipher::{DataKey, Sealed};
use super::secret_store::SecretStore;
use crate::error::CoreError;
use crate::fsutil::{restrict_permissions, write_atomic};

pub const DEFAULT_SECRET_NAME: &str = "data-key-kek";
const WRAPPED_KEY_PATH: &str = "keys/data-key.json";
const WRAP_AAD: &[u8] = b"burrow:data-key:v1";

/// The data key sealed under the key-encryption key held by the OS secret store.
#[derive(Debug, Serialize, Deserialize)]
struct WrappedKey {
    version: u32,
    /// Fingerprint of the wrapped data key, checked after unwrapping.
    fingerprint: String,
    created_at: DateTime<Utc>,
    sealed: Sealed,
}

/// Obtains the data key: the data key lives on disk wrapped by a
/// key-encryption key, and only the key-encryption key lives in the secret store.
pub struct KeyManager {
    root: PathBuf,
    secret_name: String,
    secrets: Box<dyn SecretStore>,
    cached: Mutex<Option<Arc<DataKey>>>,
}

impl KeyManager {
    pub fn new(root: &Path, secrets: Box<dyn SecretStore>, secret_name: &str) -> Self {
        Self {
            root: root.to_path_buf(),
            secret_name: secret_name.to_string(),
            secrets,
            cached: Mutex::new(None),
        }
    }

    fn wrapped_path(&self) -> PathBuf {
        self.root.join(WRAPPED_KEY_PATH)
    }

    /// True once a wrapped data key has been written for this store.
    pub fn is_provisioned(&self) -> bool {
        self.wrapped_path().is_file()
    }

    pub fn backend(&self) -> &'static str {
        self.secrets.backend()
    }

    /// Retrieve the data key, creating and wrapping one on first use.
    /// Cached after the first success; failures are not retried.
    pub fn unlock(&self) -> Result<Arc<DataKey>, CoreError> {
        let mut cached = self
            .cached
            .lock()
            .map_err(|e| CoreError::KeyUnavailable(format!("lock poisoned: {e}")))?;
        if let Some(key) = cached.as_ref() {
            return Ok(Arc::clone(key));
        }

        let kek = self.secrets.get_secret(&self.secret_name)?.map(Zeroizing::new);
        let key = if self.is_provisioned() {
            let kek = kek.ok_or_else(|| {
                CoreError::KeyUnavailable(format!(
                    "a wrapped data key exists but secret '{}' is missing from the {} store",
                    self.secret_name,
                    self.secrets.backend()
                ))
            })?;
            self.unwrap_existing(&kek)?
        } else {
            self.provision(kek)?
        };

        info!(
            fingerprint = key.fingerprint(),
            backend = self.secrets.backend(),
            "data key unlocked"
        );
        let key = Arc::new(key);
        *cached = Some(Arc::clone(&key));
        Ok(key)
    }

    /// Cheap check that the secret store answers and holds our secret.
    /// Never decrypts anything.
    pub fn probe(&self) -> bool {
        matches!(self.secrets.get_secret(&self.secret_name), Ok(Some(_)))
    }

    fn unwrap_existing(&self, kek: &[u8]) -> Result<DataKey, CoreError> {
        let path = self.wrapped_path();
        let raw = fs::read(&path)?;
        let wrapped: WrappedKey = serde_json::from_slice(&raw).map_err(|e| {
            CoreError::KeyUnavailable(format!("wrapped data key is unreadable: {e}"))
        })?;

        let kek = DataKey::from_bytes(kek)?;
        let plain = kek
            .open(&wrapped.sealed, WRAP_AAD, "data-key")
            .map(Zeroizing::new)
            .map_err(|_| {
                CoreError::KeyUnavailable(
                    "wrapped data key does not authenticate against the stored secret".into(),
                )
            })?;
        let key = DataKey::from_bytes(&plain)?;
        if key.fingerprint() != wrapped.fingerprint {
            return Err(CoreError::KeyUnavailable(
                "unwrapped data key fingerprint mismatch".into(),
            ));
        }
        debug!(path = %path.display(), "unwrapped data key");
        Ok(key)
    }

    fn provision(&self, existing_kek: Option<Zeroizing<Vec<u8>>>) -> Result<DataKey, CoreError> {
        let kek = match existing_kek {
            Some(bytes) => DataKey::from_bytes(&bytes)?,
            None => {
                let kek = DataKey::generate();
                self.secrets.set_secret(&self.secret_name, kek.as_bytes())?;
                kek
            }
        };

        let key = DataKey::generate();
        let wrapped = WrappedKey {
            version: 1,
            fingerprint: key.fingerprint().to_string(),
            created_at: Utc::now(),
            sealed: kek.seal(key.as_bytes(), WRAP_AAD)?,
        };
        let path = self.wrapped_path();
        write_atomic(&path, &serde_json::to_vec_pretty(&wrapped)?)?;
        restrict_permissions(&path)?;
        info!(fingerprint = key.fingerprint(), "provisioned new data key");
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::secret_store::MemorySecretStore;
    use tempfile::TempDir;

    fn manager(root: &Path, secrets: &MemorySecretStore) -> KeyManager {
        KeyManager::new(root, Box::new(secrets.clone()), DEFAULT_SECRET_NAME)
    }

    #[test]
    fn test_first_unlock_provisions_and_second_reuses() {
        let tmp = TempDir::new().unwrap();
        let secrets = MemorySecretStore::new();

        let first = manager(tmp.path(), &secrets);
        assert!(!first.is_provisioned());
        let key = first.unlock().unwrap();
        assert!(first.is_provisioned());
        assert!(first.probe());

        // The data key itself never reaches the secret store.
        let kek = secrets.get_secret(DEFAULT_SECRET_NAME).unwrap().unwrap();
        assert_ne!(kek.as_slice(), key.as_bytes());

        // A new manager (new process) unwraps the same key.
        let second = manager(tmp.path(), &secrets);
        let again = second.unlock().unwrap();
        assert_eq!(key.fingerprint(), again.fingerprint());
        assert_eq!(key.as_bytes(), again.as_bytes());
    }

    #[test]
    fn test_unlock_is_cached() {
        let tmp = TempDir::new().unwrap();
        let secrets = MemorySecretStore::new();
        let km = manager(tmp.path(), &secrets);
        let a = km.unlock().unwrap();
        secrets.forget(DEFAULT_SECRET_NAME);
        let b = km.unlock().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_unavailable_secret_store_is_key_unavailable() {
        let tmp = TempDir::new().unwrap();
        let km = manager(tmp.path(), &MemorySecretStore::unavailable());
        assert!(matches!(km.unlock(), Err(CoreError::KeyUnavailable(_))));
        assert!(!km.probe());
        assert!(!km.is_provisioned());
    }

    #[test]
    fn test_missing_kek_never_regenerates() {
        let tmp = TempDir::new().unwrap();
        let secrets = MemorySecretStore::new();
        manager(tmp.path(), &secrets).unlock().unwrap();
        let wrapped_before = fs::read(tmp.path().join(WRAPPED_KEY_PATH)).unwrap();

        secrets.forget(DEFAULT_SECRET_NAME);
        let err = manager(tmp.path(), &secrets).unlock().unwrap_err();
        assert!(matches!(err, CoreError::KeyUnavailable(_)));

        // The wrapped key on disk is untouched.
        let wrapped_after = fs::read(tmp.path().join(WRAPPED_KEY_PATH)).unwrap();
        assert_eq!(wrapped_before, wrapped_after);
    }

    #[test]
    fn test_wrong_kek_is_key_unavailable() {
        let tmp = TempDir::new().unwrap();
        let secrets = MemorySecretStore::new();
        manager(tmp.path(), &secrets).unlock().unwrap();

        secrets
            .set_secret(DEFAULT_SECRET_NAME, DataKey::generate().as_bytes())
            .unwrap();
        let err = manager(tmp.path(), &secrets).unlock().unwrap_err();
        assert!(matches!(err, CoreError::KeyUnavailable(_)));
    }
}
