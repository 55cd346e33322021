use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::debug;

use crate::error::CoreError;
use crate::fsutil::{restrict_permissions, write_atomic};

/// OS-level secret storage. Inaccessibility is reported as `KeyUnavailable`;
/// a missing secret is `Ok(None)`.
pub trait SecretStore: Send + Sync {
    fn get_secret(&self, name: &str) -> Result<Option<Vec<u8>>, CoreError>;

    fn set_secret(&self, name: &str, bytes: &[u8]) -> Result<(), CoreError>;

    /// Short label for logs and health output.
    fn backend(&self) -> &'static str;
}

/// OS keychain (macOS Keychain, Windows Credential Manager, Secret Service).
pub struct KeyringSecretStore {
    service: String,
}

impl KeyringSecretStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, name: &str) -> Result<keyring::Entry, CoreError> {
        keyring::Entry::new(&self.service, name)
            .map_err(|e| CoreError::KeyUnavailable(format!("keychain: {e}")))
    }
}

impl SecretStore for KeyringSecretStore {
    fn get_secret(&self, name: &str) -> Result<Option<Vec<u8>>, CoreError> {
        match self.entry(name)?.get_password() {
            Ok(encoded) => decode_secret(&encoded).map(Some),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(CoreError::KeyUnavailable(format!("keychain: {e}"))),
        }
    }

    fn set_secret(&self, name: &str, bytes: &[u8]) -> Result<(), CoreError> {
        self.entry(name)?
            .set_password(&STANDARD.encode(bytes))
            .map_err(|e| CoreError::KeyUnavailable(format!("keychain: {e}")))
    }

    fn backend(&self) -> &'static str {
        "keyring"
    }
}

/// Owner-only secret files for machines without a keychain daemon.
/// Only used when selected explicitly.
pub struct FileSecretStore {
    dir: PathBuf,
}

impl FileSecretStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, CoreError> {
        let valid = !name.is_empty()
            && name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if !valid {
            return Err(CoreError::KeyUnavailable(format!(
                "invalid secret name: {name:?}"
            )));
        }
        Ok(self.dir.join(format!("{name}.secret")))
    }
}

impl SecretStore for FileSecretStore {
    fn get_secret(&self, name: &str) -> Result<Option<Vec<u8>>, CoreError> {
        let path = self.path_for(name)?;
        match fs::read_to_string(&path) {
            Ok(encoded) => decode_secret(encoded.trim()).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CoreError::KeyUnavailable(format!(
                "secret file {}: {e}",
                path.display()
            ))),
        }
    }

    fn set_secret(&self, name: &str, bytes: &[u8]) -> Result<(), CoreError> {
        let path = self.path_for(name)?;
        write_atomic(&path, STANDARD.encode(bytes).as_bytes())
            .and_then(|()| restrict_permissions(&path))
            .map_err(|e| CoreError::KeyUnavailable(format!("secret file {}: {e}", path.display())))?;
        debug!(path = %path.display(), "stored secret file");
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "file"
    }
}

/// In-memory secrets for tests. `unavailable()` simulates a missing keychain service.
#[derive(Debug, Default, Clone)]
pub struct MemorySecretStore {
    inner: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    unavailable: bool,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    /// Drop a secret, as if the user wiped their keychain.
    pub fn forget(&self, name: &str) {
        if let Ok(mut map) = self.inner.lock() {
            map.remove(name);
        }
    }

    fn check(&self) -> Result<(), CoreError> {
        if self.unavailable {
            return Err(CoreError::KeyUnavailable(
                "secret service is not running".into(),
            ));
        }
        Ok(())
    }
}

impl SecretStore for MemorySecretStore {
    fn get_secret(&self, name: &str) -> Result<Option<Vec<u8>>, CoreError> {
        self.check()?;
        let map = self
            .inner
            .lock()
            .map_err(|e| CoreError::KeyUnavailable(format!("lock poisoned: {e}")))?;
        Ok(map.get(name).cloned())
    }

    fn set_secret(&self, name: &str, bytes: &[u8]) -> Result<(), CoreError> {
        self.check()?;
        let mut map = self
            .inner
            .lock()
            .map_err(|e| CoreError::KeyUnavailable(format!("lock poisoned: {e}")))?;
        map.insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

fn decode_secret(encoded: &str) -> Result<Vec<u8>, CoreError> {
    STANDARD
        .decode(encoded)
        .map_err(|e| CoreError::KeyUnavailable(format!("stored secret is not valid base64: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemorySecretStore::new();
        assert_eq!(store.get_secret("kek").unwrap(), None);
        store.set_secret("kek", b"secret").unwrap();
        assert_eq!(store.get_secret("kek").unwrap(), Some(b"secret".to_vec()));
        store.forget("kek");
        assert_eq!(store.get_secret("kek").unwrap(), None);
    }

    #[test]
    fn test_unavailable_store_fails() {
        let store = MemorySecretStore::unavailable();
        assert!(matches!(
            store.get_secret("kek"),
            Err(CoreError::KeyUnavailable(_))
        ));
        assert!(store.set_secret("kek", b"x").is_err());
    }

    #[test]
    fn test_file_store_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = FileSecretStore::new(tmp.path());
        assert_eq!(store.get_secret("data-key-kek").unwrap(), None);
        store.set_secret("data-key-kek", &[1, 2, 3]).unwrap();
        assert_eq!(
            store.get_secret("data-key-kek").unwrap(),
            Some(vec![1, 2, 3])
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(tmp.path().join("data-key-kek.secret"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_file_store_rejects_path_names() {
        let tmp = TempDir::new().unwrap();
        let store = FileSecretStore::new(tmp.path());
        assert!(store.set_secret("../escape", b"x").is_err());
        assert!(store.get_secret("").is_err());
    }
}
