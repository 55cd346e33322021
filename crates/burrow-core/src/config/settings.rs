use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use git2::Config;

use crate::crypto::DEFAULT_SECRET_NAME;
use crate::error::CoreError;

/// Settings file inside the data directory, in git-config syntax.
pub const CONFIG_FILE: &str = "config";
const CONFIG_VERSION: i32 = 1;

/// Where the key-encryption key is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretBackend {
    /// OS keychain via the `keyring` crate.
    Keyring,
    /// Owner-only file under `<data dir>/keys/`.
    File,
}

impl SecretBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecretBackend::Keyring => "keyring",
            SecretBackend::File => "file",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "keyring" => Some(SecretBackend::Keyring),
            "file" => Some(SecretBackend::File),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BurrowConfig {
    pub version: i32,
    pub secret_backend: SecretBackend,
    /// Keychain service name.
    pub keychain_service: String,
    /// Secret (keychain account) holding the key-encryption key.
    pub keychain_account: String,
    /// Sync adapter name, e.g. `folder`. `None` disables sync.
    pub sync_provider: Option<String>,
    /// Directory for the `folder` adapter.
    pub sync_folder: Option<PathBuf>,
}

impl BurrowConfig {
    /// Read settings; missing keys fall back to their defaults.
    pub fn load(config: &Config) -> Result<Self, CoreError> {
        let defaults = Self::default_init();
        let secret_backend = match config.get_string("keychain.backend") {
            Ok(name) => SecretBackend::parse(&name).ok_or_else(|| {
                CoreError::Config(git2::Error::from_str(&format!(
                    "unknown keychain.backend '{name}' (expected keyring or file)"
                )))
            })?,
            Err(_) => defaults.secret_backend,
        };
        Ok(Self {
            version: config.get_i32("burrow.version").unwrap_or(CONFIG_VERSION),
            secret_backend,
            keychain_service: config
                .get_string("keychain.service")
                .unwrap_or(defaults.keychain_service),
            keychain_account: config
                .get_string("keychain.account")
                .unwrap_or(defaults.keychain_account),
            sync_provider: config
                .get_string("sync.provider")
                .ok()
                .filter(|p| !p.is_empty() && p != "none"),
            sync_folder: config.get_path("sync.folder").ok(),
        })
    }

    pub fn save(&self, config: &mut Config) -> Result<(), CoreError> {
        config.set_i32("burrow.version", self.version)?;
        config.set_str("keychain.backend", self.secret_backend.as_str())?;
        config.set_str("keychain.service", &self.keychain_service)?;
        config.set_str("keychain.account", &self.keychain_account)?;
        config.set_str(
            "sync.provider",
            self.sync_provider.as_deref().unwrap_or("none"),
        )?;
        if let Some(folder) = &self.sync_folder {
            config.set_str("sync.folder", &folder.to_string_lossy())?;
        }
        Ok(())
    }

    /// Load from `<root>/config`. A missing file yields defaults.
    pub fn load_from(root: &Path) -> Result<Self, CoreError> {
        let path = root.join(CONFIG_FILE);
        if !path.is_file() {
            return Ok(Self::default_init());
        }
        Self::load(&Config::open(&path)?)
    }

    pub fn save_to(&self, root: &Path) -> Result<(), CoreError> {
        std::fs::create_dir_all(root)?;
        let path = root.join(CONFIG_FILE);
        OpenOptions::new().create(true).append(true).open(&path)?;
        let mut config = Config::open(&path)?;
        self.save(&mut config)
    }

    /// Default settings for `burrow init`.
    pub fn default_init() -> Self {
        Self {
            version: CONFIG_VERSION,
            secret_backend: SecretBackend::Keyring,
            keychain_service: "burrow".to_string(),
            keychain_account: DEFAULT_SECRET_NAME.to_string(),
            sync_provider: None,
            sync_folder: None,
        }
    }
}
