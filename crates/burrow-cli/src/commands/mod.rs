pub mod conflicts;
pub mod convo;
pub mod health;
pub mod init;
pub mod journal;
pub mod repair;
pub mod sync;
pub mod task;
pub mod version;

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use burrow_core::config::{BurrowConfig, SecretBackend};
use burrow_core::crypto::SecretStore;
use burrow_core::workspace::secret_store_for;
use burrow_core::Workspace;
use clap::Subcommand;

/// Overrides `keychain.backend` for this process (`keyring` or `file`).
pub const SECRET_STORE_ENV: &str = "BURROW_SECRET_STORE";

#[derive(Subcommand)]
pub enum Commands {
    /// Create a burrow data directory and provision its key
    Init(init::InitArgs),
    /// Add, list, edit and remove tasks
    Task(task::TaskArgs),
    /// Record and read conversations
    Convo(convo::ConvoArgs),
    /// Reconcile with the configured tracker (dry run unless --apply)
    Sync(sync::SyncArgs),
    /// List or acknowledge sync conflicts
    Conflicts(conflicts::ConflictsArgs),
    /// Show the change journal
    Journal(journal::JournalArgs),
    /// Re-apply the journal to the record store after a crash
    Repair,
    /// Check store and keychain without decrypting anything
    Health,
    /// Print version information
    Version,
}

/// The data directory to use: explicit flag or `BURROW_DIR`, otherwise the
/// nearest initialized `.burrow` above the current directory.
pub fn data_dir(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = explicit {
        return Ok(dir.to_path_buf());
    }
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    Workspace::discover(&cwd)
        .ok_or_else(|| anyhow!("No burrow data directory found. Run `burrow init` first."))
}

/// Secret store for `config`, honouring `BURROW_SECRET_STORE`.
pub fn secret_store(root: &Path, config: &BurrowConfig) -> Result<Box<dyn SecretStore>> {
    Ok(secret_store_for(root, &effective_config(config)?))
}

pub fn effective_config(config: &BurrowConfig) -> Result<BurrowConfig> {
    let mut config = config.clone();
    if let Ok(name) = std::env::var(SECRET_STORE_ENV) {
        config.secret_backend = SecretBackend::parse(&name)
            .ok_or_else(|| anyhow!("{SECRET_STORE_ENV} must be 'keyring' or 'file', got '{name}'"))?;
    }
    Ok(config)
}

pub fn open_workspace(explicit: Option<&Path>) -> Result<Workspace> {
    let root = data_dir(explicit)?;
    if !Workspace::is_initialized(&root) {
        bail!(
            "burrow is not initialized in {}. Run `burrow init` first.",
            root.display()
        );
    }
    let config = BurrowConfig::load_from(&root).context("Failed to read burrow config")?;
    Workspace::open(&root, secret_store(&root, &config)?)
        .with_context(|| format!("Failed to open {}", root.display()))
}
