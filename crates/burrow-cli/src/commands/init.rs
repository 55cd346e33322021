use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burrow_core::config::BurrowConfig;
use burrow_core::{Workspace, DATA_DIR};
use burrow_sync::folder::FOLDER_TRACKER;
use clap::Args;

use super::{effective_config, secret_store};

#[derive(Args)]
pub struct InitArgs {
    /// Force re-initialization (rewrites config, keeps the existing key)
    #[arg(long)]
    pub force: bool,

    /// Sync against a directory of JSON issue files
    #[arg(long, value_name = "DIR")]
    pub remote_folder: Option<PathBuf>,
}

pub fn run(args: &InitArgs, data_dir: Option<&Path>) -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    let root = match data_dir {
        Some(dir) => dir.to_path_buf(),
        None => cwd.join(DATA_DIR),
    };

    if Workspace::is_initialized(&root) && !args.force {
        println!("burrow is already initialized in {}.", root.display());
        println!("Use --force to re-initialize.");
        return Ok(());
    }

    let mut config = if Workspace::is_initialized(&root) {
        BurrowConfig::load_from(&root).context("Failed to read existing config")?
    } else {
        BurrowConfig::default_init()
    };
    // Persist an env-selected backend so later runs agree without the variable.
    config = effective_config(&config)?;
    if let Some(folder) = &args.remote_folder {
        let folder = if folder.is_absolute() {
            folder.clone()
        } else {
            cwd.join(folder)
        };
        std::fs::create_dir_all(&folder)
            .with_context(|| format!("Failed to create {}", folder.display()))?;
        config.sync_provider = Some(FOLDER_TRACKER.to_string());
        config.sync_folder = Some(folder);
    }

    let workspace = Workspace::init(&root, &config, secret_store(&root, &config)?)
        .context("Failed to initialize burrow")?;
    let key = workspace.key()?;

    println!("burrow initialized in {}.", root.display());
    println!(
        "Data key {} held by the {} secret store.",
        key.fingerprint(),
        config.secret_backend.as_str()
    );
    println!();
    println!("Next steps:");
    println!("  burrow task add \"<title>\"   Add a task");
    println!("  burrow convo new \"<title>\"  Start a conversation");
    println!("  burrow sync                 Preview sync with your tracker");
    Ok(())
}
