use std::path::Path;

use anyhow::{bail, Context, Result};
use burrow_core::config::BurrowConfig;
use burrow_core::Workspace;

use super::{data_dir, secret_store};
use crate::output::format::format_health;
use crate::output::OutputFormat;

pub fn run(dir: Option<&Path>, fmt: OutputFormat) -> Result<()> {
    let root = data_dir(dir)?;
    let config = BurrowConfig::load_from(&root).context("Failed to read burrow config")?;
    let health = Workspace::health_check(&root, secret_store(&root, &config)?);
    println!("{}", format_health(&health, fmt));

    if !(health.store_ok && health.keychain_ok) {
        bail!("burrow data directory at {} is unhealthy", root.display());
    }
    Ok(())
}
