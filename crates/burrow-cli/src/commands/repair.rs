use std::path::Path;

use anyhow::{Context, Result};

use super::open_workspace;
use crate::output::format::format_replay;
use crate::output::OutputFormat;

pub fn run(data_dir: Option<&Path>, fmt: OutputFormat) -> Result<()> {
    let ws = open_workspace(data_dir)?;
    let report = ws.replay().context("Journal replay failed")?;
    println!("{}", format_replay(&report, fmt));
    Ok(())
}
