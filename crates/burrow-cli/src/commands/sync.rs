use std::path::Path;

use anyhow::{bail, Context, Result};
use burrow_sync::{tracker_from_config, SyncMode, SyncOutcome, SyncSession};
use clap::Args;
use tracing::info;

use super::open_workspace;
use crate::output::format::format_sync_report;
use crate::output::OutputFormat;

#[derive(Args)]
pub struct SyncArgs {
    /// Write the plan: apply remote changes locally, push local ones, advance the checkpoint
    #[arg(long)]
    pub apply: bool,
}

pub fn run(args: &SyncArgs, data_dir: Option<&Path>, fmt: OutputFormat) -> Result<()> {
    let ws = open_workspace(data_dir)?;
    let tracker = tracker_from_config(ws.config()).context("Sync is not configured")?;
    let mode = if args.apply {
        SyncMode::Apply
    } else {
        SyncMode::DryRun
    };

    info!(tracker = tracker.name(), mode = mode.as_str(), "starting sync");
    let report = SyncSession::new(&ws, tracker.as_ref())
        .run(mode)
        .context("Sync failed")?;
    println!("{}", format_sync_report(&report, fmt));

    match &report.outcome {
        SyncOutcome::Failed { reason, .. } => bail!("Sync failed: {reason}"),
        SyncOutcome::PartiallyApplied => bail!(
            "{} pushes failed; run `burrow sync --apply` again to retry",
            report.failed.len()
        ),
        SyncOutcome::Cancelled { .. } => bail!("Sync cancelled"),
        SyncOutcome::DryRun | SyncOutcome::Applied => Ok(()),
    }
}
