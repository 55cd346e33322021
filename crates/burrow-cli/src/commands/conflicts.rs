use std::path::Path;

use anyhow::{bail, Context, Result};
use burrow_core::model::EntityId;
use burrow_core::storage::ConflictLog;
use burrow_sync::{resolve_conflict, Keep};
use clap::{Args, Subcommand, ValueEnum};

use super::open_workspace;
use crate::output::format::format_conflicts;
use crate::output::OutputFormat;

#[derive(Args)]
pub struct ConflictsArgs {
    #[command(subcommand)]
    pub command: Option<ConflictsCommand>,
}

#[derive(Subcommand)]
pub enum ConflictsCommand {
    /// List conflicts (default)
    List {
        /// Include acknowledged conflicts
        #[arg(long)]
        all: bool,
    },
    /// Mark every conflict of an entity as seen
    Ack { id: String },
    /// Settle a manual conflict; the next `sync --apply` carries it out
    Resolve {
        id: String,
        #[arg(long, value_enum)]
        keep: KeepArg,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum KeepArg {
    Local,
    Remote,
}

impl From<KeepArg> for Keep {
    fn from(arg: KeepArg) -> Self {
        match arg {
            KeepArg::Local => Keep::Local,
            KeepArg::Remote => Keep::Remote,
        }
    }
}

pub fn run(args: &ConflictsArgs, data_dir: Option<&Path>, fmt: OutputFormat) -> Result<()> {
    let ws = open_workspace(data_dir)?;
    let log = ws.conflicts();

    match args.command.as_ref().unwrap_or(&ConflictsCommand::List { all: false }) {
        ConflictsCommand::List { all } => {
            let conflicts = log.list(*all)?;
            println!("{}", format_conflicts(&conflicts, fmt));
        }
        ConflictsCommand::Ack { id } => {
            let target = open_conflict(log, id)?;
            let count = log.acknowledge(&target)?;
            println!("Acknowledged {count} conflict(s) for {}", target.short());
        }
        ConflictsCommand::Resolve { id, keep } => {
            let target = open_conflict(log, id)?;
            let keep: Keep = (*keep).into();
            let sequence = resolve_conflict(&ws, &target, keep)
                .with_context(|| format!("Failed to resolve conflict for {}", target.short()))?;
            match fmt {
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::json!({
                        "entity_id": target,
                        "keep": keep,
                        "sequence": sequence,
                    })
                ),
                OutputFormat::Text => match sequence {
                    Some(seq) => println!(
                        "Kept {} for {} (journal #{seq}); run `burrow sync --apply` to finish",
                        keep.as_str(),
                        target.short()
                    ),
                    None => println!("{} is gone on both sides; conflict cleared", target.short()),
                },
            }
        }
    }

    Ok(())
}

/// Unique unacknowledged conflict entity matching `prefix`. The entity may
/// already be gone from the store, so this matches against the log.
fn open_conflict(log: &ConflictLog, prefix: &str) -> Result<EntityId> {
    let mut ids: Vec<EntityId> = log
        .list(false)?
        .into_iter()
        .map(|c| c.record.entity_id)
        .filter(|e| e.as_str().starts_with(prefix))
        .collect();
    ids.sort();
    ids.dedup();
    match ids.as_slice() {
        [] => bail!("No unacknowledged conflict for '{prefix}'"),
        [one] => Ok(one.clone()),
        _ => bail!("'{prefix}' matches {} entities; use a longer prefix", ids.len()),
    }
}
