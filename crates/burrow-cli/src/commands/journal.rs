use std::path::Path;

use anyhow::Result;
use burrow_core::model::JournalEntry;
use clap::Args;

use super::open_workspace;
use crate::output::format::format_journal;
use crate::output::OutputFormat;

#[derive(Args)]
pub struct JournalArgs {
    /// Only entries after this sequence (default: the sync checkpoint)
    #[arg(long)]
    pub since: Option<u64>,

    /// Show every entry, including already-synced ones
    #[arg(long, conflicts_with = "since")]
    pub all: bool,

    /// Show at most the last N entries
    #[arg(short = 'n', long)]
    pub limit: Option<usize>,
}

pub fn run(args: &JournalArgs, data_dir: Option<&Path>, fmt: OutputFormat) -> Result<()> {
    let ws = open_workspace(data_dir)?;
    let journal = ws.journal();
    let checkpoint = journal.last_checkpoint()?;
    let after = match (args.all, args.since) {
        (true, _) => 0,
        (false, Some(since)) => since,
        (false, None) => checkpoint,
    };

    let mut entries = journal
        .read_since(after)?
        .collect::<Result<Vec<JournalEntry>, _>>()?;
    if let Some(limit) = args.limit {
        let skip = entries.len().saturating_sub(limit);
        entries.drain(..skip);
    }

    println!("{}", format_journal(&entries, checkpoint, fmt));
    Ok(())
}
