use burrow_core::model::{Entity, EntityKind, JournalEntry, Priority, TaskStatus};
use burrow_core::storage::LoggedConflict;
use burrow_core::{Health, ReplayReport};
use burrow_sync::{SyncOutcome, SyncReport, UpdateAction};

use super::OutputFormat;

fn status_label(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Todo => "todo",
        TaskStatus::InProgress => "in-progress",
        TaskStatus::Done => "done",
    }
}

fn priority_label(priority: Priority) -> &'static str {
    match priority {
        Priority::Low => "low",
        Priority::Medium => "medium",
        Priority::High => "high",
    }
}

fn link_label(entity: &Entity) -> String {
    match &entity.remote {
        Some(link) if entity.has_unsynced_changes() => format!("{} *", link.remote_ref),
        Some(link) => link.remote_ref.to_string(),
        None => "unsynced".to_string(),
    }
}

pub fn format_entity_list(entities: &[Entity], fmt: OutputFormat) -> String {
    match fmt {
        OutputFormat::Json => serde_json::to_string_pretty(entities).unwrap_or_default(),
        OutputFormat::Text => format_entity_list_text(entities),
    }
}

fn format_entity_list_text(entities: &[Entity]) -> String {
    if entities.is_empty() {
        return "Nothing here yet.".to_string();
    }

    let mut out = String::new();
    for e in entities {
        let time = e.updated_at.format("%Y-%m-%d %H:%M");
        let detail = match e.kind {
            EntityKind::Task => format!(
                "{}/{}",
                status_label(e.payload.status),
                priority_label(e.payload.priority)
            ),
            EntityKind::Conversation => format!("{} messages", e.payload.transcript.len()),
        };
        out.push_str(&format!(
            "\u{25c6} {} {} [{detail}] ({})  {time}\n",
            e.id.short(),
            e.payload.title,
            link_label(e)
        ));
    }
    out
}

pub fn format_entity(entity: &Entity, fmt: OutputFormat) -> String {
    match fmt {
        OutputFormat::Json => serde_json::to_string_pretty(entity).unwrap_or_default(),
        OutputFormat::Text => format_entity_text(entity),
    }
}

fn format_entity_text(e: &Entity) -> String {
    let mut out = String::new();
    let label = match e.kind {
        EntityKind::Task => "Task:",
        EntityKind::Conversation => "Convo:",
    };
    out.push_str(&format!("{label:<9}{}\n", e.id));
    out.push_str(&format!("Title:   {}\n", e.payload.title));
    if e.kind == EntityKind::Task {
        out.push_str(&format!("Status:  {}\n", status_label(e.payload.status)));
        out.push_str(&format!("Priority: {}\n", priority_label(e.payload.priority)));
    }
    if !e.payload.tags.is_empty() {
        out.push_str(&format!("Tags:    {}\n", e.payload.tags.join(", ")));
    }
    out.push_str(&format!(
        "Updated: {} (v{})\n",
        e.updated_at.format("%Y-%m-%d %H:%M:%S UTC"),
        e.local_version
    ));
    out.push_str(&format!("Remote:  {}\n", link_label(e)));

    if let Some(body) = &e.payload.body {
        out.push('\n');
        out.push_str(body);
        out.push('\n');
    }

    if !e.payload.transcript.is_empty() {
        out.push_str(&format!(
            "\n--- Transcript ({}) ---\n",
            e.payload.transcript.len()
        ));
        for entry in &e.payload.transcript {
            out.push_str(&format!(
                "[{}] {}: {}\n",
                entry.timestamp.format("%H:%M:%S"),
                entry.role.as_str(),
                entry.text
            ));
        }
    }
    out
}

pub fn format_journal(entries: &[JournalEntry], checkpoint: u64, fmt: OutputFormat) -> String {
    match fmt {
        OutputFormat::Json => serde_json::to_string_pretty(entries).unwrap_or_default(),
        OutputFormat::Text => format_journal_text(entries, checkpoint),
    }
}

fn format_journal_text(entries: &[JournalEntry], checkpoint: u64) -> String {
    if entries.is_empty() {
        return format!("Journal empty after #{checkpoint}.");
    }

    let mut out = String::new();
    for e in entries {
        let marker = if e.sequence <= checkpoint { " " } else { "*" };
        out.push_str(&format!(
            "{marker}#{:<5} {:<7} {} {}  {}\n",
            e.sequence,
            e.operation.as_str(),
            e.entity_id.short(),
            e.snapshot.payload.title,
            e.timestamp.format("%Y-%m-%d %H:%M:%S")
        ));
    }
    out.push_str(&format!("checkpoint: #{checkpoint}\n"));
    out
}

pub fn format_sync_report(report: &SyncReport, fmt: OutputFormat) -> String {
    match fmt {
        OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
        OutputFormat::Text => format_sync_report_text(report),
    }
}

fn format_sync_report_text(r: &SyncReport) -> String {
    let mut out = String::new();
    let status = match &r.outcome {
        SyncOutcome::DryRun => "dry run (nothing written, pass --apply to sync)".to_string(),
        SyncOutcome::Applied => "applied".to_string(),
        SyncOutcome::PartiallyApplied => "partially applied".to_string(),
        SyncOutcome::Cancelled { stage } => format!("cancelled while {stage:?}").to_lowercase(),
        SyncOutcome::Failed { stage, reason } => {
            format!("failed while {}: {reason}", format!("{stage:?}").to_lowercase())
        }
    };
    out.push_str(&format!("Sync: {status}\n"));
    out.push_str(&format!(
        "Checkpoint: #{} -> #{}\n",
        r.checkpoint_before, r.checkpoint_after
    ));

    if !r.updates.is_empty() {
        out.push_str(&format!("\n--- Incoming ({}) ---\n", r.updates.len()));
        for u in &r.updates {
            let symbol = match u.action {
                UpdateAction::Apply => "~",
                UpdateAction::Remove => "-",
            };
            let note = if r.superseded.contains(&u.entity_id) {
                "  (superseded by a local edit)"
            } else {
                ""
            };
            out.push_str(&format!(
                "  {symbol} {} {}{note}\n",
                u.entity_id.short(),
                u.entity.payload.title
            ));
        }
    }

    if !r.outbound.is_empty() {
        out.push_str(&format!("\n--- Outgoing ({}) ---\n", r.outbound.len()));
        for o in &r.outbound {
            out.push_str(&format!(
                "  {:<6} {} {}\n",
                o.mode.as_str(),
                o.entity_id.short(),
                o.entity.payload.title
            ));
        }
    }

    if !r.conflicts.is_empty() {
        out.push_str(&format!("\n--- Conflicts ({}) ---\n", r.conflicts.len()));
        for c in &r.conflicts {
            out.push_str(&format!(
                "  ! {} {} [{}]\n",
                c.entity_id.short(),
                c.local_snapshot.payload.title,
                c.resolution.as_str()
            ));
        }
    }

    if !r.failed.is_empty() {
        out.push_str(&format!("\n--- Failed pushes ({}) ---\n", r.failed.len()));
        for f in &r.failed {
            out.push_str(&format!("  x {} {}\n", f.entity_id.short(), f.error));
        }
    }

    if r.updates.is_empty() && r.outbound.is_empty() && r.conflicts.is_empty() {
        out.push_str("Everything up to date.\n");
    }
    out
}

pub fn format_conflicts(conflicts: &[LoggedConflict], fmt: OutputFormat) -> String {
    match fmt {
        OutputFormat::Json => serde_json::to_string_pretty(conflicts).unwrap_or_default(),
        OutputFormat::Text => format_conflicts_text(conflicts),
    }
}

fn format_conflicts_text(conflicts: &[LoggedConflict]) -> String {
    if conflicts.is_empty() {
        return "No conflicts.".to_string();
    }

    let mut out = String::new();
    for c in conflicts {
        let record = &c.record;
        let ack = if c.acknowledged_at.is_some() {
            " (acknowledged)"
        } else {
            ""
        };
        out.push_str(&format!(
            "! {} #{} [{}]{ack}  {}\n",
            record.entity_id.short(),
            record.local_sequence,
            record.resolution.as_str(),
            c.detected_at.format("%Y-%m-%d %H:%M")
        ));
        out.push_str(&format!(
            "    local:  {} (v{})\n",
            record.local_snapshot.payload.title, record.local_snapshot.local_version
        ));
        let remote = &record.remote_snapshot;
        let remote_title = if remote.deleted {
            "(deleted)"
        } else {
            remote.payload.title.as_str()
        };
        out.push_str(&format!(
            "    remote: {remote_title} ({} v{})\n",
            remote.remote_ref, remote.remote_version
        ));
    }
    out
}

pub fn format_health(health: &Health, fmt: OutputFormat) -> String {
    match fmt {
        OutputFormat::Json => serde_json::to_string_pretty(health).unwrap_or_default(),
        OutputFormat::Text => {
            let mark = |ok: bool| if ok { "ok" } else { "FAIL" };
            let mut out = format!(
                "store:    {} ({} records, {} journal entries)\nkeychain: {}\n",
                mark(health.store_ok),
                health.records,
                health.journal_entries,
                mark(health.keychain_ok)
            );
            for problem in &health.problems {
                out.push_str(&format!("  - {problem}\n"));
            }
            out
        }
    }
}

pub fn format_replay(report: &ReplayReport, fmt: OutputFormat) -> String {
    match fmt {
        OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
        OutputFormat::Text => {
            if report.repaired.is_empty() {
                return format!("Replayed {} journal entries. Store is consistent.", report.entries);
            }
            let mut out = format!(
                "Replayed {} journal entries, repaired {} records:\n",
                report.entries,
                report.repaired.len()
            );
            for id in &report.repaired {
                out.push_str(&format!("  {}\n", id.short()));
            }
            out
        }
    }
}
