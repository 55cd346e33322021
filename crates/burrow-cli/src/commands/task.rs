use std::path::Path;

use anyhow::{bail, Context, Result};
use burrow_core::model::{Entity, EntityKind, Priority, TaskStatus};
use clap::{Args, Subcommand, ValueEnum};

use super::open_workspace;
use crate::output::format::{format_entity, format_entity_list};
use crate::output::OutputFormat;

#[derive(Args)]
pub struct TaskArgs {
    #[command(subcommand)]
    pub command: TaskCommand,
}

#[derive(Subcommand)]
pub enum TaskCommand {
    /// Add a task
    Add {
        title: String,
        #[arg(long)]
        body: Option<String>,
        #[arg(long, value_enum, default_value = "medium")]
        priority: PriorityArg,
        /// Tag (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// List tasks
    List {
        #[arg(long, value_enum)]
        status: Option<StatusArg>,
        /// Filter by tag
        #[arg(long)]
        tag: Option<String>,
    },
    /// Show one task
    Show { id: String },
    /// Change a task's fields
    Edit {
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        body: Option<String>,
        #[arg(long, value_enum)]
        status: Option<StatusArg>,
        #[arg(long, value_enum)]
        priority: Option<PriorityArg>,
        /// Replace all tags (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Mark a task done
    Done { id: String },
    /// Delete a task
    Rm { id: String },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum PriorityArg {
    Low,
    Medium,
    High,
}

impl From<PriorityArg> for Priority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::Low => Priority::Low,
            PriorityArg::Medium => Priority::Medium,
            PriorityArg::High => Priority::High,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum StatusArg {
    Todo,
    InProgress,
    Done,
}

impl From<StatusArg> for TaskStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Todo => TaskStatus::Todo,
            StatusArg::InProgress => TaskStatus::InProgress,
            StatusArg::Done => TaskStatus::Done,
        }
    }
}

pub fn run(args: &TaskArgs, data_dir: Option<&Path>, fmt: OutputFormat) -> Result<()> {
    let ws = open_workspace(data_dir)?;

    match &args.command {
        TaskCommand::Add {
            title,
            body,
            priority,
            tags,
        } => {
            if title.trim().is_empty() {
                bail!("Task title cannot be empty");
            }
            let task = Entity::new_task(title, body.as_deref(), (*priority).into(), tags.clone());
            ws.create(&task).context("Failed to add task")?;
            match fmt {
                OutputFormat::Json => println!("{}", format_entity(&task, fmt)),
                OutputFormat::Text => println!("Added task {} {}", task.id.short(), task.payload.title),
            }
        }
        TaskCommand::List { status, tag } => {
            let wanted: Option<TaskStatus> = status.map(Into::into);
            let tasks: Vec<Entity> = ws
                .store()
                .list(EntityKind::Task)?
                .into_iter()
                .filter(|t| wanted.map_or(true, |s| t.payload.status == s))
                .filter(|t| tag.as_ref().map_or(true, |tag| t.payload.tags.contains(tag)))
                .collect();
            println!("{}", format_entity_list(&tasks, fmt));
        }
        TaskCommand::Show { id } => {
            let task = get_task(&ws, id)?;
            println!("{}", format_entity(&task, fmt));
        }
        TaskCommand::Edit {
            id,
            title,
            body,
            status,
            priority,
            tags,
        } => {
            let task = get_task(&ws, id)?;
            if title.is_none() && body.is_none() && status.is_none() && priority.is_none() && tags.is_empty() {
                bail!("Nothing to change. Pass --title, --body, --status, --priority or --tag.");
            }
            let updated = ws.update(&task.id, |t| {
                if let Some(title) = title {
                    t.payload.title = title.clone();
                }
                if let Some(body) = body {
                    t.payload.body = Some(body.clone());
                }
                if let Some(status) = status {
                    t.payload.status = (*status).into();
                }
                if let Some(priority) = priority {
                    t.payload.priority = (*priority).into();
                }
                if !tags.is_empty() {
                    t.payload.tags = tags.clone();
                }
            })?;
            println!("{}", format_entity(&updated, fmt));
        }
        TaskCommand::Done { id } => {
            let task = get_task(&ws, id)?;
            let updated = ws.update(&task.id, |t| t.payload.status = TaskStatus::Done)?;
            match fmt {
                OutputFormat::Json => println!("{}", format_entity(&updated, fmt)),
                OutputFormat::Text => println!("Done: {} {}", updated.id.short(), updated.payload.title),
            }
        }
        TaskCommand::Rm { id } => {
            let task = get_task(&ws, id)?;
            ws.delete(&task.id)?;
            match fmt {
                OutputFormat::Json => println!("{}", format_entity(&task, fmt)),
                OutputFormat::Text => println!("Deleted task {} {}", task.id.short(), task.payload.title),
            }
        }
    }

    Ok(())
}

fn get_task(ws: &burrow_core::Workspace, id: &str) -> Result<Entity> {
    let entity = ws.get(id).with_context(|| format!("No task matching '{id}'"))?;
    if entity.kind != EntityKind::Task {
        bail!("{} is a conversation, not a task", entity.id.short());
    }
    Ok(entity)
}
