use std::path::Path;

use anyhow::{bail, Context, Result};
use burrow_core::model::{Entity, EntityKind, Role};
use burrow_core::Workspace;
use clap::{Args, Subcommand, ValueEnum};

use super::open_workspace;
use crate::output::format::{format_entity, format_entity_list};
use crate::output::OutputFormat;

#[derive(Args)]
pub struct ConvoArgs {
    #[command(subcommand)]
    pub command: ConvoCommand,
}

#[derive(Subcommand)]
pub enum ConvoCommand {
    /// Start a conversation
    New { title: String },
    /// Append a message
    Say {
        id: String,
        text: String,
        #[arg(long, value_enum, default_value = "user")]
        role: RoleArg,
    },
    /// Show a conversation and its transcript
    Show { id: String },
    /// List conversations
    List,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum RoleArg {
    User,
    Assistant,
    System,
}

impl From<RoleArg> for Role {
    fn from(arg: RoleArg) -> Self {
        match arg {
            RoleArg::User => Role::User,
            RoleArg::Assistant => Role::Assistant,
            RoleArg::System => Role::System,
        }
    }
}

pub fn run(args: &ConvoArgs, data_dir: Option<&Path>, fmt: OutputFormat) -> Result<()> {
    let ws = open_workspace(data_dir)?;

    match &args.command {
        ConvoCommand::New { title } => {
            if title.trim().is_empty() {
                bail!("Conversation title cannot be empty");
            }
            let convo = Entity::new_conversation(title);
            ws.create(&convo).context("Failed to start conversation")?;
            match fmt {
                OutputFormat::Json => println!("{}", format_entity(&convo, fmt)),
                OutputFormat::Text => {
                    println!("Started conversation {} {}", convo.id.short(), convo.payload.title)
                }
            }
        }
        ConvoCommand::Say { id, text, role } => {
            let convo = get_convo(&ws, id)?;
            let updated = ws.update(&convo.id, |c| c.push_message((*role).into(), text))?;
            match fmt {
                OutputFormat::Json => println!("{}", format_entity(&updated, fmt)),
                OutputFormat::Text => println!(
                    "{} now has {} messages",
                    updated.id.short(),
                    updated.payload.transcript.len()
                ),
            }
        }
        ConvoCommand::Show { id } => {
            let convo = get_convo(&ws, id)?;
            println!("{}", format_entity(&convo, fmt));
        }
        ConvoCommand::List => {
            let convos = ws.store().list(EntityKind::Conversation)?;
            println!("{}", format_entity_list(&convos, fmt));
        }
    }

    Ok(())
}

fn get_convo(ws: &Workspace, id: &str) -> Result<Entity> {
    let entity = ws
        .get(id)
        .with_context(|| format!("No conversation matching '{id}'"))?;
    if entity.kind != EntityKind::Conversation {
        bail!("{} is a task, not a conversation", entity.id.short());
    }
    Ok(entity)
}
