use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

mod commands;
mod output;

#[derive(Parser)]
#[command(
    name = "burrow",
    version,
    about = "Encrypted local tasks and conversations, synced to your issue tracker"
)]
struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    format: output::OutputFormat,

    /// Data directory (default: nearest .burrow above the current directory)
    #[arg(long, global = true, env = "BURROW_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let dir = cli.data_dir.as_deref();
    match &cli.command {
        commands::Commands::Init(args) => commands::init::run(args, dir),
        commands::Commands::Task(args) => commands::task::run(args, dir, cli.format),
        commands::Commands::Convo(args) => commands::convo::run(args, dir, cli.format),
        commands::Commands::Sync(args) => commands::sync::run(args, dir, cli.format),
        commands::Commands::Conflicts(args) => commands::conflicts::run(args, dir, cli.format),
        commands::Commands::Journal(args) => commands::journal::run(args, dir, cli.format),
        commands::Commands::Repair => commands::repair::run(dir, cli.format),
        commands::Commands::Health => commands::health::run(dir, cli.format),
        commands::Commands::Version => commands::version::run(),
    }
}
