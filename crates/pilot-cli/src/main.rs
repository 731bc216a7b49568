use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use pilot_storage::Store;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod output;
mod queue;

use output::KvLine;
use queue::QueueCommand;

#[derive(Parser, Debug)]
#[command(name = "pilot-queue")]
#[command(about = "Task queue entry point for automation scripts", long_about = None)]
struct Cli {
    /// Store file (defaults to PILOT_DB_PATH, then the data directory)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: QueueCommand,
}

fn main() -> ExitCode {
    init_logging();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err)
            if matches!(
                err.kind(),
                ErrorKind::DisplayHelp
                    | ErrorKind::DisplayVersion
                    | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
            ) =>
        {
            err.exit()
        }
        Err(err) => {
            let message = err.to_string();
            let first_line = message.lines().next().unwrap_or("invalid arguments");
            println!("{}", KvLine::failed(first_line.trim_start_matches("error: ")));
            return ExitCode::from(2);
        }
    };

    match run(cli) {
        Ok(line) => {
            println!("{line}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!(event = "command_failed", error = %format!("{err:#}"));
            println!("{}", KvLine::failed(format!("{err:#}")));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<KvLine> {
    let path = pilot_core::config::resolve_db_path(cli.db.as_deref())
        .context("cannot resolve store path")?;
    let store = Store::open(&path)
        .with_context(|| format!("cannot open store at {}", path.display()))?;
    queue::execute(&store, cli.command)
}

/// Logs go to stderr; stdout carries exactly one result line.
fn init_logging() {
    let level = std::env::var("PILOT_LOG_LEVEL").unwrap_or_else(|_| "warn".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
