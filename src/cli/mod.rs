//! Command-line surface.

mod capture_cmd;
mod history_cmd;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "pagehist", version, about = "Historical web-page capture engine")]
struct Cli {
    /// Show informational logging (default shows warnings only).
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Settings file (default: pagehist.toml next to the database).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Retrieve archive snapshots for every tracked URL into the database.
    History {
        /// SQLite database holding the URL work list and results.
        db: PathBuf,
    },
    /// Capture live pages from many network vantage points.
    Capture {
        /// Proxy configuration file, one `label method args…` per line.
        locations: PathBuf,
        /// URL list, one per line.
        urls: PathBuf,
        /// Directory for capture files, one subdirectory per location.
        output_dir: PathBuf,
        #[arg(long, default_value_t = 2)]
        workers_per_location: usize,
        #[arg(long)]
        total_workers: Option<usize>,
        #[arg(long)]
        max_simultaneous_proxies: Option<usize>,
    },
}

/// Peek at the arguments before full parsing, so logging can be configured
/// first thing in main().
pub fn is_verbose() -> bool {
    std::env::args().any(|a| a == "-v" || a == "--verbose")
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::History { db } => history_cmd::run(&db, cli.config.as_deref()).await,
        Command::Capture {
            locations,
            urls,
            output_dir,
            workers_per_location,
            total_workers,
            max_simultaneous_proxies,
        } => {
            capture_cmd::run(
                &locations,
                &urls,
                output_dir,
                crate::capture::CaptureConfig {
                    workers_per_location,
                    total_workers,
                    max_simultaneous_proxies,
                },
            )
            .await
        }
    }
}
