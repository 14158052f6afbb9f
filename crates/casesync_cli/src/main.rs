//! casesync CLI
//!
//! Diagnostics for a file-backed casesync local store.
//!
//! # Commands
//!
//! - `inspect` - Display snapshot, deletion ledger, document and settings summaries
//! - `verify` - Run the load-time validation and report dangling references

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// casesync local store tools.
#[derive(Parser)]
#[command(name = "casesync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the local store directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Data owner whose snapshot to read
    #[arg(global = true, short, long, default_value = "default")]
    owner: String,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Output format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Human-readable text.
    Text,
    /// Pretty-printed JSON.
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Display store contents by table, ledger and document state
    Inspect {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Validate the stored snapshot and documents
    Verify,

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Store path required for inspect")?;
            commands::inspect::run(&path, &cli.owner, format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Store path required for verify")?;
            commands::verify::run(&path, &cli.owner)?;
        }
        Commands::Version => {
            println!("casesync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
