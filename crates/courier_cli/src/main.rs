//! Courier CLI
//!
//! Command-line tools for Courier store maintenance.
//!
//! # Commands
//!
//! - `inspect` - Show the local installation and queued outbox entries
//! - `purge` - Drop expired outbox entries
//! - `clear` - Discard outbox contents

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Courier command-line store tools.
#[derive(Parser)]
#[command(name = "courier")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the local installation and queued outbox entries
    Inspect {
        /// Print every queued entry, not only counts
        #[arg(short, long)]
        entries: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Drop outbox entries older than the lifetime
    Purge {
        /// Maximum entry age in hours
        #[arg(short, long, default_value = "48")]
        lifetime_hours: u64,
    },

    /// Discard outbox contents
    Clear {
        /// Only clear this outbox key
        #[arg(short, long)]
        key: Option<String>,
    },

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
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { entries, format } => {
            let path = cli.path.ok_or("Store path required for inspect")?;
            commands::inspect::run(&path, entries, &format)?;
        }
        Commands::Purge { lifetime_hours } => {
            let path = cli.path.ok_or("Store path required for purge")?;
            commands::purge::run(&path, lifetime_hours)?;
        }
        Commands::Clear { key } => {
            let path = cli.path.ok_or("Store path required for clear")?;
            commands::purge::clear(&path, key.as_deref())?;
        }
        Commands::Version => {
            println!("Courier CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
