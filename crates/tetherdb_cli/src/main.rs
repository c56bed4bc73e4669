//! TetherDB CLI
//!
//! Command-line maintenance tools for TetherDB store files. Every command
//! needs the store closed by other processes' handles.
//!
//! # Commands
//!
//! - `inspect` - Display tables, row counts and versions
//! - `compact` - Rewrite the commit log as a single snapshot
//! - `delete` - Delete a store file
//! - `dump-log` - Dump commit log records for debugging

mod commands;

use clap::{Parser, Subcommand};
use commands::store::CliError;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// TetherDB command-line store tools.
#[derive(Parser)]
#[command(name = "tetherdb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store file
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Encryption key, as 64 hex characters
    #[arg(global = true, short, long)]
    key: Option<String>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display tables, row counts and versions
    Inspect {
        /// Show the columns of each table
        #[arg(short, long)]
        columns: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Rewrite the commit log as a single snapshot record
    Compact {
        /// Dry run - show what would be done
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Delete the store file
    Delete {
        /// Confirm the deletion
        #[arg(short, long)]
        yes: bool,
    },

    /// Dump commit log records for debugging
    DumpLog {
        /// Maximum number of records to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Include each record's full contents
        #[arg(long)]
        full: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let key = cli.key.as_deref();
    match cli.command {
        Commands::Inspect { columns, format } => {
            let path = cli.path.ok_or(CliError::PathRequired("inspect"))?;
            commands::inspect::run(&path, key, columns, &format)?;
        }
        Commands::Compact { dry_run } => {
            let path = cli.path.ok_or(CliError::PathRequired("compact"))?;
            commands::compact::run(&path, key, dry_run)?;
        }
        Commands::Delete { yes } => {
            let path = cli.path.ok_or(CliError::PathRequired("delete"))?;
            commands::delete::run(&path, key, yes)?;
        }
        Commands::DumpLog {
            limit,
            full,
            format,
        } => {
            let path = cli.path.ok_or(CliError::PathRequired("dump-log"))?;
            commands::dump_log::run(&path, key, limit, full, &format)?;
        }
        Commands::Version => {
            println!("TetherDB CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
