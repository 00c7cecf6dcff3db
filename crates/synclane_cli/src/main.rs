//! Synclane CLI
//!
//! Maintenance tools for the metadata directory of a synclane client.
//!
//! # Commands
//!
//! - `inspect` - List persisted users and pending file actions
//! - `run-file-actions` - Run the startup file action sweep
//! - `purge-users` - Delete the data of logged-out users

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use synclane_core::EncryptionKey;
use tracing_subscriber::EnvFilter;

/// Synclane maintenance tools.
#[derive(Parser)]
#[command(name = "synclane")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    /// Metadata encryption key as 64 hex characters
    #[arg(global = true, long)]
    key_hex: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List persisted users and pending file actions
    Inspect {
        /// Path to the metadata directory
        #[arg(short, long)]
        metadata: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Run pending file actions
    RunFileActions {
        /// Base directory passed to the client
        #[arg(short, long)]
        base: PathBuf,
    },

    /// Delete directories and records of users marked for removal
    PurgeUsers {
        /// Base directory passed to the client
        #[arg(short, long)]
        base: PathBuf,
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

    let key = cli
        .key_hex
        .as_deref()
        .map(EncryptionKey::from_hex)
        .transpose()?;

    match cli.command {
        Commands::Inspect { metadata, format } => {
            commands::inspect::run(&metadata, key.as_ref(), &format)?;
        }
        Commands::RunFileActions { base } => {
            let report = commands::maintenance::run_file_actions(&base, key.as_ref())?;
            if report.pending > 0 {
                tracing::warn!(pending = report.pending, "some file actions are still pending");
            }
        }
        Commands::PurgeUsers { base } => {
            commands::maintenance::purge_users(&base, key.as_ref())?;
        }
        Commands::Version => {
            println!("Synclane CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
