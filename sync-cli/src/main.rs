//! # statesync-cli
//!
//! CLI tool for exercising the statesync revision protocol.
//!
//! ## Commands
//!
//! - `check`: Validate a revision string
//! - `compare`: Order two revision strings
//! - `simulate`: Run several engines against one in-memory backend
//!
//! ## Example
//!
//! ```bash
//! statesync-cli check 18446744073709551615
//! statesync-cli compare 9 10
//! statesync-cli simulate --windows 4 --mutations 50 --delay-ms 5
//! RUST_LOG=statesync_client=debug statesync-cli simulate --config sync.toml
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{check, compare, simulate};

/// CLI tool for exercising the statesync revision protocol.
#[derive(Parser, Debug)]
#[command(name = "statesync-cli")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check whether a value is a canonical revision
    Check {
        /// Candidate revision string
        revision: String,
    },

    /// Compare two revisions (prints <, = or >)
    Compare {
        /// Left-hand revision
        a: String,
        /// Right-hand revision
        b: String,
    },

    /// Run N engines on one in-memory backend and apply M mutations
    Simulate {
        /// Number of engines ("windows")
        #[arg(long, default_value = "3")]
        windows: usize,

        /// Number of committed mutations
        #[arg(long, default_value = "20")]
        mutations: u64,

        /// Engine settings file (TOML); defaults to topic "simulation"
        #[arg(long)]
        config: Option<PathBuf>,

        /// Simulated snapshot fetch latency in milliseconds
        #[arg(long, default_value = "0")]
        delay_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("warn")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Check { revision } => {
            check::run(&revision)?;
        }
        Commands::Compare { a, b } => {
            compare::run(&a, &b)?;
        }
        Commands::Simulate {
            windows,
            mutations,
            config,
            delay_ms,
        } => {
            simulate::run(simulate::SimulateArgs {
                windows,
                mutations,
                config,
                delay_ms,
            })
            .await?;
        }
    }

    Ok(())
}
