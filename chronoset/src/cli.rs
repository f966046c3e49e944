//! Command-line entry points.
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// chronoset: a distributed, eventually-consistent LWW-element-set index.
#[derive(Parser, Debug)]
#[command(name = "chronoset", version)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "chronoset.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the farm and serve requests until interrupted.
    Run,

    /// Load and validate the configuration file, then exit.
    Configcheck,

    /// Scan and print every logical key the farm currently knows about.
    Keys {
        /// Keys to fetch per scan batch.
        #[arg(long, default_value_t = 100)]
        batch_size: usize,
    },
}
