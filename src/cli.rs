//! CLI argument parsing with clap.

use std::net::IpAddr;
use std::path::PathBuf;
use clap::{Parser, Subcommand, ValueEnum};
use thiserror::Error;

use crate::config::ConfigError;
use crate::control::ControlError;
use crate::daemon::DaemonError;
use crate::filter::categories::Category;
use crate::stats::aggregator::StatsError;
use crate::sync::store::StoreError;
use crate::utils::logging::LogError;

#[derive(Parser, Debug)]
#[command(name = "flowguard")]
#[command(author, version, about = "Per-device DNS and traffic filtering engine")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path (JSON)
    #[arg(short, long, global = true, env = "FLOWGUARD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose mode (debug output)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the filtering daemon
    Run,

    /// Ask the running daemon to reload its configuration
    Reload,

    /// Show a summary of the live policy snapshot
    Snapshot {
        /// Build the summary from the bundle file instead of asking the daemon
        #[arg(long)]
        offline: bool,
    },

    /// Show today's statistics
    Stats {
        /// Read the statistics file instead of asking the daemon
        #[arg(long)]
        offline: bool,
    },

    /// Run a captured DNS query through the extractor and the engine
    Replay {
        /// Query payload as hex
        #[arg(required_unless_present = "file", conflicts_with = "file")]
        hex: Option<String>,

        /// Read the raw payload from a file
        #[arg(long)]
        file: Option<PathBuf>,

        /// Source address, used to find the device
        #[arg(long)]
        client: Option<IpAddr>,
    },

    /// Block a domain and its subdomains
    Block {
        domain: String,

        #[arg(long, default_value = "custom")]
        category: Category,
    },

    /// Remove a blocked domain
    Unblock { domain: String },

    /// Block every preset domain of a category
    BlockCategory { category: Category },

    /// Remove every blocked domain of a category
    UnblockCategory { category: Category },

    /// Turn protection on or off
    Protection {
        #[arg(value_enum)]
        state: Switch,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Switch {
    On,
    Off,
}

/// Errors surfaced by CLI commands
#[derive(Error, Debug)]
pub enum CommandError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Daemon(#[from] DaemonError),

    #[error(transparent)]
    Stats(#[from] StatsError),

    #[error("Invalid hex payload: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type CommandResult<T> = Result<T, CommandError>;
