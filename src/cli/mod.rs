//! CLI command definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Manage Claude runtime versions and the background session", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Data directory (defaults to the platform data dir)
    #[arg(short, long, global = true)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List available and installed runtime versions
    Versions {
        /// Ignore the discovery cache
        #[arg(long)]
        refresh: bool,
    },

    /// Download and verify a runtime version
    Download {
        /// Version to download (e.g. 2.1.3)
        version: String,

        /// Activate the version once downloaded
        #[arg(long)]
        activate: bool,
    },

    /// Make an installed version the active runtime
    Activate {
        version: String,
    },

    /// Switch back to the bundled runtime
    ResetBundled,

    /// Delete a downloaded version
    Delete {
        version: String,
    },

    /// Print the binary that would be launched
    Path,

    /// Generate a conversation title for a message
    Title {
        message: String,
    },

    /// Send a prompt through the background session
    Ask {
        prompt: String,

        /// Model override for this query
        #[arg(short, long)]
        model: Option<String>,
    },
}
