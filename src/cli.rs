//! Command line argument parsing for the cache server binary.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "acserver", about = "Distributed build-artifact cache server")]
pub struct Cli {
    /// Path to the TOML config file (falls back to defaults if missing).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Overrides the configured cache-root folder.
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the server loop: accept client connections, maintain the
    /// upstream connection, drive autosave and shared-directory refresh.
    Serve,
    /// Print or write the effective configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Connect briefly to a running instance and print its status.
    Stats {
        /// host:port of a running server.
        address: String,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML.
    Show,
    /// Write the default configuration to the given path.
    Init { path: PathBuf },
}
