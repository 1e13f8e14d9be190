//! index-sync
//!
//! Operator tooling for search index consistency.
//!
//! # Usage
//!
//! ```bash
//! index-sync reconcile --persisted store.jsonl --indexed index.jsonl [--tolerance-secs N]
//! index-sync bookmark show [--path PATH]
//! index-sync bookmark reset [--path PATH]
//! index-sync config
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded in order (later sources override earlier):
//! 1. Built-in defaults
//! 2. Config file (<config dir>/index-sync/config.toml)
//! 3. File given with --config
//! 4. Environment variables (INDEX_SYNC_*)
//! 5. CLI flags

use anyhow::Result;
use clap::Parser;

use index_sync_daemon::{
    reset_bookmark, run_reconcile, show_bookmark, show_config, BookmarkCommands, Cli, Commands,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.config.as_deref();
    let log_level = cli.log_level.as_deref();

    match cli.command {
        Commands::Reconcile {
            persisted,
            indexed,
            tolerance_secs,
        } => {
            run_reconcile(config, log_level, &persisted, &indexed, tolerance_secs).await?;
        }
        Commands::Bookmark { path, command } => match command {
            BookmarkCommands::Show => show_bookmark(config, log_level, path.as_deref()).await?,
            BookmarkCommands::Reset => reset_bookmark(config, log_level, path.as_deref()).await?,
        },
        Commands::Config => {
            show_config(config)?;
        }
    }

    Ok(())
}
