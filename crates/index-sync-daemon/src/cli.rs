//! CLI argument parsing for index-sync.
//!
//! CLI flags override all other config sources.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Search index consistency tooling
#[derive(Parser, Debug)]
#[command(name = "index-sync")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file (in addition to <config dir>/index-sync/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Set log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Compare two metadata dumps and print the re-index requests they imply
    Reconcile {
        /// JSON lines dump of the authoritative store
        #[arg(long)]
        persisted: PathBuf,

        /// JSON lines dump of the search index
        #[arg(long)]
        indexed: PathBuf,

        /// Ignore entities modified within this many seconds
        #[arg(long)]
        tolerance_secs: Option<u64>,
    },

    /// Inspect or reset the background sync bookmark
    Bookmark {
        /// Bookmark file (default from config)
        #[arg(long, global = true)]
        path: Option<String>,

        #[command(subcommand)]
        command: BookmarkCommands,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum BookmarkCommands {
    /// Print the persisted bookmark
    Show,
    /// Make the next pass start from the beginning
    Reset,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_reconcile() {
        let cli = Cli::parse_from([
            "index-sync",
            "reconcile",
            "--persisted",
            "store.jsonl",
            "--indexed",
            "index.jsonl",
            "--tolerance-secs",
            "30",
        ]);
        match cli.command {
            Commands::Reconcile {
                persisted,
                indexed,
                tolerance_secs,
            } => {
                assert_eq!(persisted, PathBuf::from("store.jsonl"));
                assert_eq!(indexed, PathBuf::from("index.jsonl"));
                assert_eq!(tolerance_secs, Some(30));
            }
            _ => panic!("Expected Reconcile command"),
        }
    }

    #[test]
    fn test_cli_reconcile_requires_both_dumps() {
        let result = Cli::try_parse_from(["index-sync", "reconcile", "--persisted", "a.jsonl"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_bookmark_reset_with_path() {
        let cli = Cli::parse_from(["index-sync", "bookmark", "reset", "--path", "/tmp/b.json"]);
        match cli.command {
            Commands::Bookmark { path, command } => {
                assert_eq!(path.as_deref(), Some("/tmp/b.json"));
                assert_eq!(command, BookmarkCommands::Reset);
            }
            _ => panic!("Expected Bookmark command"),
        }
    }

    #[test]
    fn test_cli_global_flags() {
        let cli = Cli::parse_from(["index-sync", "config", "--config", "/etc/sync.toml", "-l", "debug"]);
        assert!(matches!(cli.command, Commands::Config));
        assert_eq!(cli.config.as_deref(), Some("/etc/sync.toml"));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
    }
}
