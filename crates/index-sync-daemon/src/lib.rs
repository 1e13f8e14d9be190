//! index-sync command line library exports.
//!
//! # Modules
//!
//! - `cli`: Command-line argument parsing with clap
//! - `commands`: Command implementations (reconcile, bookmark, config)

pub mod cli;
pub mod commands;

pub use cli::{BookmarkCommands, Cli, Commands};
pub use commands::{
    init_tracing, load_settings, reconcile_dumps, reset_bookmark, run_reconcile, show_bookmark,
    show_config,
};
