use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Orket — a deterministic, state-driven orchestration engine.
#[derive(Debug, Parser)]
#[command(name = "orket", version, about)]
pub struct Cli {
    /// Workspace directory (defaults to ORKET_WORKSPACE or `.`).
    #[arg(long, global = true)]
    pub workspace: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start a session on a target card and drive it to completion.
    Run {
        /// The card to drive (initiative, project, or task id).
        #[arg(long)]
        target: String,
        /// Per-turn timeout in seconds (overrides config).
        #[arg(long)]
        timeout: Option<u64>,
        /// Stop after this many turns.
        #[arg(long)]
        max_turns: Option<u32>,
        /// Plan only: print the dispatch order without executing.
        #[arg(long)]
        dry_run: bool,
    },
    /// Resume work on the target of a previous session.
    Resume {
        /// Session id from the ledger.
        #[arg(long)]
        session: String,
        #[arg(long)]
        max_turns: Option<u32>,
    },
    /// Start the HTTP gateway.
    Serve {
        /// Bind address override (host:port).
        #[arg(long)]
        bind: Option<String>,
    },
    /// Scaffold a new workspace (directories, config, role assets).
    Init,
    /// Import a card file (legacy kinds and priorities are migrated).
    Import {
        /// Path to a JSON array of cards.
        file: PathBuf,
    },
}

/// Resolve the workspace path: flag, then env, then cwd.
pub fn resolve_workspace(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var("ORKET_WORKSPACE").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."))
}
