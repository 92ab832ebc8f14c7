use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "roost")]
#[command(about = "Roost - Provision and supervise bot instances")]
pub struct Cli {
    /// Controller root (defaults to the current directory)
    #[arg(short, long)]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Provision a new instance from a source repository
    Create {
        /// Instance name (unique; also the checkout directory name)
        name: String,

        /// Source repository URL or local working-tree path
        #[arg(short, long)]
        source: String,

        /// Version reference to check out (branch, tag, or commit)
        #[arg(short, long)]
        version: Option<String>,

        /// Network port handed to the instance via its env file
        #[arg(short, long)]
        port: Option<u16>,

        /// Owning principal (lookup only)
        #[arg(long)]
        owner: Option<String>,
    },
    /// Start an instance (idempotent)
    Start {
        /// Instance name
        name: String,
    },
    /// Stop an instance (idempotent)
    Stop {
        /// Instance name
        name: String,
    },
    /// Apply a desired-state update (status, version, and/or port)
    Update {
        /// Instance name
        name: String,

        /// Desired status: running or stopped
        #[arg(long)]
        status: Option<String>,

        /// New version reference
        #[arg(short, long)]
        version: Option<String>,

        /// New port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Stop an instance and discard its record (checkout stays on disk)
    Delete {
        /// Instance name
        name: String,
    },
    /// List all instances
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List remote branch names of a source repository
    Branches {
        /// Source repository URL or local path
        source: String,
    },
    /// Restart every instance recorded as running (after a controller restart)
    Resume,
    /// Manage the singleton main process
    #[command(subcommand)]
    Main(MainCommands),
}

#[derive(Subcommand)]
pub enum MainCommands {
    /// Start the main process (idempotent)
    Start,
    /// Stop the main process (idempotent)
    Stop,
    /// Show main process status
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}
