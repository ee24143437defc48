use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use furrow_core::ConflictResolution;

#[derive(Parser)]
#[command(name = "furrow")]
#[command(about = "Queue, inspect, and sync offline record changes")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Tenant scope (e.g. farm id) for new mutations and scoped reads
    #[arg(long, global = true, value_name = "SCOPE")]
    pub scope: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Queue a local change for the next sync
    Enqueue {
        #[command(subcommand)]
        command: EnqueueCommands,
    },
    /// Show queue counts, conflicts, and last sync per table
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List queued mutations
    Queue {
        /// Only show failed items
        #[arg(long)]
        failed: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Replay queued mutations against the remote store
    Sync {
        /// Output the sync report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect and resolve sync conflicts
    Conflicts {
        #[command(subcommand)]
        command: ConflictCommands,
    },
    /// Show per-table sync checkpoints
    Checkpoints {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect or invalidate the local record cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
    /// Move a failed item back to pending
    Retry {
        /// Queue item id
        id: String,
    },
    /// Abandon a failed item and undo its optimistic cache writes
    Discard {
        /// Queue item id
        id: String,
    },
    /// Remove completed items past the retention window
    Purge {
        /// Remove every completed item regardless of age
        #[arg(long)]
        all: bool,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(Subcommand)]
pub enum EnqueueCommands {
    /// Insert a record
    Create {
        table: String,
        id: String,
        /// Record fields as a JSON object
        #[arg(long, value_name = "JSON")]
        data: String,
        /// Reuse an idempotency token when re-queueing the same change
        #[arg(long, value_name = "TOKEN")]
        optimistic_id: Option<String>,
    },
    /// Change fields of an existing record
    Update {
        table: String,
        id: String,
        /// Changed fields as a JSON object
        #[arg(long, value_name = "JSON")]
        changes: String,
        /// Record as last seen, as a JSON object (defaults to the cached copy)
        #[arg(long, value_name = "JSON")]
        base: Option<String>,
        #[arg(long, value_name = "TOKEN")]
        optimistic_id: Option<String>,
    },
    /// Remove a record
    Delete {
        table: String,
        id: String,
        #[arg(long, value_name = "TOKEN")]
        optimistic_id: Option<String>,
    },
    /// Insert many records in one call
    Bulk {
        table: String,
        /// JSON array of objects, each with a string `id`
        #[arg(long, value_name = "JSON")]
        records: String,
        #[arg(long, value_name = "TOKEN")]
        optimistic_id: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum ConflictCommands {
    /// List unresolved conflicts in the current scope
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Record a resolution and apply it when a remote store is configured
    Resolve {
        /// Conflict id
        id: String,
        #[arg(long, value_enum)]
        strategy: ResolveStrategy,
        /// Resolved record as a JSON object (merged only)
        #[arg(long, value_name = "JSON")]
        data: Option<String>,
    },
    /// Resolve with the per-field merge and apply it
    Merge {
        /// Conflict id
        id: String,
    },
}

#[derive(Subcommand)]
pub enum CacheCommands {
    /// Entry counts and freshness per collection
    Stats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Drop cached entries for a collection or a single record
    Invalidate {
        collection: String,
        /// Record id; the whole collection when omitted
        id: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum ResolveStrategy {
    ClientWins,
    ServerWins,
    Merged,
}

impl From<ResolveStrategy> for ConflictResolution {
    fn from(strategy: ResolveStrategy) -> Self {
        match strategy {
            ResolveStrategy::ClientWins => Self::ClientWins,
            ResolveStrategy::ServerWins => Self::ServerWins,
            ResolveStrategy::Merged => Self::Merged,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}
