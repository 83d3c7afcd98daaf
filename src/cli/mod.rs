//! CLI interface for kbgate.
//!
//! Provides command-line argument parsing using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::dispatch::Tier;

/// Command-line interface for kbgate.
#[derive(Parser)]
#[command(name = "kbgate")]
#[command(author, version, about = "Tiered tool gateway over markdown knowledge bases", long_about = None)]
pub struct Cli {
    /// Config file (default: $KBGATE_CONFIG, then the platform config dir).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// The subcommand to run.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Serve the tool protocol on stdio, or on a TCP address.
    Serve {
        /// Listen on this address instead of stdio (e.g., "127.0.0.1:7411").
        #[arg(short, long)]
        listen: Option<String>,

        /// Serve MCP on stdio instead of the native protocol.
        #[cfg(feature = "mcp")]
        #[arg(long, conflicts_with = "listen")]
        mcp: bool,
    },

    /// Search entries matching a query.
    Search {
        /// The search query string.
        query: String,

        /// Restrict to these KBs (repeatable).
        #[arg(short, long = "kb")]
        kbs: Vec<String>,

        /// Filter results to this entry type only.
        #[arg(short = 't', long = "type")]
        entry_type: Option<String>,

        /// Maximum number of results to return.
        #[arg(short, long)]
        limit: Option<usize>,

        /// Continue from a previous page.
        #[arg(long)]
        cursor: Option<String>,
    },

    /// List entries in id order.
    List {
        /// Restrict to these KBs (repeatable).
        #[arg(short, long = "kb")]
        kbs: Vec<String>,

        /// Filter to this entry type only.
        #[arg(short = 't', long = "type")]
        entry_type: Option<String>,

        /// Field filter as key=value (repeatable).
        #[arg(short, long = "field")]
        fields: Vec<String>,

        /// Maximum number of entries to return.
        #[arg(short, long)]
        limit: Option<usize>,

        /// Continue from a previous page.
        #[arg(long)]
        cursor: Option<String>,
    },

    /// Get the full contents of an entry by its id.
    Get {
        /// Entry id (e.g., "notes/decisions/adr-1.md").
        id: String,
    },

    /// Rebuild the index of one KB, or of every KB.
    Reindex {
        /// KB to rebuild (default: all).
        kb: Option<String>,
    },

    /// List the tools available at a tier.
    Tools {
        /// Tier to list for.
        #[arg(short, long, value_enum, default_value_t = Tier::Read)]
        tier: Tier,
    },

    /// Show active, quarantined, and disabled plugins.
    Plugins,
}
