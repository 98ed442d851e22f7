//! Command-line interface definition for Chatflow
//!
//! This module defines the CLI structure using clap's derive API,
//! providing commands for chatting, browsing history, and inspecting quota.

use crate::billing::PlanTier;
use clap::{Parser, Subcommand};

/// Chatflow - streaming chat client
///
/// Chat with an OpenAI-compatible model, keeping sessions, titles and
/// usage quotas in a local database.
#[derive(Parser, Debug, Clone)]
#[command(name = "chatflow")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/config.yaml")]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Override the session database path
    #[arg(long)]
    pub storage_path: Option<String>,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for Chatflow
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start an interactive chat session
    Chat {
        /// Resume an existing session by ID (full or 8-char prefix)
        #[arg(short, long)]
        resume: Option<String>,

        /// Override the model used for this session
        #[arg(short, long)]
        model: Option<String>,

        /// Send a single message and exit instead of starting the prompt loop
        #[arg(short, long)]
        prompt: Option<String>,
    },

    /// Manage chat sessions
    History {
        /// History subcommand
        #[command(subcommand)]
        command: HistoryCommand,
    },

    /// Inspect or change usage quota
    Quota {
        /// Quota subcommand
        #[command(subcommand)]
        command: QuotaCommand,
    },
}

/// Session management subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum HistoryCommand {
    /// List sessions grouped by age
    List,

    /// Print the messages of a session
    Show {
        /// Session ID (full or 8-char prefix)
        id: String,
    },

    /// Rename a session
    Rename {
        /// Session ID (full or 8-char prefix)
        id: String,

        /// New title
        title: String,
    },

    /// Delete a session and its messages
    Delete {
        /// Session ID (full or 8-char prefix)
        id: String,
    },

    /// Delete several sessions in one operation
    DeleteMany {
        /// Session IDs (full or 8-char prefix)
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Toggle the pinned flag of a session
    Pin {
        /// Session ID (full or 8-char prefix)
        id: String,
    },

    /// Copy a session with all of its messages
    Duplicate {
        /// Session ID (full or 8-char prefix)
        id: String,
    },

    /// Branch a session into a new one
    Fork {
        /// Session ID (full or 8-char prefix)
        id: String,

        /// Last message to include in the fork (defaults to the whole session)
        #[arg(long)]
        at: Option<String>,
    },

    /// Regenerate titles for sessions still carrying a placeholder name
    Retitle,
}

/// Quota subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum QuotaCommand {
    /// Show current usage and remaining allowance
    Status,

    /// Change the subscription plan of the local user
    SetPlan {
        /// Plan tier
        #[arg(value_enum)]
        plan: PlanTier,
    },
}

impl Cli {
    /// Parse command line arguments
    ///
    /// # Returns
    ///
    /// Returns the parsed CLI structure
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            config: Some("config/config.yaml".to_string()),
            verbose: false,
            storage_path: None,
            command: Commands::Quota {
                command: QuotaCommand::Status,
            },
        }
    }
}
