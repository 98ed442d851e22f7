//! Chatflow - streaming chat pipeline library
//!
//! This library provides the core of a streaming chat client: a quota gate,
//! an optimistic session store, the streaming message pipeline, title
//! generation and session grouping, plus the persistence and model-provider
//! collaborators they run against.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `chat`: Quota gate, session store, streaming pipeline, titles, grouping
//! - `providers`: Model transport and summarization abstractions, SSE decoding,
//!   OpenAI-compatible implementation
//! - `storage`: Persistence collaborator with SQLite and in-memory backends
//! - `billing`: Plan tiers and the plan resolver
//! - `identity`: Caller identity
//! - `config`: Configuration management and validation
//! - `error`: Error types and result aliases
//! - `cli`: Command-line interface definition
//!
//! # Example
//!
//! ```no_run
//! use chatflow::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml", &Default::default())?;
//!     config.validate()?;
//!
//!     // Pipeline wiring would go here
//!     Ok(())
//! }
//! ```

pub mod billing;
pub mod chat;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod identity;
pub mod providers;
pub mod storage;

// Re-export commonly used types
pub use chat::{ChatPipeline, PipelineState, SessionStore, TurnOutcome};
pub use config::Config;
pub use error::{ChatflowError, Result};

#[cfg(test)]
pub mod test_utils;
