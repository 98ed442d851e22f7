//! Base provider traits and types for Chatflow
//!
//! This module defines the collaborator contracts the chat pipeline consumes:
//! a streaming model transport and a one-shot summarizer.

use crate::error::Result;
use crate::storage::Role;
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// Token usage reported by a provider at the end of a stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Number of tokens in the prompt
    pub prompt_tokens: u32,
    /// Number of tokens in the completion
    pub completion_tokens: u32,
    /// Total tokens used (prompt + completion)
    pub total_tokens: u32,
}

impl TokenUsage {
    /// Create a new TokenUsage instance
    ///
    /// # Examples
    ///
    /// ```
    /// use chatflow::providers::TokenUsage;
    ///
    /// let usage = TokenUsage::new(100, 50);
    /// assert_eq!(usage.total_tokens, 150);
    /// ```
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

/// One prior message sent as context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryMessage {
    /// Author of the message
    pub role: Role,
    /// Text content
    pub content: String,
}

impl HistoryMessage {
    /// Create a history entry
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Everything a provider needs to produce one assistant reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    /// Most recent prior messages, oldest first, excluding the new input
    pub history: Vec<HistoryMessage>,
    /// The user's new message
    pub input: String,
    /// Model identifier
    pub model: String,
    /// Session the reply belongs to
    pub session_id: String,
}

/// Event produced by a response stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Text fragment to append to the reply
    Delta(String),
    /// Token counts for the exchange
    Usage(TokenUsage),
    /// The provider finished the reply
    Done,
}

/// Ordered, finite stream of reply events
///
/// An `Err` item is a transport-level failure and ends the turn.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

/// Model-provider transport collaborator
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Open a response stream for `request`
    ///
    /// Dropping the returned stream aborts the underlying request.
    ///
    /// # Errors
    ///
    /// Returns error if the request cannot be sent or is rejected outright
    async fn open_stream(&self, request: StreamRequest) -> Result<ChatStream>;
}

/// Summarization collaborator used for session titles
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Produce a summary of `text` following `instruction`
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or the reply is empty
    async fn summarize(&self, instruction: &str, text: &str) -> Result<String>;
}
