use crate::billing::PlanTier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A chat session owned by exactly one caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Unique identifier for the session
    pub id: String,
    /// Owner of the session; immutable after creation
    pub owner_id: String,
    /// Display title
    pub name: String,
    /// Whether the session is pinned in the list
    pub pinned: bool,
    /// When the session was created
    pub created_at: DateTime<Utc>,
    /// Last rename, pin toggle, or message append
    pub updated_at: DateTime<Utc>,
    /// Messages in insertion order
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

impl Session {
    /// Create an empty session with a fresh id
    pub fn new(owner_id: impl Into<String>, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.into(),
            name: name.into(),
            pinned: false,
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
        }
    }

    /// Number of assistant replies that completed successfully
    pub fn completed_exchanges(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.role == Role::Assistant && m.status == MessageStatus::Complete)
            .count()
    }

    /// Advance `updated_at`, never moving it backwards
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    /// Copy of the session without its messages
    pub fn header(&self) -> Session {
        Session {
            messages: Vec::new(),
            ..self.clone()
        }
    }
}

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Text typed by the caller
    User,
    /// Text produced by the model
    Assistant,
}

impl Role {
    /// Stable identifier used in storage and on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(format!("Unknown role: {}", other)),
        }
    }
}

/// Lifecycle of a message's content
///
/// Only a `Pending` assistant message accepts content updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Assistant placeholder still receiving deltas
    Pending,
    /// Final content written
    Complete,
    /// Stream stopped by the caller; partial content kept
    Cancelled,
    /// Stream failed; content replaced with the generic error text
    Errored,
}

impl MessageStatus {
    /// Stable identifier used in storage
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Complete => "complete",
            MessageStatus::Cancelled => "cancelled",
            MessageStatus::Errored => "errored",
        }
    }
}

impl FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "complete" => Ok(MessageStatus::Complete),
            "cancelled" => Ok(MessageStatus::Cancelled),
            "errored" => Ok(MessageStatus::Errored),
            other => Err(format!("Unknown message status: {}", other)),
        }
    }
}

/// A single message in a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Client-generated identifier
    pub id: String,
    /// Owning session
    pub session_id: String,
    /// Author
    pub role: Role,
    /// Text content
    pub content: String,
    /// Model that produced an assistant message
    pub model: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Prompt tokens reported for a finalized assistant message
    pub prompt_tokens: Option<u32>,
    /// Completion tokens reported for a finalized assistant message
    pub completion_tokens: Option<u32>,
    /// Content lifecycle
    pub status: MessageStatus,
}

impl ChatMessage {
    /// Create a completed user message
    pub fn user(session_id: &str, content: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            role: Role::User,
            content: content.into(),
            model: None,
            created_at: now,
            prompt_tokens: None,
            completion_tokens: None,
            status: MessageStatus::Complete,
        }
    }

    /// Create an empty assistant placeholder awaiting stream content
    pub fn assistant_placeholder(session_id: &str, model: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            role: Role::Assistant,
            content: String::new(),
            model: Some(model.to_string()),
            created_at: now,
            prompt_tokens: None,
            completion_tokens: None,
            status: MessageStatus::Pending,
        }
    }

    /// Copy this message into another session under a new id
    pub fn copy_into(&self, session_id: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            ..self.clone()
        }
    }
}

/// Usage counter period
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsagePeriod {
    /// Calendar day
    Day,
    /// Calendar month
    Month,
}

/// Per-owner usage counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaState {
    /// Owner the counters belong to
    pub owner_id: String,
    /// Subscription tier recorded for the owner
    pub plan: PlanTier,
    /// Completed turns since `last_day_reset`
    pub current_day_usage: u32,
    /// Completed turns since `last_month_reset`
    pub current_month_usage: u32,
    /// Last time the daily counter was zeroed
    pub last_day_reset: DateTime<Utc>,
    /// Last time the monthly counter was zeroed
    pub last_month_reset: DateTime<Utc>,
}

impl QuotaState {
    /// Zeroed counters on the free tier
    pub fn new(owner_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            owner_id: owner_id.into(),
            plan: PlanTier::Free,
            current_day_usage: 0,
            current_month_usage: 0,
            last_day_reset: now,
            last_month_reset: now,
        }
    }
}
