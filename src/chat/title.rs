//! Session title generation
//!
//! After a session's first completed exchange the first user message is
//! summarized into a short title. Failures are logged and the placeholder
//! title stays in place.

use super::session_store::SessionStore;
use crate::error::{ChatflowError, Result};
use crate::providers::Summarizer;
use crate::storage::Role;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Instruction sent with every title request
pub const TITLE_INSTRUCTION: &str = "Generate a concise 4-8 word title that summarizes the \
following message. Respond with plain text only: no markdown, no quotes, no trailing punctuation.";

/// Longest title kept, in characters
pub const MAX_TITLE_CHARS: usize = 80;

const WRAPPING_QUOTES: &[char] = &['"', '\'', '`', '\u{201C}', '\u{201D}', '\u{2018}', '\u{2019}'];

/// Name used by older clients for fresh sessions
const LEGACY_DEFAULT_TITLE: &str = "New Chat";

/// Normalize raw summarizer output into a title
///
/// Strips wrapping quotes and surrounding whitespace and truncates to
/// [`MAX_TITLE_CHARS`]. Returns `None` if nothing is left.
///
/// # Examples
///
/// ```
/// use chatflow::chat::title::clean_title;
///
/// assert_eq!(clean_title("\"Borrow Checker Basics\"\n").as_deref(), Some("Borrow Checker Basics"));
/// assert_eq!(clean_title(" '' "), None);
/// ```
pub fn clean_title(raw: &str) -> Option<String> {
    let stripped = raw
        .trim()
        .trim_matches(|c| WRAPPING_QUOTES.contains(&c))
        .trim();
    let title: String = stripped.chars().take(MAX_TITLE_CHARS).collect();
    let title = title.trim_end().to_string();
    if title.is_empty() {
        None
    } else {
        Some(title)
    }
}

/// Whether `name` still looks like a placeholder
///
/// Matches `prefix`, `prefix N` and the legacy "New Chat".
///
/// # Examples
///
/// ```
/// use chatflow::chat::title::is_default_title;
///
/// assert!(is_default_title("Untitled Chat 3", "Untitled Chat"));
/// assert!(is_default_title("New Chat", "Untitled Chat"));
/// assert!(!is_default_title("Tokio runtime tuning", "Untitled Chat"));
/// ```
pub fn is_default_title(name: &str, prefix: &str) -> bool {
    let name = name.trim();
    if name == LEGACY_DEFAULT_TITLE || name == prefix {
        return true;
    }
    match name.strip_prefix(prefix).and_then(|rest| rest.strip_prefix(' ')) {
        Some(number) => !number.is_empty() && number.chars().all(|c| c.is_ascii_digit()),
        None => false,
    }
}

/// Generates and stores session titles
pub struct TitleGenerator {
    summarizer: Arc<dyn Summarizer>,
    store: Arc<SessionStore>,
}

impl TitleGenerator {
    /// Create a generator writing titles through `store`
    pub fn new(summarizer: Arc<dyn Summarizer>, store: Arc<SessionStore>) -> Self {
        Self { summarizer, store }
    }

    /// Summarize `first_user_message` and rename the session
    ///
    /// # Errors
    ///
    /// Returns `TitleGeneration` if the summarizer fails or returns nothing
    /// usable, or the store error if the rename cannot be persisted.
    pub async fn generate_title(&self, session_id: &str, first_user_message: &str) -> Result<String> {
        let raw = self
            .summarizer
            .summarize(TITLE_INSTRUCTION, first_user_message)
            .await
            .map_err(|e| ChatflowError::TitleGeneration(format!("{:#}", e)))?;

        let title = clean_title(&raw).ok_or_else(|| {
            ChatflowError::TitleGeneration("Summarizer returned an empty title".to_string())
        })?;

        self.store.rename(session_id, &title).await?;
        tracing::info!(session_id = %session_id, title = %title, "Generated session title");
        Ok(title)
    }

    /// Run [`TitleGenerator::generate_title`] in the background
    ///
    /// Errors are logged and never reach the turn that triggered the task.
    pub fn spawn(self: &Arc<Self>, session_id: String, first_user_message: String) -> JoinHandle<()> {
        let generator = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = generator
                .generate_title(&session_id, &first_user_message)
                .await
            {
                tracing::warn!(session_id = %session_id, "Title generation failed: {:#}", e);
            }
        })
    }

    /// Retry titles for sessions that kept a placeholder name
    ///
    /// Only sessions with at least one completed exchange are considered.
    /// Returns the number of sessions renamed.
    pub async fn backfill(&self) -> usize {
        let prefix = self.store.default_session_name().to_string();
        let mut renamed = 0;

        for session in self.store.sessions().await {
            if !is_default_title(&session.name, &prefix) || session.completed_exchanges() == 0 {
                continue;
            }
            let Some(first) = session.messages.iter().find(|m| m.role == Role::User) else {
                continue;
            };
            match self.generate_title(&session.id, &first.content).await {
                Ok(_) => renamed += 1,
                Err(e) => {
                    tracing::warn!(session_id = %session.id, "Title backfill failed: {:#}", e)
                }
            }
        }

        if renamed > 0 {
            tracing::info!("Backfilled {} session titles", renamed);
        }
        renamed
    }
}
