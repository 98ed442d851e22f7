/*!
Command handlers for the CLI

This module provides command handlers invoked by the CLI entrypoint.

It exposes three top-level command modules:

- `chat`: Interactive or one-shot streaming chat
- `history`: Session listing and management
- `quota`: Usage inspection and plan changes

All of them share an [`AppContext`] built from the loaded configuration.
*/

use crate::billing::StoredPlanResolver;
use crate::chat::{QuotaGate, SessionStore};
use crate::config::Config;
use crate::error::Result;
use crate::identity::{IdentityProvider, StaticIdentity};
use crate::storage::{Persistence, SqliteStorage};
use std::sync::Arc;

pub mod chat;
pub mod history;
pub mod quota;
pub mod special_commands;

/// Collaborators wired from configuration
pub struct AppContext {
    /// Loaded configuration
    pub config: Config,
    /// Persistence backend
    pub storage: Arc<dyn Persistence>,
    /// Identity of the local caller
    pub identity: Arc<dyn IdentityProvider>,
    /// Resolved owner id
    pub owner_id: String,
    /// Session list, loaded from storage
    pub store: Arc<SessionStore>,
    /// Quota gate
    pub quota: Arc<QuotaGate>,
}

impl AppContext {
    /// Open the database and load the caller's sessions
    ///
    /// # Errors
    ///
    /// Returns error if the caller cannot be identified or the database
    /// cannot be opened
    pub async fn build(config: Config) -> Result<Self> {
        let sqlite = SqliteStorage::open(config.storage.path.as_deref())?;
        tracing::debug!("Using session database at {}", sqlite.db_path().display());
        Self::with_storage(config, Arc::new(sqlite)).await
    }

    /// Wire the context over an existing backend
    pub async fn with_storage(config: Config, storage: Arc<dyn Persistence>) -> Result<Self> {
        let identity: Arc<dyn IdentityProvider> =
            Arc::new(StaticIdentity::new(config.identity.owner_id.clone()));
        let owner_id = identity.current_owner_id().await?;

        let store = Arc::new(SessionStore::new(
            storage.clone(),
            owner_id.clone(),
            config.chat.default_session_name.clone(),
        ));
        store.load().await?;

        let quota = Arc::new(QuotaGate::new(
            storage.clone(),
            Arc::new(StoredPlanResolver::new(storage.clone())),
            config.quota.clone(),
        ));

        Ok(Self {
            config,
            storage,
            identity,
            owner_id,
            store,
            quota,
        })
    }
}
