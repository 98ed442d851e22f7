//! Caller identity
//!
//! Authentication is delegated to an external identity provider. The chat
//! core only asks who the caller is.

use crate::error::{ChatflowError, Result};
use async_trait::async_trait;

/// Resolves the id of the authenticated caller
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Return the current owner id
    ///
    /// # Errors
    ///
    /// Returns [`ChatflowError::Unauthorized`] when no caller is signed in
    async fn current_owner_id(&self) -> Result<String>;
}

/// Identity fixed at construction time, used by the CLI
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    owner_id: Option<String>,
}

impl StaticIdentity {
    /// Identity that always resolves to `owner_id`
    ///
    /// # Examples
    ///
    /// ```
    /// use chatflow::identity::{IdentityProvider, StaticIdentity};
    ///
    /// # tokio_test::block_on(async {
    /// let identity = StaticIdentity::new("alice");
    /// assert_eq!(identity.current_owner_id().await.unwrap(), "alice");
    /// # });
    /// ```
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: Some(owner_id.into()),
        }
    }

    /// Identity with no signed-in caller
    pub fn anonymous() -> Self {
        Self { owner_id: None }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn current_owner_id(&self) -> Result<String> {
        match &self.owner_id {
            Some(id) if !id.trim().is_empty() => Ok(id.clone()),
            _ => Err(ChatflowError::Unauthorized("no signed-in caller".to_string()).into()),
        }
    }
}
