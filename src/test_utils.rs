//! Test utilities for Chatflow
//!
//! Temporary directories, error assertions and pre-wired in-memory
//! collaborators shared by the unit tests.

use crate::billing::{FixedPlanResolver, PlanTier};
use crate::chat::{QuotaGate, SessionStore};
use crate::config::{Config, QuotaConfig};
use crate::error::ChatflowError;
use crate::storage::MemoryStorage;
use std::sync::Arc;
use tempfile::TempDir;

/// Owner id used by the in-memory fixtures
pub const TEST_OWNER: &str = "owner-1";

/// Create a temporary directory for testing
///
/// The directory is removed when the returned handle is dropped.
pub fn temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temporary directory")
}

/// Assert that a result failed with a message containing `expected`
///
/// # Panics
///
/// Panics if the result is Ok or if the error doesn't contain the expected message
pub fn assert_error_contains<T>(result: anyhow::Result<T>, expected: &str) {
    match result {
        Ok(_) => panic!("Expected error containing '{}' but got Ok", expected),
        Err(e) => {
            let error_msg = format!("{:#}", e);
            assert!(
                error_msg.contains(expected),
                "Error message '{}' does not contain '{}'",
                error_msg,
                expected
            );
        }
    }
}

/// Extract the domain error from an `anyhow` result, panicking on Ok
pub fn domain_error<T: std::fmt::Debug>(result: anyhow::Result<T>) -> ChatflowError {
    let err = result.expect_err("expected an error");
    match err.downcast::<ChatflowError>() {
        Ok(e) => e,
        Err(other) => panic!("expected a ChatflowError, got: {:#}", other),
    }
}

/// Create a test configuration with default values
pub fn test_config() -> Config {
    Config::default()
}

/// In-memory storage with a session store already loaded for [`TEST_OWNER`]
pub async fn memory_store() -> (Arc<MemoryStorage>, Arc<SessionStore>) {
    let storage = Arc::new(MemoryStorage::new());
    let store = Arc::new(SessionStore::new(storage.clone(), TEST_OWNER, "Chat"));
    store.load().await.expect("load store");
    (storage, store)
}

/// Quota gate over `storage` with a fixed plan
pub fn quota_gate(storage: Arc<MemoryStorage>, plan: PlanTier, limits: QuotaConfig) -> QuotaGate {
    QuotaGate::new(storage, Arc::new(FixedPlanResolver(plan)), limits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_dir_creation() {
        let dir = temp_dir();
        assert!(dir.path().exists());
    }

    #[test]
    fn test_assert_error_contains_success() {
        let result: anyhow::Result<()> =
            Err(ChatflowError::Config("test error message".to_string()).into());
        assert_error_contains(result, "test error");
    }

    #[test]
    #[should_panic(expected = "Expected error containing")]
    fn test_assert_error_contains_ok() {
        let result: anyhow::Result<()> = Ok(());
        assert_error_contains(result, "error");
    }

    #[test]
    fn test_domain_error_downcasts() {
        let result: anyhow::Result<()> =
            Err(ChatflowError::SessionNotFound("abc".to_string()).into());
        assert!(matches!(
            domain_error(result),
            ChatflowError::SessionNotFound(id) if id == "abc"
        ));
    }

    #[test]
    fn test_test_config() {
        let config = test_config();
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_memory_store_starts_empty() {
        let (storage, store) = memory_store().await;
        assert!(store.sessions().await.is_empty());
        assert_eq!(storage.session_count().await, 0);
        assert_eq!(store.owner_id(), TEST_OWNER);
    }

    #[tokio::test]
    async fn test_quota_gate_uses_fixed_plan() {
        let (storage, _store) = memory_store().await;
        let gate = quota_gate(storage, PlanTier::Pro, QuotaConfig::default());
        let decision = gate.check_quota(TEST_OWNER).await.expect("check");
        assert!(decision.allowed);
        assert_eq!(decision.plan, PlanTier::Pro);
    }
}
