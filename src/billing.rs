//! Subscription plans and the billing collaborator
//!
//! Plan state is pushed by an external payment provider; this module only
//! reads the resolved tier and maps it to usage limits.

use crate::error::Result;
use crate::storage::Persistence;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Subscription tier of an owner
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    /// Default tier with daily and monthly caps
    #[default]
    Free,
    /// Paid tier with a monthly cap only
    Pro,
}

impl PlanTier {
    /// Stable identifier used in storage
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Pro => "pro",
        }
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanTier {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(PlanTier::Free),
            "pro" => Ok(PlanTier::Pro),
            other => Err(format!("Unknown plan tier: {}", other)),
        }
    }
}

/// Usage caps for a tier
///
/// A `daily_limit` of `None` means unlimited daily usage; the monthly
/// limit still applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimit {
    /// Maximum completed turns per calendar month
    pub monthly_limit: u32,
    /// Maximum completed turns per calendar day
    #[serde(default)]
    pub daily_limit: Option<u32>,
}

/// Resolves the subscription tier of an owner
#[async_trait]
pub trait PlanResolver: Send + Sync {
    /// Return the current plan of `owner_id`
    ///
    /// # Errors
    ///
    /// Returns error if the plan record cannot be read
    async fn plan_for(&self, owner_id: &str) -> Result<PlanTier>;
}

/// Reads the plan recorded on the owner's quota row
///
/// Owners without a quota row are on the free tier.
pub struct StoredPlanResolver {
    storage: Arc<dyn Persistence>,
}

impl StoredPlanResolver {
    /// Create a resolver over the given persistence backend
    pub fn new(storage: Arc<dyn Persistence>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl PlanResolver for StoredPlanResolver {
    async fn plan_for(&self, owner_id: &str) -> Result<PlanTier> {
        let state = self.storage.load_quota(owner_id).await?;
        Ok(state.map(|s| s.plan).unwrap_or_default())
    }
}

/// Always resolves to the same tier
#[derive(Debug, Clone, Copy)]
pub struct FixedPlanResolver(pub PlanTier);

#[async_trait]
impl PlanResolver for FixedPlanResolver {
    async fn plan_for(&self, _owner_id: &str) -> Result<PlanTier> {
        Ok(self.0)
    }
}
