//! Usage quota gate
//!
//! Decides whether an owner may start another turn, based on resettable
//! daily and monthly counters and the limits of the owner's plan.
//!
//! Counters reset lazily: a check that observes a new calendar day (or
//! month) zeroes the counter and persists the reset before evaluating.
//! Calendar boundaries are evaluated in UTC.

use crate::billing::{PlanResolver, PlanTier, QuotaLimit};
use crate::config::QuotaConfig;
use crate::error::{ChatflowError, Result};
use crate::storage::{Persistence, QuotaState, UsagePeriod};
use chrono::{DateTime, Datelike, Utc};
use std::fmt;
use std::sync::Arc;

/// Notice shown when the daily allowance is used up
pub const DAILY_LIMIT_NOTICE: &str =
    "You have reached your daily message limit. Please try again tomorrow or upgrade your plan.";

/// Notice shown when the monthly allowance is used up
pub const MONTHLY_LIMIT_NOTICE: &str =
    "You have reached your monthly message limit. Please upgrade your plan to continue.";

/// Why a check denied the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDenial {
    /// Daily limit reached
    DailyExceeded,
    /// Monthly limit reached
    MonthlyExceeded,
}

impl QuotaDenial {
    /// User-facing notice for this denial
    pub fn notice(&self) -> &'static str {
        match self {
            QuotaDenial::DailyExceeded => DAILY_LIMIT_NOTICE,
            QuotaDenial::MonthlyExceeded => MONTHLY_LIMIT_NOTICE,
        }
    }
}

impl fmt::Display for QuotaDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaDenial::DailyExceeded => f.write_str("DAILY_EXCEEDED"),
            QuotaDenial::MonthlyExceeded => f.write_str("MONTHLY_EXCEEDED"),
        }
    }
}

/// Outcome of a quota check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaDecision {
    /// Whether a new turn may start
    pub allowed: bool,
    /// Set when `allowed` is false; monthly takes precedence when both apply
    pub reason: Option<QuotaDenial>,
    /// Turns left today; `None` when the plan has no daily cap
    pub remaining_daily: Option<u32>,
    /// Turns left this month
    pub remaining_monthly: u32,
    /// Plan the limits were taken from
    pub plan: PlanTier,
}

/// Whether `now` falls on a different calendar day than `last`
pub fn crosses_day(last: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    last.date_naive() != now.date_naive()
}

/// Whether `now` falls in a different calendar month (or year) than `last`
pub fn crosses_month(last: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    last.year() != now.year() || last.month() != now.month()
}

/// Evaluate counters against a limit
///
/// # Examples
///
/// ```
/// use chatflow::billing::{PlanTier, QuotaLimit};
/// use chatflow::chat::quota::{evaluate, QuotaDenial};
///
/// let limit = QuotaLimit { monthly_limit: 100, daily_limit: Some(20) };
/// let decision = evaluate(20, 40, limit, PlanTier::Free);
/// assert!(!decision.allowed);
/// assert_eq!(decision.reason, Some(QuotaDenial::DailyExceeded));
/// assert_eq!(decision.remaining_monthly, 60);
/// ```
pub fn evaluate(day_usage: u32, month_usage: u32, limit: QuotaLimit, plan: PlanTier) -> QuotaDecision {
    let daily_ok = limit.daily_limit.map_or(true, |cap| day_usage < cap);
    let monthly_ok = month_usage < limit.monthly_limit;

    let reason = if !monthly_ok {
        Some(QuotaDenial::MonthlyExceeded)
    } else if !daily_ok {
        Some(QuotaDenial::DailyExceeded)
    } else {
        None
    };

    QuotaDecision {
        allowed: daily_ok && monthly_ok,
        reason,
        remaining_daily: limit.daily_limit.map(|cap| cap.saturating_sub(day_usage)),
        remaining_monthly: limit.monthly_limit.saturating_sub(month_usage),
        plan,
    }
}

/// Gate consulted before every turn
pub struct QuotaGate {
    storage: Arc<dyn Persistence>,
    plans: Arc<dyn PlanResolver>,
    limits: QuotaConfig,
}

impl QuotaGate {
    /// Create a gate over the given store, plan resolver and tier limits
    pub fn new(
        storage: Arc<dyn Persistence>,
        plans: Arc<dyn PlanResolver>,
        limits: QuotaConfig,
    ) -> Self {
        Self {
            storage,
            plans,
            limits,
        }
    }

    /// Check the owner's quota at the current time
    ///
    /// # Errors
    ///
    /// Returns [`ChatflowError::QuotaUnavailable`] if the backing store or the
    /// plan lookup fails. Callers must treat this as a denial.
    pub async fn check_quota(&self, owner_id: &str) -> Result<QuotaDecision> {
        self.check_quota_at(owner_id, Utc::now()).await
    }

    /// Check the owner's quota as of `now`
    ///
    /// Repeated checks without an increment return the same decision.
    ///
    /// # Errors
    ///
    /// Returns [`ChatflowError::QuotaUnavailable`] on infrastructure failure
    pub async fn check_quota_at(&self, owner_id: &str, now: DateTime<Utc>) -> Result<QuotaDecision> {
        let state = self
            .current_state(owner_id, now)
            .await
            .map_err(|e| unavailable(owner_id, e))?;

        let plan = self
            .plans
            .plan_for(owner_id)
            .await
            .map_err(|e| unavailable(owner_id, e))?;

        let decision = evaluate(
            state.current_day_usage,
            state.current_month_usage,
            self.limits.limit_for(plan),
            plan,
        );

        if let Some(reason) = decision.reason {
            tracing::info!(owner_id = %owner_id, %reason, "Quota check denied");
        } else {
            tracing::debug!(
                owner_id = %owner_id,
                remaining_monthly = decision.remaining_monthly,
                "Quota check allowed"
            );
        }

        Ok(decision)
    }

    /// Load the owner's counters, creating and resetting them as needed
    ///
    /// Resets only apply if the stored stamp is still the one this call
    /// observed; the counters are then re-read so increments made by a
    /// concurrent turn are not lost.
    async fn current_state(&self, owner_id: &str, now: DateTime<Utc>) -> Result<QuotaState> {
        let state = match self.storage.load_quota(owner_id).await? {
            Some(state) => state,
            None => self.storage.init_quota(owner_id, now).await?,
        };

        let mut reset = false;
        if crosses_day(state.last_day_reset, now) {
            let applied = self
                .storage
                .reset_usage(owner_id, UsagePeriod::Day, state.last_day_reset, now)
                .await?;
            tracing::debug!(owner_id = %owner_id, applied, "Reset daily usage");
            reset = true;
        }

        if crosses_month(state.last_month_reset, now) {
            let applied = self
                .storage
                .reset_usage(owner_id, UsagePeriod::Month, state.last_month_reset, now)
                .await?;
            tracing::debug!(owner_id = %owner_id, applied, "Reset monthly usage");
            reset = true;
        }

        if !reset {
            return Ok(state);
        }
        self.storage.load_quota(owner_id).await?.ok_or_else(|| {
            ChatflowError::Storage(format!("Quota record for {} disappeared", owner_id)).into()
        })
    }

    /// Record one completed turn
    ///
    /// Call exactly once per successfully finalized assistant turn.
    ///
    /// # Errors
    ///
    /// Returns error if the counter cannot be written
    pub async fn increment_usage(&self, owner_id: &str) -> Result<()> {
        self.storage.increment_usage(owner_id).await
    }

    /// Current counters after applying any pending resets
    pub async fn usage(&self, owner_id: &str) -> Result<QuotaState> {
        self.current_state(owner_id, Utc::now())
            .await
            .map_err(|e| unavailable(owner_id, e))
    }

    /// Change the owner's plan
    pub async fn set_plan(&self, owner_id: &str, plan: PlanTier) -> Result<()> {
        self.storage.set_plan(owner_id, plan).await?;
        tracing::info!(owner_id = %owner_id, %plan, "Plan updated");
        Ok(())
    }
}

fn unavailable(owner_id: &str, e: anyhow::Error) -> anyhow::Error {
    tracing::error!(owner_id = %owner_id, "Quota check failed: {:#}", e);
    ChatflowError::QuotaUnavailable(e.to_string()).into()
}
