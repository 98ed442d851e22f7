//! In-process persistence backend
//!
//! Keeps everything behind a single async mutex, which makes every
//! operation atomic. Individual operations can be made to fail or to stall
//! so callers can exercise their rollback paths and interleavings.

use super::{ChatMessage, Persistence, QuotaState, Session, UsagePeriod};
use crate::billing::PlanTier;
use crate::error::{ChatflowError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::Mutex;

/// Operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageOp {
    /// [`Persistence::insert_session`]
    InsertSession,
    /// [`Persistence::get_session`] and [`Persistence::list_sessions`]
    ReadSessions,
    /// [`Persistence::update_session`]
    UpdateSession,
    /// The message half of [`Persistence::delete_sessions`]
    DeleteMessages,
    /// The session half of [`Persistence::delete_sessions`]
    DeleteSessions,
    /// [`Persistence::upsert_messages`]
    UpsertMessages,
    /// Every quota operation
    Quota,
    /// [`Persistence::increment_usage`] only
    IncrementUsage,
}

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<String, Session>,
    messages: Vec<ChatMessage>,
    quotas: HashMap<String, QuotaState>,
    failing: HashSet<StorageOp>,
    delays: HashMap<StorageOp, Duration>,
    increment_calls: usize,
}

impl MemoryState {
    fn check(&self, op: StorageOp) -> Result<()> {
        if self.failing.contains(&op) {
            return Err(ChatflowError::Storage(format!("injected failure: {:?}", op)).into());
        }
        Ok(())
    }

    fn assemble(&self, header: &Session) -> Session {
        let mut session = header.clone();
        session.messages = self
            .messages
            .iter()
            .filter(|m| m.session_id == header.id)
            .cloned()
            .collect();
        session
    }

    fn upsert(&mut self, message: &ChatMessage) {
        match self.messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message.clone(),
            None => self.messages.push(message.clone()),
        }
    }
}

/// Persistence backend held entirely in memory
#[derive(Default)]
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
}

impl MemoryStorage {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `op` fail until [`MemoryStorage::clear_failures`] is called
    pub async fn fail_on(&self, op: StorageOp) {
        self.state.lock().await.failing.insert(op);
    }

    /// Stop injecting failures
    pub async fn clear_failures(&self) {
        self.state.lock().await.failing.clear();
    }

    /// Sleep for `delay` before running `op`
    ///
    /// The store stays available to other callers while the operation waits.
    pub async fn delay_on(&self, op: StorageOp, delay: Duration) {
        self.state.lock().await.delays.insert(op, delay);
    }

    async fn pause(&self, op: StorageOp) {
        let delay = self.state.lock().await.delays.get(&op).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    /// Number of stored sessions
    pub async fn session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    /// Number of stored messages across all sessions
    pub async fn message_count(&self) -> usize {
        self.state.lock().await.messages.len()
    }

    /// Number of successful usage increments
    pub async fn increment_calls(&self) -> usize {
        self.state.lock().await.increment_calls
    }
}

#[async_trait]
impl Persistence for MemoryStorage {
    async fn insert_session(&self, session: &Session) -> Result<()> {
        self.pause(StorageOp::InsertSession).await;
        let mut state = self.state.lock().await;
        state.check(StorageOp::InsertSession)?;
        if state.sessions.contains_key(&session.id) {
            return Err(
                ChatflowError::Storage(format!("Session {} already exists", session.id)).into(),
            );
        }
        state.sessions.insert(session.id.clone(), session.header());
        for message in &session.messages {
            state.upsert(message);
        }
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let state = self.state.lock().await;
        state.check(StorageOp::ReadSessions)?;
        Ok(state.sessions.get(id).map(|h| state.assemble(h)))
    }

    async fn list_sessions(&self, owner_id: &str) -> Result<Vec<Session>> {
        let state = self.state.lock().await;
        state.check(StorageOp::ReadSessions)?;
        let mut sessions: Vec<Session> = state
            .sessions
            .values()
            .filter(|s| s.owner_id == owner_id)
            .map(|h| state.assemble(h))
            .collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    async fn update_session(&self, session: &Session) -> Result<()> {
        self.pause(StorageOp::UpdateSession).await;
        let mut state = self.state.lock().await;
        state.check(StorageOp::UpdateSession)?;
        match state.sessions.get_mut(&session.id) {
            Some(stored) => {
                stored.name = session.name.clone();
                stored.pinned = session.pinned;
                stored.updated_at = session.updated_at;
                Ok(())
            }
            None => Err(ChatflowError::SessionNotFound(session.id.clone()).into()),
        }
    }

    async fn delete_sessions(&self, ids: &[String]) -> Result<()> {
        self.pause(StorageOp::DeleteSessions).await;
        let mut state = self.state.lock().await;
        // Both halves are checked before anything is removed.
        state.check(StorageOp::DeleteMessages)?;
        state.check(StorageOp::DeleteSessions)?;
        let doomed: HashSet<&String> = ids.iter().collect();
        state.messages.retain(|m| !doomed.contains(&m.session_id));
        state.sessions.retain(|id, _| !doomed.contains(id));
        Ok(())
    }

    async fn upsert_messages(&self, messages: &[ChatMessage]) -> Result<()> {
        self.pause(StorageOp::UpsertMessages).await;
        let mut state = self.state.lock().await;
        state.check(StorageOp::UpsertMessages)?;
        if let Some(orphan) = messages
            .iter()
            .find(|m| !state.sessions.contains_key(&m.session_id))
        {
            return Err(ChatflowError::SessionNotFound(orphan.session_id.clone()).into());
        }
        for message in messages {
            state.upsert(message);
        }
        Ok(())
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        let state = self.state.lock().await;
        state.check(StorageOp::ReadSessions)?;
        Ok(state
            .messages
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn load_quota(&self, owner_id: &str) -> Result<Option<QuotaState>> {
        self.pause(StorageOp::Quota).await;
        let state = self.state.lock().await;
        state.check(StorageOp::Quota)?;
        Ok(state.quotas.get(owner_id).cloned())
    }

    async fn init_quota(&self, owner_id: &str, now: DateTime<Utc>) -> Result<QuotaState> {
        let mut state = self.state.lock().await;
        state.check(StorageOp::Quota)?;
        Ok(state
            .quotas
            .entry(owner_id.to_string())
            .or_insert_with(|| QuotaState::new(owner_id, now))
            .clone())
    }

    async fn reset_usage(
        &self,
        owner_id: &str,
        period: UsagePeriod,
        observed: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        self.pause(StorageOp::Quota).await;
        let mut state = self.state.lock().await;
        state.check(StorageOp::Quota)?;
        let Some(quota) = state.quotas.get_mut(owner_id) else {
            return Ok(false);
        };
        let (usage, stamp) = match period {
            UsagePeriod::Day => (&mut quota.current_day_usage, &mut quota.last_day_reset),
            UsagePeriod::Month => (&mut quota.current_month_usage, &mut quota.last_month_reset),
        };
        if *stamp != observed {
            return Ok(false);
        }
        *usage = 0;
        *stamp = at;
        Ok(true)
    }

    async fn increment_usage(&self, owner_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check(StorageOp::Quota)?;
        state.check(StorageOp::IncrementUsage)?;
        let quota = state.quotas.get_mut(owner_id).ok_or_else(|| {
            ChatflowError::Storage(format!("No quota record for owner {}", owner_id))
        })?;
        quota.current_day_usage += 1;
        quota.current_month_usage += 1;
        state.increment_calls += 1;
        Ok(())
    }

    async fn set_plan(&self, owner_id: &str, plan: PlanTier) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check(StorageOp::Quota)?;
        state
            .quotas
            .entry(owner_id.to_string())
            .or_insert_with(|| QuotaState::new(owner_id, Utc::now()))
            .plan = plan;
        Ok(())
    }
}
