//! In-memory session list with optimistic persistence
//!
//! The store is the single owner of the session and message state shown to
//! the caller. Every mutation is applied locally first, then written to the
//! persistence collaborator; if the write fails the local change is reverted
//! through one shared snapshot/restore path. Mutations touching the same
//! session are serialized by a per-session async mutex.

use crate::error::{ChatflowError, Result};
use crate::providers::{HistoryMessage, TokenUsage};
use crate::storage::{ChatMessage, MessageStatus, Persistence, Role, Session};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// Number of characters of the first message used in a fork name
const FORK_NAME_CHARS: usize = 30;

#[derive(Debug, Default)]
struct StoreState {
    sessions: Vec<Session>,
    selection: HashSet<String>,
}

impl StoreState {
    fn position(&self, id: &str) -> Option<usize> {
        self.sessions.iter().position(|s| s.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut Session> {
        self.sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| ChatflowError::SessionNotFound(id.to_string()).into())
    }
}

/// How much of a session a failed mutation puts back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    /// Presence, position and contents, messages included
    Whole,
    /// Name, pinned flag and `updated_at`; messages are left as they are
    Header,
}

/// Pre-mutation copy of the sessions an operation touches
struct Snapshot {
    scope: Scope,
    entries: Vec<(String, Option<(usize, Session)>)>,
    selected: Vec<String>,
}

impl Snapshot {
    fn capture(state: &StoreState, ids: &[String], scope: Scope) -> Self {
        let entries = ids
            .iter()
            .map(|id| {
                let before = state
                    .position(id)
                    .map(|idx| (idx, state.sessions[idx].clone()));
                (id.clone(), before)
            })
            .collect();
        let selected = ids
            .iter()
            .filter(|id| state.selection.contains(*id))
            .cloned()
            .collect();
        Self {
            scope,
            entries,
            selected,
        }
    }

    fn restore(self, state: &mut StoreState) {
        if self.scope == Scope::Header {
            // Streamed content may have landed since the capture
            for (_, before) in self.entries {
                let Some((_, before)) = before else { continue };
                if let Ok(session) = state.get_mut(&before.id) {
                    session.name = before.name;
                    session.pinned = before.pinned;
                    session.updated_at = before.updated_at;
                }
            }
            return;
        }

        for (id, _) in &self.entries {
            state.sessions.retain(|s| &s.id != id);
        }

        let mut originals: Vec<(usize, Session)> =
            self.entries.into_iter().filter_map(|(_, e)| e).collect();
        originals.sort_by_key(|(idx, _)| *idx);
        for (idx, session) in originals {
            let at = idx.min(state.sessions.len());
            state.sessions.insert(at, session);
        }

        state.selection.extend(self.selected);
    }
}

/// Identifiers created when a turn starts
#[derive(Debug, Clone)]
pub struct TurnHandles {
    /// The stored user message
    pub user_message_id: String,
    /// The assistant placeholder receiving deltas
    pub assistant_message_id: String,
    /// Context sent to the provider, oldest first, excluding the new input
    pub history: Vec<HistoryMessage>,
}

/// Session list for one owner
///
/// # Examples
///
/// ```
/// use chatflow::chat::SessionStore;
/// use chatflow::storage::MemoryStorage;
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let store = SessionStore::new(Arc::new(MemoryStorage::new()), "owner-1", "Untitled Chat");
/// let id = store.create_session().await.unwrap();
/// assert_eq!(store.session(&id).await.unwrap().name, "Untitled Chat 1");
/// # });
/// ```
pub struct SessionStore {
    storage: Arc<dyn Persistence>,
    owner_id: String,
    default_session_name: String,
    state: RwLock<StoreState>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionStore {
    /// Create an empty store for `owner_id`
    pub fn new(
        storage: Arc<dyn Persistence>,
        owner_id: impl Into<String>,
        default_session_name: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            owner_id: owner_id.into(),
            default_session_name: default_session_name.into(),
            state: RwLock::new(StoreState::default()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Owner whose sessions this store holds
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Placeholder name prefix for new sessions
    pub fn default_session_name(&self) -> &str {
        &self.default_session_name
    }

    /// Replace the in-memory list with the owner's persisted sessions
    ///
    /// Returns the number of sessions loaded.
    pub async fn load(&self) -> Result<usize> {
        let sessions = self.storage.list_sessions(&self.owner_id).await?;
        let count = sessions.len();
        let mut state = self.state.write().await;
        state.sessions = sessions;
        state.selection.clear();
        tracing::debug!(owner_id = %self.owner_id, "Loaded {} sessions", count);
        Ok(count)
    }

    /// Snapshot of all sessions, most recently updated first
    pub async fn sessions(&self) -> Vec<Session> {
        self.state.read().await.sessions.clone()
    }

    /// Snapshot of one session
    pub async fn session(&self, id: &str) -> Option<Session> {
        let state = self.state.read().await;
        state.sessions.iter().find(|s| s.id == id).cloned()
    }

    /// Resolve a full session id from a unique prefix
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` when nothing matches and `Validation` when
    /// the prefix is ambiguous.
    pub async fn resolve_id(&self, prefix: &str) -> Result<String> {
        let prefix = prefix.trim();
        if prefix.is_empty() {
            return Err(ChatflowError::Validation("Session id must not be empty".into()).into());
        }

        let state = self.state.read().await;
        if state.sessions.iter().any(|s| s.id == prefix) {
            return Ok(prefix.to_string());
        }

        let matches: Vec<&Session> = state
            .sessions
            .iter()
            .filter(|s| s.id.starts_with(prefix))
            .collect();
        match matches.as_slice() {
            [] => Err(ChatflowError::SessionNotFound(prefix.to_string()).into()),
            [one] => Ok(one.id.clone()),
            many => Err(ChatflowError::Validation(format!(
                "Session id prefix '{}' is ambiguous ({} matches)",
                prefix,
                many.len()
            ))
            .into()),
        }
    }

    /// Apply `apply` locally, then run `persist`; revert the sessions named
    /// in `ids` to the extent of `scope` if either step fails
    async fn optimistic<V, T, A, P, Fut>(
        &self,
        ids: &[String],
        scope: Scope,
        apply: A,
        persist: P,
    ) -> Result<T>
    where
        A: FnOnce(&mut StoreState) -> Result<V>,
        P: FnOnce(V) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _guards = self.lock_sessions(ids).await;

        let (snapshot, value) = {
            let mut state = self.state.write().await;
            let snapshot = Snapshot::capture(&state, ids, scope);
            match apply(&mut state) {
                Ok(value) => (snapshot, value),
                Err(e) => {
                    snapshot.restore(&mut state);
                    return Err(e);
                }
            }
        };

        match persist(value).await {
            Ok(out) => Ok(out),
            Err(e) => {
                tracing::warn!(sessions = ?ids, "Persistence failed, reverting: {:#}", e);
                snapshot.restore(&mut *self.state.write().await);
                Err(e)
            }
        }
    }

    async fn lock_sessions(&self, ids: &[String]) -> Vec<OwnedMutexGuard<()>> {
        let mut sorted: Vec<&String> = ids.iter().collect();
        sorted.sort();
        sorted.dedup();

        let locks: Vec<Arc<Mutex<()>>> = {
            let mut map = self.locks.lock().await;
            sorted
                .into_iter()
                .map(|id| map.entry(id.clone()).or_default().clone())
                .collect()
        };

        let mut guards = Vec::with_capacity(locks.len());
        for lock in locks {
            guards.push(lock.lock_owned().await);
        }
        guards
    }

    async fn insert_new(&self, session: Session) -> Result<String> {
        let id = session.id.clone();
        let storage = self.storage.clone();
        let stored = session.clone();
        self.optimistic(
            std::slice::from_ref(&id),
            Scope::Whole,
            move |state| {
                state.sessions.insert(0, session);
                Ok(())
            },
            move |_| async move { storage.insert_session(&stored).await },
        )
        .await?;
        Ok(id)
    }

    /// Create an empty session named "{default name} N"
    pub async fn create_session(&self) -> Result<String> {
        let count = self.state.read().await.sessions.len();
        let name = format!("{} {}", self.default_session_name, count + 1);
        let session = Session::new(&self.owner_id, name, Utc::now());
        let id = self.insert_new(session).await?;
        tracing::info!(session_id = %id, "Created session");
        Ok(id)
    }

    /// Rename a session
    ///
    /// # Errors
    ///
    /// Returns `Validation` for a blank title and `SessionNotFound` for an
    /// unknown id. Persistence failures revert the rename.
    pub async fn rename(&self, session_id: &str, title: &str) -> Result<()> {
        let title = title.trim().to_string();
        if title.is_empty() {
            return Err(ChatflowError::Validation("Title must not be empty".into()).into());
        }

        let storage = self.storage.clone();
        self.optimistic(
            &[session_id.to_string()],
            Scope::Header,
            |state| {
                let session = state.get_mut(session_id)?;
                session.name = title;
                session.touch(Utc::now());
                Ok(session.header())
            },
            move |header| async move { storage.update_session(&header).await },
        )
        .await?;
        tracing::debug!(session_id = %session_id, "Renamed session");
        Ok(())
    }

    /// Flip the pinned flag, returning the new value
    pub async fn toggle_pin(&self, session_id: &str) -> Result<bool> {
        let storage = self.storage.clone();
        self.optimistic(
            &[session_id.to_string()],
            Scope::Header,
            |state| {
                let session = state.get_mut(session_id)?;
                session.pinned = !session.pinned;
                session.touch(Utc::now());
                Ok(session.header())
            },
            move |header| async move {
                storage.update_session(&header).await?;
                Ok(header.pinned)
            },
        )
        .await
    }

    /// Delete one session and all of its messages
    pub async fn delete(&self, session_id: &str) -> Result<()> {
        self.delete_many(&[session_id.to_string()]).await.map(|_| ())
    }

    /// Delete several sessions and their messages in one operation
    ///
    /// Unknown ids are ignored. Returns the ids that were deleted.
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` if none of the ids is known. If the store
    /// write fails nothing is removed, locally or remotely.
    pub async fn delete_many(&self, session_ids: &[String]) -> Result<Vec<String>> {
        let known: Vec<String> = {
            let state = self.state.read().await;
            session_ids
                .iter()
                .filter(|id| state.position(id).is_some())
                .cloned()
                .collect()
        };
        if known.is_empty() {
            return Err(ChatflowError::SessionNotFound(session_ids.join(", ")).into());
        }

        let storage = self.storage.clone();
        let targets = known.clone();
        self.optimistic(
            &known,
            Scope::Whole,
            |state| {
                state.sessions.retain(|s| !targets.contains(&s.id));
                for id in &targets {
                    state.selection.remove(id);
                }
                Ok(targets)
            },
            move |targets| async move { storage.delete_sessions(&targets).await },
        )
        .await?;

        let mut locks = self.locks.lock().await;
        for id in &known {
            locks.remove(id);
        }
        tracing::info!("Deleted {} sessions", known.len());
        Ok(known)
    }

    /// Deep-copy a session under a new id, named "{name} (copy)" and unpinned
    pub async fn duplicate(&self, session_id: &str) -> Result<String> {
        let source = self
            .session(session_id)
            .await
            .ok_or_else(|| ChatflowError::SessionNotFound(session_id.to_string()))?;

        let mut copy = Session::new(
            &self.owner_id,
            format!("{} (copy)", source.name),
            Utc::now(),
        );
        copy.messages = source
            .messages
            .iter()
            .map(|m| m.copy_into(&copy.id))
            .collect();

        let id = self.insert_new(copy).await?;
        tracing::info!(source = %session_id, session_id = %id, "Duplicated session");
        Ok(id)
    }

    /// Start a new session seeded with copies of `source_messages`
    ///
    /// Messages still streaming are copied as cancelled.
    ///
    /// # Errors
    ///
    /// Returns `Validation` when `source_messages` is empty
    pub async fn fork(&self, source_messages: &[ChatMessage]) -> Result<String> {
        let first = source_messages
            .first()
            .ok_or_else(|| ChatflowError::Validation("Cannot fork an empty conversation".into()))?;

        let preview: String = first.content.chars().take(FORK_NAME_CHARS).collect();
        let mut session = Session::new(
            &self.owner_id,
            format!("Fork of: {}...", preview),
            Utc::now(),
        );
        session.messages = source_messages
            .iter()
            .map(|m| {
                let mut copy = m.copy_into(&session.id);
                if copy.status == MessageStatus::Pending {
                    copy.status = MessageStatus::Cancelled;
                }
                copy
            })
            .collect();

        let id = self.insert_new(session).await?;
        tracing::info!(session_id = %id, "Forked {} messages", source_messages.len());
        Ok(id)
    }

    /// Fork the prefix of a session up to and including `message_id`
    pub async fn fork_at(&self, session_id: &str, message_id: &str) -> Result<String> {
        let source = self
            .session(session_id)
            .await
            .ok_or_else(|| ChatflowError::SessionNotFound(session_id.to_string()))?;
        let end = source
            .messages
            .iter()
            .position(|m| m.id == message_id)
            .ok_or_else(|| ChatflowError::MessageNotFound(message_id.to_string()))?;
        self.fork(&source.messages[..=end]).await
    }

    /// Toggle a session in the multi-select set; returns whether it is selected
    pub async fn toggle_selection(&self, session_id: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        if state.position(session_id).is_none() {
            return Err(ChatflowError::SessionNotFound(session_id.to_string()).into());
        }
        if state.selection.remove(session_id) {
            Ok(false)
        } else {
            state.selection.insert(session_id.to_string());
            Ok(true)
        }
    }

    /// Select every loaded session
    pub async fn select_all(&self) {
        let mut state = self.state.write().await;
        let ids: Vec<String> = state.sessions.iter().map(|s| s.id.clone()).collect();
        state.selection.extend(ids);
    }

    /// Empty the multi-select set
    pub async fn clear_selection(&self) {
        self.state.write().await.selection.clear();
    }

    /// Selected ids in list order
    pub async fn selected(&self) -> Vec<String> {
        let state = self.state.read().await;
        state
            .sessions
            .iter()
            .filter(|s| state.selection.contains(&s.id))
            .map(|s| s.id.clone())
            .collect()
    }

    /// The last `limit` messages usable as model context, oldest first
    ///
    /// Placeholders still streaming and errored replies are left out.
    pub async fn history(&self, session_id: &str, limit: usize) -> Result<Vec<HistoryMessage>> {
        let state = self.state.read().await;
        let session = state
            .sessions
            .iter()
            .find(|s| s.id == session_id)
            .ok_or_else(|| ChatflowError::SessionNotFound(session_id.to_string()))?;
        Ok(context_window(session, limit))
    }

    /// Count of assistant replies that completed in a session
    pub async fn completed_exchanges(&self, session_id: &str) -> usize {
        self.session(session_id)
            .await
            .map(|s| s.completed_exchanges())
            .unwrap_or(0)
    }

    /// Append the user message and an empty assistant placeholder
    ///
    /// Only the in-memory view changes; the pair is written when the turn
    /// is persisted.
    pub async fn begin_turn(
        &self,
        session_id: &str,
        input: &str,
        model: &str,
        history_limit: usize,
    ) -> Result<TurnHandles> {
        let _guards = self.lock_sessions(&[session_id.to_string()]).await;
        let mut state = self.state.write().await;
        let session = state.get_mut(session_id)?;

        let history = context_window(session, history_limit);
        let now = Utc::now();
        let user = ChatMessage::user(session_id, input, now);
        let placeholder = ChatMessage::assistant_placeholder(session_id, model, now);
        let handles = TurnHandles {
            user_message_id: user.id.clone(),
            assistant_message_id: placeholder.id.clone(),
            history,
        };

        session.messages.push(user);
        session.messages.push(placeholder);
        session.touch(now);
        Ok(handles)
    }

    /// Append a streamed fragment to a pending assistant message
    ///
    /// Returns the content accumulated so far.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the message has already been finalized
    pub async fn append_delta(
        &self,
        session_id: &str,
        message_id: &str,
        delta: &str,
    ) -> Result<String> {
        let mut state = self.state.write().await;
        let message = find_message(state.get_mut(session_id)?, message_id)?;
        if message.status != MessageStatus::Pending {
            return Err(ChatflowError::Validation(format!(
                "Message {} is no longer streaming",
                message_id
            ))
            .into());
        }
        message.content.push_str(delta);
        Ok(message.content.clone())
    }

    /// Close a pending assistant message
    ///
    /// `content` replaces the accumulated text when given. Usage is attached
    /// only to completed messages. A message that is no longer pending is
    /// left untouched.
    pub async fn finish_message(
        &self,
        session_id: &str,
        message_id: &str,
        status: MessageStatus,
        content: Option<String>,
        usage: Option<TokenUsage>,
    ) -> Result<ChatMessage> {
        let mut state = self.state.write().await;
        let session = state.get_mut(session_id)?;
        let message = find_message(session, message_id)?;
        if message.status == MessageStatus::Pending {
            message.status = status;
            if let Some(content) = content {
                message.content = content;
            }
            if status == MessageStatus::Complete {
                if let Some(usage) = usage {
                    message.prompt_tokens = Some(usage.prompt_tokens);
                    message.completion_tokens = Some(usage.completion_tokens);
                }
            }
        }
        let finished = message.clone();
        session.touch(Utc::now());
        Ok(finished)
    }

    /// Write the given messages and the session header to storage
    pub async fn persist_turn(&self, session_id: &str, message_ids: &[String]) -> Result<()> {
        let _guards = self.lock_sessions(&[session_id.to_string()]).await;
        let (messages, header) = {
            let state = self.state.read().await;
            let session = state
                .sessions
                .iter()
                .find(|s| s.id == session_id)
                .ok_or_else(|| ChatflowError::SessionNotFound(session_id.to_string()))?;
            let messages: Vec<ChatMessage> = session
                .messages
                .iter()
                .filter(|m| message_ids.contains(&m.id))
                .cloned()
                .collect();
            (messages, session.header())
        };

        self.storage.upsert_messages(&messages).await?;
        self.storage.update_session(&header).await?;
        tracing::debug!(session_id = %session_id, "Persisted {} messages", messages.len());
        Ok(())
    }
}

fn find_message<'a>(session: &'a mut Session, message_id: &str) -> Result<&'a mut ChatMessage> {
    session
        .messages
        .iter_mut()
        .find(|m| m.id == message_id)
        .ok_or_else(|| ChatflowError::MessageNotFound(message_id.to_string()).into())
}

fn context_window(session: &Session, limit: usize) -> Vec<HistoryMessage> {
    let usable: Vec<&ChatMessage> = session
        .messages
        .iter()
        .filter(|m| match m.status {
            MessageStatus::Complete => true,
            MessageStatus::Cancelled => m.role == Role::Assistant && !m.content.is_empty(),
            MessageStatus::Pending | MessageStatus::Errored => false,
        })
        .collect();
    let skip = usable.len().saturating_sub(limit);
    usable
        .into_iter()
        .skip(skip)
        .map(|m| HistoryMessage::new(m.role, m.content.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, StorageOp};
    use std::time::Duration;

    fn store_with(storage: Arc<MemoryStorage>) -> SessionStore {
        SessionStore::new(storage, "owner", "Untitled Chat")
    }

    async fn session_with_turns(store: &SessionStore, turns: usize) -> String {
        let id = store.create_session().await.expect("create");
        for i in 0..turns {
            let handles = store
                .begin_turn(&id, &format!("question {}", i), "m", 100)
                .await
                .expect("begin");
            store
                .append_delta(&id, &handles.assistant_message_id, &format!("answer {}", i))
                .await
                .expect("delta");
            store
                .finish_message(
                    &id,
                    &handles.assistant_message_id,
                    MessageStatus::Complete,
                    None,
                    None,
                )
                .await
                .expect("finish");
            store
                .persist_turn(
                    &id,
                    &[handles.user_message_id, handles.assistant_message_id],
                )
                .await
                .expect("persist");
        }
        id
    }

    #[tokio::test]
    async fn test_create_session_names_are_numbered() {
        let store = store_with(Arc::new(MemoryStorage::new()));
        let first = store.create_session().await.expect("create");
        let second = store.create_session().await.expect("create");

        let sessions = store.sessions().await;
        assert_eq!(sessions[0].id, second);
        assert_eq!(sessions[0].name, "Untitled Chat 2");
        assert_eq!(sessions[1].id, first);
        assert_eq!(sessions[1].name, "Untitled Chat 1");
    }

    #[tokio::test]
    async fn test_create_session_reverts_on_failure() {
        let storage = Arc::new(MemoryStorage::new());
        storage.fail_on(StorageOp::InsertSession).await;
        let store = store_with(storage.clone());

        assert!(store.create_session().await.is_err());
        assert!(store.sessions().await.is_empty());
        assert_eq!(storage.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_rename_persists_and_bumps_updated_at() {
        let storage = Arc::new(MemoryStorage::new());
        let store = store_with(storage.clone());
        let id = store.create_session().await.expect("create");
        let before = store.session(&id).await.expect("session").updated_at;

        store.rename(&id, "  Rust lifetimes  ").await.expect("rename");

        let session = store.session(&id).await.expect("session");
        assert_eq!(session.name, "Rust lifetimes");
        assert!(session.updated_at >= before);
        let stored = storage.get_session(&id).await.expect("get").expect("row");
        assert_eq!(stored.name, "Rust lifetimes");
    }

    #[tokio::test]
    async fn test_rename_rejects_blank_title() {
        let store = store_with(Arc::new(MemoryStorage::new()));
        let id = store.create_session().await.expect("create");
        let err = store.rename(&id, "   ").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ChatflowError>(),
            Some(ChatflowError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_toggle_pin_reverts_on_failure() {
        let storage = Arc::new(MemoryStorage::new());
        let store = store_with(storage.clone());
        let id = store.create_session().await.expect("create");

        storage.fail_on(StorageOp::UpdateSession).await;
        assert!(store.toggle_pin(&id).await.is_err());
        assert!(!store.session(&id).await.expect("session").pinned);

        storage.clear_failures().await;
        assert!(store.toggle_pin(&id).await.expect("toggle"));
        assert!(store.session(&id).await.expect("session").pinned);
    }

    #[tokio::test]
    async fn test_failed_pin_keeps_chunks_streamed_during_write() {
        let storage = Arc::new(MemoryStorage::new());
        let store = Arc::new(store_with(storage.clone()));
        let id = store.create_session().await.expect("create");
        let handles = store.begin_turn(&id, "hi", "m", 100).await.expect("begin");
        let reply = handles.assistant_message_id;
        store.append_delta(&id, &reply, "Hel").await.expect("delta");

        storage
            .delay_on(StorageOp::UpdateSession, Duration::from_millis(100))
            .await;
        storage.fail_on(StorageOp::UpdateSession).await;
        let pin = tokio::spawn({
            let store = store.clone();
            let id = id.clone();
            async move { store.toggle_pin(&id).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        store
            .append_delta(&id, &reply, "lo")
            .await
            .expect("delta during write");
        assert!(pin.await.expect("join").is_err());
        store.append_delta(&id, &reply, "!").await.expect("delta");

        let session = store.session(&id).await.expect("session");
        assert!(!session.pinned);
        let message = session
            .messages
            .iter()
            .find(|m| m.id == reply)
            .expect("reply");
        assert_eq!(message.content, "Hello!");
    }

    #[tokio::test]
    async fn test_delete_failure_keeps_session_and_position() {
        let storage = Arc::new(MemoryStorage::new());
        let store = store_with(storage.clone());
        let a = store.create_session().await.expect("create");
        let b = store.create_session().await.expect("create");
        let c = store.create_session().await.expect("create");
        store.toggle_selection(&b).await.expect("select");

        storage.fail_on(StorageOp::DeleteMessages).await;
        assert!(store.delete(&b).await.is_err());

        let order: Vec<String> = store.sessions().await.into_iter().map(|s| s.id).collect();
        assert_eq!(order, vec![c, b.clone(), a]);
        assert_eq!(store.selected().await, vec![b]);
        assert_eq!(storage.session_count().await, 3);
    }

    #[tokio::test]
    async fn test_delete_many_ignores_unknown_ids() {
        let store = store_with(Arc::new(MemoryStorage::new()));
        let a = store.create_session().await.expect("create");
        let b = store.create_session().await.expect("create");

        let deleted = store
            .delete_many(&[a.clone(), "missing".to_string()])
            .await
            .expect("delete");
        assert_eq!(deleted, vec![a]);
        assert_eq!(store.sessions().await.len(), 1);
        assert_eq!(store.sessions().await[0].id, b);

        assert!(store.delete_many(&["missing".to_string()]).await.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_copies_messages_with_new_ids() {
        let storage = Arc::new(MemoryStorage::new());
        let store = store_with(storage.clone());
        let id = session_with_turns(&store, 2).await;
        store.toggle_pin(&id).await.expect("pin");

        let copy_id = store.duplicate(&id).await.expect("duplicate");
        let original = store.session(&id).await.expect("original");
        let copy = store.session(&copy_id).await.expect("copy");

        assert_eq!(copy.name, format!("{} (copy)", original.name));
        assert!(!copy.pinned);
        assert_eq!(copy.messages.len(), 4);
        for (orig, dup) in original.messages.iter().zip(copy.messages.iter()) {
            assert_ne!(orig.id, dup.id);
            assert_eq!(orig.content, dup.content);
            assert_eq!(dup.session_id, copy_id);
        }
        let stored = storage.get_session(&copy_id).await.expect("get").expect("row");
        assert_eq!(stored.messages.len(), 4);
    }

    #[tokio::test]
    async fn test_fork_at_copies_prefix() {
        let store = store_with(Arc::new(MemoryStorage::new()));
        let id = session_with_turns(&store, 3).await;
        let source = store.session(&id).await.expect("session");
        let cut = source.messages[1].id.clone();

        let fork_id = store.fork_at(&id, &cut).await.expect("fork");
        let fork = store.session(&fork_id).await.expect("fork");
        assert_eq!(fork.name, "Fork of: question 0...");
        assert_eq!(fork.messages.len(), 2);
        assert_eq!(fork.messages[1].content, "answer 0");

        let err = store.fork_at(&id, "nope").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ChatflowError>(),
            Some(ChatflowError::MessageNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_fork_truncates_name_and_cancels_pending() {
        let store = store_with(Arc::new(MemoryStorage::new()));
        let id = store.create_session().await.expect("create");
        let long = "a".repeat(50);
        store.begin_turn(&id, &long, "m", 100).await.expect("begin");
        let messages = store.session(&id).await.expect("session").messages;

        let fork_id = store.fork(&messages).await.expect("fork");
        let fork = store.session(&fork_id).await.expect("fork");
        assert_eq!(fork.name, format!("Fork of: {}...", "a".repeat(30)));
        assert_eq!(fork.messages[1].status, MessageStatus::Cancelled);

        assert!(store.fork(&[]).await.is_err());
    }

    #[tokio::test]
    async fn test_history_is_bounded_and_ordered() {
        let store = store_with(Arc::new(MemoryStorage::new()));
        let id = session_with_turns(&store, 3).await;

        let history = store.history(&id, 3).await.expect("history");
        let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["answer 1", "question 2", "answer 2"]);
    }

    #[tokio::test]
    async fn test_append_delta_only_while_pending() {
        let store = store_with(Arc::new(MemoryStorage::new()));
        let id = store.create_session().await.expect("create");
        let handles = store.begin_turn(&id, "hi", "m", 10).await.expect("begin");
        let msg = handles.assistant_message_id;

        assert_eq!(store.append_delta(&id, &msg, "He").await.expect("delta"), "He");
        assert_eq!(store.append_delta(&id, &msg, "y").await.expect("delta"), "Hey");
        store
            .finish_message(&id, &msg, MessageStatus::Complete, None, Some(TokenUsage::new(3, 1)))
            .await
            .expect("finish");
        assert!(store.append_delta(&id, &msg, "!").await.is_err());

        let session = store.session(&id).await.expect("session");
        let finished = &session.messages[1];
        assert_eq!(finished.content, "Hey");
        assert_eq!(finished.prompt_tokens, Some(3));
        assert_eq!(finished.completion_tokens, Some(1));
    }

    #[tokio::test]
    async fn test_resolve_id_by_prefix() {
        let store = store_with(Arc::new(MemoryStorage::new()));
        let id = store.create_session().await.expect("create");
        assert_eq!(store.resolve_id(&id[..8]).await.expect("resolve"), id);
        assert!(store.resolve_id("zzzzzzzz").await.is_err());
    }

    #[tokio::test]
    async fn test_selection_helpers() {
        let store = store_with(Arc::new(MemoryStorage::new()));
        let a = store.create_session().await.expect("create");
        let b = store.create_session().await.expect("create");

        store.select_all().await;
        assert_eq!(store.selected().await, vec![b.clone(), a.clone()]);
        assert!(!store.toggle_selection(&a).await.expect("toggle"));
        assert_eq!(store.selected().await, vec![b.clone()]);

        store.delete(&b).await.expect("delete");
        assert!(store.selected().await.is_empty());

        store.toggle_selection(&a).await.expect("toggle");
        store.clear_selection().await;
        assert!(store.selected().await.is_empty());
    }

    #[tokio::test]
    async fn test_load_hydrates_from_storage() {
        let storage = Arc::new(MemoryStorage::new());
        let writer = store_with(storage.clone());
        let id = session_with_turns(&writer, 1).await;

        let reader = store_with(storage);
        assert_eq!(reader.load().await.expect("load"), 1);
        let session = reader.session(&id).await.expect("session");
        assert_eq!(session.messages.len(), 2);
    }
}
