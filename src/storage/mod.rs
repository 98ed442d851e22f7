use crate::billing::PlanTier;
use crate::error::{ChatflowError, Result};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod memory;
pub mod types;
pub use memory::{MemoryStorage, StorageOp};
pub use types::{ChatMessage, MessageStatus, QuotaState, Role, Session, UsagePeriod};

/// Persistence collaborator for sessions, messages and quota counters
///
/// Implementations must make [`Persistence::insert_session`] and
/// [`Persistence::delete_sessions`] all-or-nothing, and
/// [`Persistence::increment_usage`] an atomic read-modify-write.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Insert a session together with its messages
    async fn insert_session(&self, session: &Session) -> Result<()>;

    /// Load a session and its messages
    async fn get_session(&self, id: &str) -> Result<Option<Session>>;

    /// All sessions of an owner with their messages, most recently updated first
    async fn list_sessions(&self, owner_id: &str) -> Result<Vec<Session>>;

    /// Write name, pinned flag and `updated_at`
    ///
    /// # Errors
    ///
    /// Returns [`ChatflowError::SessionNotFound`] if no row matches
    async fn update_session(&self, session: &Session) -> Result<()>;

    /// Delete sessions and all of their messages as one operation
    async fn delete_sessions(&self, ids: &[String]) -> Result<()>;

    /// Insert messages, or overwrite content and metadata of existing ids
    ///
    /// Existing messages keep their original position.
    async fn upsert_messages(&self, messages: &[ChatMessage]) -> Result<()>;

    /// Messages of a session in insertion order
    async fn list_messages(&self, session_id: &str) -> Result<Vec<ChatMessage>>;

    /// Quota counters of an owner, if any were recorded
    async fn load_quota(&self, owner_id: &str) -> Result<Option<QuotaState>>;

    /// Create zeroed counters unless a record already exists; returns the stored record
    async fn init_quota(&self, owner_id: &str, now: DateTime<Utc>) -> Result<QuotaState>;

    /// Zero one counter and stamp its reset time, provided its current
    /// reset stamp still equals `observed`
    ///
    /// Returns `false` when another caller reset the counter first; the
    /// stored record is left untouched in that case.
    async fn reset_usage(
        &self,
        owner_id: &str,
        period: UsagePeriod,
        observed: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Atomically add one to both counters
    async fn increment_usage(&self, owner_id: &str) -> Result<()>;

    /// Record the subscription tier of an owner
    async fn set_plan(&self, owner_id: &str, plan: PlanTier) -> Result<()>;
}

/// SQLite storage backend for sessions, messages and quota counters
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    db_path: PathBuf,
}

impl SqliteStorage {
    /// Create a new storage instance
    ///
    /// Initializes the database file in the user's data directory.
    pub fn new() -> Result<Self> {
        if let Ok(override_path) = std::env::var("CHATFLOW_DB") {
            return Self::new_with_path(override_path);
        }

        let proj_dirs = ProjectDirs::from("com", "chatflow", "chatflow")
            .ok_or_else(|| ChatflowError::Storage("Could not determine data directory".into()))?;

        let data_dir = proj_dirs.data_dir();
        std::fs::create_dir_all(data_dir)
            .context("Failed to create data directory")
            .map_err(|e| ChatflowError::Storage(e.to_string()))?;

        Self::new_with_path(data_dir.join("sessions.db"))
    }

    /// Create a new storage instance that uses the specified database path.
    ///
    /// # Examples
    ///
    /// ```
    /// use chatflow::storage::SqliteStorage;
    ///
    /// let dir = tempfile::tempdir().unwrap();
    /// let storage = SqliteStorage::new_with_path(dir.path().join("sessions.db")).unwrap();
    /// ```
    pub fn new_with_path<P: Into<PathBuf>>(db_path: P) -> Result<Self> {
        let db_path = db_path.into();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .context("Failed to create parent directory for database")
                .map_err(|e| ChatflowError::Storage(e.to_string()))?;
        }

        let storage = Self { db_path };
        storage.init()?;
        Ok(storage)
    }

    /// Open storage at the configured path, or the default location
    pub fn open(path: Option<&str>) -> Result<Self> {
        match path {
            Some(p) => Self::new_with_path(p),
            None => Self::new(),
        }
    }

    /// Location of the database file
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn init(&self) -> Result<()> {
        let conn = open_connection(&self.db_path)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                pinned INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_owner ON sessions(owner_id);
            CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                session_id TEXT NOT NULL REFERENCES sessions(id),
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                model TEXT,
                created_at TEXT NOT NULL,
                prompt_tokens INTEGER,
                completion_tokens INTEGER,
                status TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);
            CREATE TABLE IF NOT EXISTS quotas (
                owner_id TEXT PRIMARY KEY,
                plan TEXT NOT NULL,
                current_day_usage INTEGER NOT NULL DEFAULT 0,
                current_month_usage INTEGER NOT NULL DEFAULT 0,
                last_day_reset TEXT NOT NULL,
                last_month_reset TEXT NOT NULL
            );",
        )
        .context("Failed to create tables")
        .map_err(|e| ChatflowError::Storage(e.to_string()))?;

        Ok(())
    }

    /// Run a blocking database operation on the blocking thread pool
    async fn with_conn<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = open_connection(&db_path)?;
            op(&mut conn)
        })
        .await
        .map_err(|e| ChatflowError::Storage(format!("Storage task failed: {}", e)))?
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .context("Failed to open database")
        .map_err(|e| ChatflowError::Storage(e.to_string()))?;
    conn.busy_timeout(Duration::from_secs(5))
        .map_err(|e| ChatflowError::Storage(e.to_string()))?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")
        .map_err(|e| ChatflowError::Storage(e.to_string()))?;
    Ok(conn)
}

fn storage_err(context: &str, e: rusqlite::Error) -> anyhow::Error {
    ChatflowError::Storage(format!("{}: {}", context, e)).into()
}

fn sql_placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

impl ToSql for Role {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Role {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

impl ToSql for MessageStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for MessageStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

impl ToSql for PlanTier {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for PlanTier {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

const SESSION_COLUMNS: &str = "id, owner_id, name, pinned, created_at, updated_at";
const MESSAGE_COLUMNS: &str =
    "id, session_id, role, content, model, created_at, prompt_tokens, completion_tokens, status";
const QUOTA_COLUMNS: &str = "owner_id, plan, current_day_usage, current_month_usage, last_day_reset, last_month_reset";

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        pinned: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
        messages: Vec::new(),
    })
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<ChatMessage> {
    Ok(ChatMessage {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: row.get(2)?,
        content: row.get(3)?,
        model: row.get(4)?,
        created_at: row.get(5)?,
        prompt_tokens: row.get(6)?,
        completion_tokens: row.get(7)?,
        status: row.get(8)?,
    })
}

fn row_to_quota(row: &Row<'_>) -> rusqlite::Result<QuotaState> {
    Ok(QuotaState {
        owner_id: row.get(0)?,
        plan: row.get(1)?,
        current_day_usage: row.get(2)?,
        current_month_usage: row.get(3)?,
        last_day_reset: row.get(4)?,
        last_month_reset: row.get(5)?,
    })
}

fn query_messages(conn: &Connection, session_id: &str) -> Result<Vec<ChatMessage>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM messages WHERE session_id = ? ORDER BY seq",
            MESSAGE_COLUMNS
        ))
        .map_err(|e| storage_err("Failed to prepare statement", e))?;
    let rows = stmt
        .query_map(params![session_id], row_to_message)
        .map_err(|e| storage_err("Failed to query messages", e))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| storage_err("Failed to read message row", e))
}

fn upsert_message_rows(tx: &rusqlite::Transaction<'_>, messages: &[ChatMessage]) -> Result<()> {
    let mut stmt = tx
        .prepare(&format!(
            "INSERT INTO messages ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                content = excluded.content,
                model = excluded.model,
                prompt_tokens = excluded.prompt_tokens,
                completion_tokens = excluded.completion_tokens,
                status = excluded.status",
            MESSAGE_COLUMNS
        ))
        .map_err(|e| storage_err("Failed to prepare statement", e))?;
    for m in messages {
        stmt.execute(params![
            m.id,
            m.session_id,
            m.role,
            m.content,
            m.model,
            m.created_at,
            m.prompt_tokens,
            m.completion_tokens,
            m.status,
        ])
        .map_err(|e| storage_err("Failed to write message", e))?;
    }
    Ok(())
}

#[async_trait]
impl Persistence for SqliteStorage {
    async fn insert_session(&self, session: &Session) -> Result<()> {
        let session = session.clone();
        self.with_conn(move |conn| {
            let tx = conn
                .transaction()
                .map_err(|e| storage_err("Failed to start transaction", e))?;
            tx.execute(
                &format!(
                    "INSERT INTO sessions ({}) VALUES (?, ?, ?, ?, ?, ?)",
                    SESSION_COLUMNS
                ),
                params![
                    session.id,
                    session.owner_id,
                    session.name,
                    session.pinned,
                    session.created_at,
                    session.updated_at,
                ],
            )
            .map_err(|e| storage_err("Failed to insert session", e))?;
            upsert_message_rows(&tx, &session.messages)?;
            tx.commit()
                .map_err(|e| storage_err("Failed to commit transaction", e))?;
            Ok(())
        })
        .await
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let session = conn
                .query_row(
                    &format!("SELECT {} FROM sessions WHERE id = ?", SESSION_COLUMNS),
                    params![id],
                    row_to_session,
                )
                .optional()
                .map_err(|e| storage_err("Failed to query session", e))?;
            match session {
                Some(mut s) => {
                    s.messages = query_messages(conn, &s.id)?;
                    Ok(Some(s))
                }
                None => Ok(None),
            }
        })
        .await
    }

    async fn list_sessions(&self, owner_id: &str) -> Result<Vec<Session>> {
        let owner_id = owner_id.to_string();
        self.with_conn(move |conn| {
            let mut sessions = {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {} FROM sessions WHERE owner_id = ? ORDER BY updated_at DESC",
                        SESSION_COLUMNS
                    ))
                    .map_err(|e| storage_err("Failed to prepare statement", e))?;
                let rows = stmt
                    .query_map(params![owner_id], row_to_session)
                    .map_err(|e| storage_err("Failed to query sessions", e))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(|e| storage_err("Failed to read session row", e))?
            };
            for session in &mut sessions {
                session.messages = query_messages(conn, &session.id)?;
            }
            Ok(sessions)
        })
        .await
    }

    async fn update_session(&self, session: &Session) -> Result<()> {
        let session = session.header();
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE sessions SET name = ?, pinned = ?, updated_at = ? WHERE id = ?",
                    params![session.name, session.pinned, session.updated_at, session.id],
                )
                .map_err(|e| storage_err("Failed to update session", e))?;
            if changed == 0 {
                return Err(ChatflowError::SessionNotFound(session.id).into());
            }
            Ok(())
        })
        .await
    }

    async fn delete_sessions(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let ids = ids.to_vec();
        self.with_conn(move |conn| {
            let placeholders = sql_placeholders(ids.len());
            let tx = conn
                .transaction()
                .map_err(|e| storage_err("Failed to start transaction", e))?;
            tx.execute(
                &format!(
                    "DELETE FROM messages WHERE session_id IN ({})",
                    placeholders
                ),
                params_from_iter(ids.iter()),
            )
            .map_err(|e| storage_err("Failed to delete messages", e))?;
            tx.execute(
                &format!("DELETE FROM sessions WHERE id IN ({})", placeholders),
                params_from_iter(ids.iter()),
            )
            .map_err(|e| storage_err("Failed to delete sessions", e))?;
            tx.commit()
                .map_err(|e| storage_err("Failed to commit transaction", e))?;
            Ok(())
        })
        .await
    }

    async fn upsert_messages(&self, messages: &[ChatMessage]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let messages = messages.to_vec();
        self.with_conn(move |conn| {
            let tx = conn
                .transaction()
                .map_err(|e| storage_err("Failed to start transaction", e))?;
            upsert_message_rows(&tx, &messages)?;
            tx.commit()
                .map_err(|e| storage_err("Failed to commit transaction", e))?;
            Ok(())
        })
        .await
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| query_messages(conn, &session_id))
            .await
    }

    async fn load_quota(&self, owner_id: &str) -> Result<Option<QuotaState>> {
        let owner_id = owner_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {} FROM quotas WHERE owner_id = ?", QUOTA_COLUMNS),
                params![owner_id],
                row_to_quota,
            )
            .optional()
            .map_err(|e| storage_err("Failed to query quota", e))
        })
        .await
    }

    async fn init_quota(&self, owner_id: &str, now: DateTime<Utc>) -> Result<QuotaState> {
        let fresh = QuotaState::new(owner_id, now);
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT OR IGNORE INTO quotas ({}) VALUES (?, ?, ?, ?, ?, ?)",
                    QUOTA_COLUMNS
                ),
                params![
                    fresh.owner_id,
                    fresh.plan,
                    fresh.current_day_usage,
                    fresh.current_month_usage,
                    fresh.last_day_reset,
                    fresh.last_month_reset,
                ],
            )
            .map_err(|e| storage_err("Failed to create quota record", e))?;
            conn.query_row(
                &format!("SELECT {} FROM quotas WHERE owner_id = ?", QUOTA_COLUMNS),
                params![fresh.owner_id],
                row_to_quota,
            )
            .map_err(|e| storage_err("Failed to read quota record", e))
        })
        .await
    }

    async fn reset_usage(
        &self,
        owner_id: &str,
        period: UsagePeriod,
        observed: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let owner_id = owner_id.to_string();
        self.with_conn(move |conn| {
            let sql = match period {
                UsagePeriod::Day => {
                    "UPDATE quotas SET current_day_usage = 0, last_day_reset = ?
                     WHERE owner_id = ? AND last_day_reset = ?"
                }
                UsagePeriod::Month => {
                    "UPDATE quotas SET current_month_usage = 0, last_month_reset = ?
                     WHERE owner_id = ? AND last_month_reset = ?"
                }
            };
            let changed = conn
                .execute(sql, params![at, owner_id, observed])
                .map_err(|e| storage_err("Failed to reset usage", e))?;
            Ok(changed > 0)
        })
        .await
    }

    async fn increment_usage(&self, owner_id: &str) -> Result<()> {
        let owner_id = owner_id.to_string();
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE quotas
                     SET current_day_usage = current_day_usage + 1,
                         current_month_usage = current_month_usage + 1
                     WHERE owner_id = ?",
                    params![owner_id],
                )
                .map_err(|e| storage_err("Failed to increment usage", e))?;
            if changed == 0 {
                return Err(ChatflowError::Storage(format!(
                    "No quota record for owner {}",
                    owner_id
                ))
                .into());
            }
            Ok(())
        })
        .await
    }

    async fn set_plan(&self, owner_id: &str, plan: PlanTier) -> Result<()> {
        let fresh = QuotaState::new(owner_id, Utc::now());
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO quotas ({}) VALUES (?, ?, ?, ?, ?, ?)
                     ON CONFLICT(owner_id) DO UPDATE SET plan = excluded.plan",
                    QUOTA_COLUMNS
                ),
                params![
                    fresh.owner_id,
                    plan,
                    fresh.current_day_usage,
                    fresh.current_month_usage,
                    fresh.last_day_reset,
                    fresh.last_month_reset,
                ],
            )
            .map_err(|e| storage_err("Failed to set plan", e))?;
            Ok(())
        })
        .await
    }
}
