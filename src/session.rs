//! Sessions, workspaces, and the active-session record store.
//!
//! The lifecycle manager never removes a container that an active session
//! still references. That check is made against a [`SessionStore`], not
//! inferred from container state, so records are written before an execution
//! touches its container and closed when the execution ends.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::executor::process::pid_alive;
use crate::trust::TrustMode;

/// Originator of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionSource {
    /// The operator's interactive app.
    App,
    /// Telegram bot connector.
    Telegram,
    /// Discord bot connector.
    Discord,
    /// Matrix bot connector.
    Matrix,
}

impl SessionSource {
    /// Returns `true` for sessions started by a bot platform.
    pub fn is_bot(self) -> bool {
        !matches!(self, Self::App)
    }

    /// Stable lowercase name, used as the session-type identifier.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::App => "app",
            Self::Telegram => "telegram",
            Self::Discord => "discord",
            Self::Matrix => "matrix",
        }
    }
}

impl fmt::Display for SessionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "app" | "interactive" => Ok(Self::App),
            "telegram" => Ok(Self::Telegram),
            "discord" => Ok(Self::Discord),
            "matrix" => Ok(Self::Matrix),
            other => Err(format!(
                "unknown session source '{other}': expected app, telegram, discord, or matrix"
            )),
        }
    }
}

/// A named execution scope owned by workspace management.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    /// Unique, filesystem-safe identifier.
    pub slug: String,
    /// Trust mode used when a session carries no explicit designation.
    pub default_trust: TrustMode,
    /// Whether sandboxed containers for this workspace join the bridge network.
    pub network_enabled: bool,
    /// Host directory holding this workspace's vault data.
    pub vault_root: PathBuf,
}

impl Workspace {
    /// Build a workspace with network disabled and sandboxed default trust.
    pub fn new(slug: impl Into<String>, vault_root: impl Into<PathBuf>) -> Self {
        Self {
            slug: slug.into(),
            default_trust: TrustMode::Sandboxed,
            network_enabled: false,
            vault_root: vault_root.into(),
        }
    }
}

/// Check that a slug can safely name a container, lock, and directory.
///
/// Accepts 1-63 characters of lowercase ASCII letters, digits, `-` and `_`,
/// starting with a letter or digit.
///
/// # Errors
///
/// Returns a human-readable reason when the slug is rejected.
pub fn validate_slug(slug: &str) -> std::result::Result<(), String> {
    if slug.is_empty() || slug.len() > 63 {
        return Err(format!(
            "workspace slug must be 1-63 characters, got {}",
            slug.len()
        ));
    }
    let mut chars = slug.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    let rest_ok = slug
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if !first_ok || !rest_ok {
        return Err(format!(
            "workspace slug '{slug}' must be lowercase alphanumeric with '-' or '_'"
        ));
    }
    Ok(())
}

/// One request to run the agent.
#[derive(Debug, Clone)]
pub struct Session {
    /// Session identifier, unique per execution.
    pub id: String,
    /// Who started the session. `None` is treated as untrusted.
    pub source: Option<SessionSource>,
    /// Workspace scope. `None` selects the shared default scope.
    pub workspace: Option<Workspace>,
    /// Raw trust designation, if the caller supplied one.
    pub trust: Option<String>,
    /// Identifier of a prior execution to continue.
    pub resume_session_id: Option<String>,
    /// Per-session system prompt override.
    pub system_prompt: Option<String>,
}

impl Session {
    /// Start a new session with a fresh identifier.
    pub fn new(source: Option<SessionSource>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source,
            workspace: None,
            trust: None,
            resume_session_id: None,
            system_prompt: None,
        }
    }

    /// Attach a workspace scope.
    #[must_use]
    pub fn with_workspace(mut self, workspace: Workspace) -> Self {
        self.workspace = Some(workspace);
        self
    }

    /// Attach an explicit trust designation.
    #[must_use]
    pub fn with_trust(mut self, trust: impl Into<String>) -> Self {
        self.trust = Some(trust.into());
        self
    }

    /// Continue a prior execution.
    #[must_use]
    pub fn with_resume(mut self, resume_session_id: impl Into<String>) -> Self {
        self.resume_session_id = Some(resume_session_id.into());
        self
    }

    /// Session-type identifier passed into the execution environment.
    pub fn session_type(&self) -> &'static str {
        self.source.map_or("unknown", SessionSource::as_str)
    }
}

/// An active session's claim on a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    /// Session identifier.
    pub session_id: String,
    /// Container the session executes in.
    pub container: String,
    /// Workspace slug, `None` for the shared default container.
    pub workspace: Option<String>,
    /// Process that runs the session.
    pub owner_pid: u32,
}

impl SessionRecord {
    /// Record owned by the current process.
    pub fn new(
        session_id: impl Into<String>,
        container: impl Into<String>,
        workspace: Option<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            container: container.into(),
            workspace,
            owner_pid: std::process::id(),
        }
    }
}

/// Store of sessions currently executing inside managed containers.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Record a session as active on its container.
    async fn register(&self, record: &SessionRecord) -> Result<()>;
    /// Mark a session as finished.
    async fn complete(&self, session_id: &str) -> Result<()>;
    /// Number of active sessions referencing `container`.
    async fn active_count(&self, container: &str) -> Result<u64>;
    /// Close every active record whose owning process has exited.
    ///
    /// Records owned by a live process, such as a concurrent one-shot run
    /// sharing the database, stay active. Returns the number of records
    /// closed.
    async fn mark_orphaned(&self) -> Result<u64>;
}

/// Process-local session store.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    active: Mutex<HashMap<String, SessionRecord>>,
}

impl MemorySessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionRecord>> {
        // A poisoned map still holds valid records; keep serving them.
        self.active
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn register(&self, record: &SessionRecord) -> Result<()> {
        self.lock()
            .insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    async fn complete(&self, session_id: &str) -> Result<()> {
        self.lock().remove(session_id);
        Ok(())
    }

    async fn active_count(&self, container: &str) -> Result<u64> {
        let count = self
            .lock()
            .values()
            .filter(|record| record.container == container)
            .count();
        Ok(u64::try_from(count).unwrap_or(u64::MAX))
    }

    async fn mark_orphaned(&self) -> Result<u64> {
        Ok(0)
    }
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS session_records (\
        id TEXT PRIMARY KEY, \
        container TEXT NOT NULL, \
        workspace TEXT, \
        status TEXT NOT NULL, \
        started_at TEXT NOT NULL, \
        ended_at TEXT, \
        owner_pid INTEGER\
    )";

const SCHEMA_INDEX: &str = "CREATE INDEX IF NOT EXISTS idx_session_records_container \
     ON session_records (container, status)";

/// SQLite-backed session store.
///
/// Records survive restarts so a crashed run can be told apart from a live
/// one: [`mark_orphaned`](SessionStore::mark_orphaned) closes whatever the
/// previous process left open.
#[derive(Debug, Clone)]
pub struct SqliteSessionStore {
    db: SqlitePool,
}

impl SqliteSessionStore {
    /// Open (creating if needed) the session database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let db = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open session db {}", path.display()))?;
        Self::from_pool(db).await
    }

    /// Single-connection in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub async fn in_memory() -> Result<Self> {
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("failed to open in-memory session db")?;
        Self::from_pool(db).await
    }

    /// Wrap an existing pool, creating the schema if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub async fn from_pool(db: SqlitePool) -> Result<Self> {
        sqlx::query(SCHEMA)
            .execute(&db)
            .await
            .context("failed to create session_records table")?;
        let columns: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM pragma_table_info('session_records')")
                .fetch_all(&db)
                .await
                .context("failed to read session_records columns")?;
        if !columns.iter().any(|(name,)| name == "owner_pid") {
            sqlx::query("ALTER TABLE session_records ADD COLUMN owner_pid INTEGER")
                .execute(&db)
                .await
                .context("failed to add owner_pid to session_records")?;
        }
        sqlx::query(SCHEMA_INDEX)
            .execute(&db)
            .await
            .context("failed to create session_records index")?;
        Ok(Self { db })
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn register(&self, record: &SessionRecord) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO session_records \
             (id, container, workspace, status, started_at, ended_at, owner_pid) \
             VALUES (?1, ?2, ?3, 'active', ?4, NULL, ?5)",
        )
        .bind(&record.session_id)
        .bind(&record.container)
        .bind(record.workspace.as_deref())
        .bind(Utc::now().to_rfc3339())
        .bind(i64::from(record.owner_pid))
        .execute(&self.db)
        .await
        .context("failed to register session record")?;

        debug!(
            session_id = %record.session_id,
            container = %record.container,
            "session record registered"
        );
        Ok(())
    }

    async fn complete(&self, session_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE session_records SET status = 'completed', ended_at = ?2 \
             WHERE id = ?1 AND status = 'active'",
        )
        .bind(session_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.db)
        .await
        .context("failed to complete session record")?;

        debug!(session_id, "session record completed");
        Ok(())
    }

    async fn active_count(&self, container: &str) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM session_records WHERE container = ?1 AND status = 'active'",
        )
        .bind(container)
        .fetch_one(&self.db)
        .await
        .context("failed to count active sessions")?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn mark_orphaned(&self) -> Result<u64> {
        let active: Vec<(String, Option<i64>)> =
            sqlx::query_as("SELECT id, owner_pid FROM session_records WHERE status = 'active'")
                .fetch_all(&self.db)
                .await
                .context("failed to list active session records")?;

        let own_pid = std::process::id();
        let mut count: u64 = 0;
        for (id, owner) in active {
            let owner = owner.and_then(|pid| u32::try_from(pid).ok());
            if let Some(pid) = owner {
                if pid == own_pid || pid_alive(pid).await {
                    debug!(session_id = %id, owner_pid = pid, "session owner still running");
                    continue;
                }
            }
            let result = sqlx::query(
                "UPDATE session_records SET status = 'orphaned', ended_at = ?2 \
                 WHERE id = ?1 AND status = 'active'",
            )
            .bind(&id)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.db)
            .await
            .context("failed to mark orphaned session")?;
            count = count.saturating_add(result.rows_affected());
        }

        if count > 0 {
            info!(count, "closed session records whose owning process is gone");
        }
        Ok(count)
    }
}
