//! SQLite-based state store for the operator.
//!
//! Mirrors the secrets readable by this unit and journals every change to
//! owned secrets until the host has applied it.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use octi_id::SecretId;
use octi_secrets::{GrantScope, SecretContent, SecretStore, SecretStoreError};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::{debug, info};

use super::journal::{JournalEntry, SecretOp};

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid state: {0}")]
    Invalid(String),

    #[error("state store lock poisoned")]
    Poisoned,
}

/// A stored secret row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRecord {
    pub id: SecretId,
    pub content: SecretContent,
    pub revision: u32,
    pub created_at: i64,
    pub updated_at: i64,
}

/// SQLite state store.
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    /// Open or create a state store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StateStoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StateStoreError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StateStoreError> {
        self.conn.lock().map_err(|_| StateStoreError::Poisoned)
    }

    fn init_schema(&self) -> Result<(), StateStoreError> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS secrets (
                secret_id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                revision INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS secret_grants (
                secret_id TEXT NOT NULL REFERENCES secrets(secret_id) ON DELETE CASCADE,
                scope TEXT NOT NULL,
                PRIMARY KEY (secret_id, scope)
            );

            CREATE TABLE IF NOT EXISTS secret_ops (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                op TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            "#,
        )?;

        debug!("State store schema initialized");
        Ok(())
    }

    /// Get a secret record.
    pub fn get_secret(&self, id: &SecretId) -> Result<Option<SecretRecord>, StateStoreError> {
        let row: Option<(String, u32, i64, i64)> = self
            .conn()?
            .query_row(
                "SELECT content, revision, created_at, updated_at FROM secrets WHERE secret_id = ?1",
                params![id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        row.map(|(content, revision, created_at, updated_at)| {
            Ok(SecretRecord {
                id: id.clone(),
                content: serde_json::from_str(&content)?,
                revision,
                created_at,
                updated_at,
            })
        })
        .transpose()
    }

    /// Insert a secret or replace its content, bumping the revision only
    /// when the content changed.
    pub fn put_secret(&self, id: &SecretId, content: &SecretContent) -> Result<u32, StateStoreError> {
        let now = chrono::Utc::now().timestamp();
        let json = serde_json::to_string(content)?;
        let conn = self.conn()?;
        let current: Option<(String, u32)> = conn
            .query_row(
                "SELECT content, revision FROM secrets WHERE secret_id = ?1",
                params![id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match current {
            None => {
                conn.execute(
                    "INSERT INTO secrets (secret_id, content, revision, created_at, updated_at) VALUES (?1, ?2, 1, ?3, ?3)",
                    params![id.as_str(), json, now],
                )?;
                Ok(1)
            }
            Some((existing, revision)) if existing == json => Ok(revision),
            Some((_, revision)) => {
                conn.execute(
                    "UPDATE secrets SET content = ?1, revision = ?2, updated_at = ?3 WHERE secret_id = ?4",
                    params![json, revision + 1, now, id.as_str()],
                )?;
                Ok(revision + 1)
            }
        }
    }

    /// Delete a secret and its grants. Returns whether it existed.
    pub fn delete_secret(&self, id: &SecretId) -> Result<bool, StateStoreError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM secret_grants WHERE secret_id = ?1",
            params![id.as_str()],
        )?;
        let deleted = conn.execute("DELETE FROM secrets WHERE secret_id = ?1", params![id.as_str()])?;
        Ok(deleted > 0)
    }

    /// Record a grant. Returns whether it is new.
    pub fn add_grant(&self, id: &SecretId, scope: &GrantScope) -> Result<bool, StateStoreError> {
        let inserted = self.conn()?.execute(
            "INSERT OR IGNORE INTO secret_grants (secret_id, scope) VALUES (?1, ?2)",
            params![id.as_str(), scope.to_string()],
        )?;
        Ok(inserted > 0)
    }

    /// Grants of a secret, as `relation:<id>` / `application:<name>`.
    pub fn list_grants(&self, id: &SecretId) -> Result<Vec<String>, StateStoreError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT scope FROM secret_grants WHERE secret_id = ?1 ORDER BY scope")?;
        let scopes = stmt
            .query_map(params![id.as_str()], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(scopes)
    }

    /// Count stored secrets.
    pub fn count_secrets(&self) -> Result<i64, StateStoreError> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM secrets", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Ids of every stored secret.
    pub fn secret_ids(&self) -> Result<Vec<SecretId>, StateStoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT secret_id FROM secrets ORDER BY secret_id")?;
        let raw = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        raw.iter()
            .map(|id| SecretId::parse(id).map_err(|e| StateStoreError::Invalid(e.to_string())))
            .collect()
    }

    /// Append an operation to the journal.
    pub fn record_op(&self, op: &SecretOp) -> Result<i64, StateStoreError> {
        let now = chrono::Utc::now().timestamp();
        let json = serde_json::to_string(op)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO secret_ops (op, created_at) VALUES (?1, ?2)",
            params![json, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Journaled operations the host has not acknowledged, oldest first.
    pub fn pending_ops(&self) -> Result<Vec<JournalEntry>, StateStoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT seq, op FROM secret_ops ORDER BY seq")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(seq, op)| {
                Ok(JournalEntry {
                    seq,
                    op: serde_json::from_str(&op)?,
                })
            })
            .collect()
    }

    /// Drop journaled operations up to and including `seq`.
    pub fn acknowledge_ops(&self, seq: i64) -> Result<usize, StateStoreError> {
        let removed = self
            .conn()?
            .execute("DELETE FROM secret_ops WHERE seq <= ?1", params![seq])?;
        Ok(removed)
    }

    /// Align the local mirror with the secrets the host reports.
    ///
    /// Secrets touched by a pending operation keep their local state, since
    /// the host has not seen that change yet. Everything else follows the
    /// host: reported secrets are upserted, unreported ones dropped.
    pub fn sync_secrets(
        &self,
        host: &BTreeMap<SecretId, SecretContent>,
    ) -> Result<(), StateStoreError> {
        let pending: BTreeSet<SecretId> = self
            .pending_ops()?
            .into_iter()
            .map(|entry| entry.op.secret_id().clone())
            .collect();

        for id in self.secret_ids()? {
            if !host.contains_key(&id) && !pending.contains(&id) && self.delete_secret(&id)? {
                info!(secret_id = %id, "secret no longer reported by host, dropped");
            }
        }
        for (id, content) in host {
            if !pending.contains(id) {
                self.put_secret(id, content)?;
            }
        }
        Ok(())
    }
}

/// Secret store backed by the state store.
///
/// Changes apply locally at once and are journaled for the host.
pub struct LocalSecretStore {
    store: Arc<StateStore>,
}

impl LocalSecretStore {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    fn journal(&self, op: SecretOp) -> Result<(), SecretStoreError> {
        let seq = self.store.record_op(&op).map_err(backend)?;
        debug!(seq, secret_id = %op.secret_id(), "secret operation journaled");
        Ok(())
    }
}

fn backend(err: StateStoreError) -> SecretStoreError {
    SecretStoreError::Backend(err.to_string())
}

#[async_trait]
impl SecretStore for LocalSecretStore {
    async fn get(&self, id: &SecretId, _refresh: bool) -> Result<SecretContent, SecretStoreError> {
        self.store
            .get_secret(id)
            .map_err(backend)?
            .map(|record| record.content)
            .ok_or_else(|| SecretStoreError::NotFound(id.clone()))
    }

    async fn create(&self, content: SecretContent) -> Result<SecretId, SecretStoreError> {
        let id = SecretId::generate();
        self.store.put_secret(&id, &content).map_err(backend)?;
        self.journal(SecretOp::Create {
            id: id.clone(),
            content,
        })?;
        debug!(secret_id = %id, "secret created");
        Ok(id)
    }

    async fn set_content(
        &self,
        id: &SecretId,
        content: SecretContent,
    ) -> Result<(), SecretStoreError> {
        let Some(current) = self.store.get_secret(id).map_err(backend)? else {
            return Err(SecretStoreError::NotFound(id.clone()));
        };
        let revision = self.store.put_secret(id, &content).map_err(backend)?;
        if revision != current.revision {
            self.journal(SecretOp::SetContent {
                id: id.clone(),
                content,
            })?;
            debug!(secret_id = %id, revision, "secret content set");
        }
        Ok(())
    }

    async fn grant(&self, id: &SecretId, scope: &GrantScope) -> Result<(), SecretStoreError> {
        if self.store.get_secret(id).map_err(backend)?.is_none() {
            return Err(SecretStoreError::NotFound(id.clone()));
        }
        if self.store.add_grant(id, scope).map_err(backend)? {
            self.journal(SecretOp::Grant {
                id: id.clone(),
                scope: scope.to_string(),
            })?;
        }
        Ok(())
    }

    async fn remove(&self, id: &SecretId) -> Result<(), SecretStoreError> {
        if self.store.delete_secret(id).map_err(backend)? {
            self.journal(SecretOp::Remove { id: id.clone() })
        } else {
            Err(SecretStoreError::NotFound(id.clone()))
        }
    }
}
