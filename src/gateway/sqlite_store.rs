use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::OptionalExtension;
use thiserror::Error;

use super::{GatewayError, IdentityResolver, IssuedKey, UsageRecord, UsageSink};

/// Issued keys and the usage ledger in one SQLite file.
///
/// Every operation opens its own connection on the blocking pool. Call [`SqliteStore::init`]
/// once before use; the other operations expect the tables to exist.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

#[derive(Debug, Error)]
pub enum SqliteStoreError {
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to create database directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates the parent directory and both tables if missing.
    pub async fn init(&self) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|source| SqliteStoreError::CreateDir {
                    path: parent.display().to_string(),
                    source,
                })?;
            }
            let conn = open_connection(path)?;
            enable_wal(&conn)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    /// Label of the active key `token`, or `None` if unknown or revoked.
    pub async fn lookup_active_label(&self, token: &str) -> Result<Option<String>, SqliteStoreError> {
        let path = self.path.clone();
        let token = token.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<String>, SqliteStoreError> {
            let conn = open_connection(path)?;
            let label = conn
                .query_row(
                    "SELECT label FROM api_keys WHERE token = ?1 AND revoked = 0",
                    rusqlite::params![token],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            Ok(label)
        })
        .await?
    }

    pub async fn upsert_key(&self, key: &IssuedKey, note: Option<&str>) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        let key = key.clone();
        let note = note.map(str::to_string);
        let ts_ms = now_millis();
        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(path)?;
            conn.execute(
                "INSERT INTO api_keys (token, label, created_at, revoked, note)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(token) DO UPDATE SET
                   label=excluded.label,
                   revoked=excluded.revoked,
                   note=excluded.note",
                rusqlite::params![key.token, key.label, ts_ms, !key.active, note],
            )?;
            Ok(())
        })
        .await?
    }

    /// Returns whether a key was revoked.
    pub async fn revoke_key(&self, token: &str) -> Result<bool, SqliteStoreError> {
        let path = self.path.clone();
        let token = token.to_string();
        tokio::task::spawn_blocking(move || -> Result<bool, SqliteStoreError> {
            let conn = open_connection(path)?;
            let updated = conn.execute(
                "UPDATE api_keys SET revoked = 1 WHERE token = ?1 AND revoked = 0",
                rusqlite::params![token],
            )?;
            Ok(updated > 0)
        })
        .await?
    }

    pub async fn insert_usage(&self, record: &UsageRecord) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(path)?;
            conn.execute(
                "INSERT INTO usage (request_id, label, model, prompt_tokens, completion_tokens, total_tokens, cost, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    record.request_id,
                    record.label,
                    record.model,
                    u64_to_i64(record.prompt_tokens),
                    u64_to_i64(record.completion_tokens),
                    u64_to_i64(record.total_tokens),
                    record.cost_usd,
                    u64_to_i64(record.timestamp_ms),
                ],
            )?;
            Ok(())
        })
        .await?
    }

    /// Rows for `label` with `since_ms <= timestamp < until_ms`, oldest first.
    pub async fn list_usage(
        &self,
        label: &str,
        since_ms: Option<u64>,
        until_ms: Option<u64>,
    ) -> Result<Vec<UsageRecord>, SqliteStoreError> {
        let path = self.path.clone();
        let label = label.to_string();
        let since = since_ms.map(u64_to_i64).unwrap_or(0);
        let until = until_ms.map(u64_to_i64).unwrap_or(i64::MAX);
        tokio::task::spawn_blocking(move || -> Result<Vec<UsageRecord>, SqliteStoreError> {
            let conn = open_connection(path)?;
            let mut stmt = conn.prepare(
                "SELECT request_id, label, model, prompt_tokens, completion_tokens, total_tokens, cost, created_at_ms
                 FROM usage
                 WHERE label = ?1 AND created_at_ms >= ?2 AND created_at_ms < ?3
                 ORDER BY created_at_ms ASC, id ASC",
            )?;
            let rows = stmt.query_map(rusqlite::params![label, since, until], |row| {
                Ok(UsageRecord {
                    request_id: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                    label: row.get(1)?,
                    model: row.get(2)?,
                    prompt_tokens: i64_to_u64(row.get(3)?),
                    completion_tokens: i64_to_u64(row.get(4)?),
                    total_tokens: i64_to_u64(row.get(5)?),
                    cost_usd: row.get(6)?,
                    timestamp_ms: i64_to_u64(row.get(7)?),
                })
            })?;

            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await?
    }
}

#[async_trait]
impl IdentityResolver for SqliteStore {
    async fn resolve_identity(&self, token: &str) -> Result<Option<String>, GatewayError> {
        self.lookup_active_label(token)
            .await
            .map_err(|err| GatewayError::KeyStore {
                message: err.to_string(),
            })
    }
}

#[async_trait]
impl UsageSink for SqliteStore {
    async fn append_usage(
        &self,
        record: &UsageRecord,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.insert_usage(record).await?;
        Ok(())
    }
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS api_keys (
  token TEXT PRIMARY KEY,
  label TEXT NOT NULL,
  created_at INTEGER NOT NULL,
  revoked INTEGER NOT NULL DEFAULT 0,
  note TEXT
);

CREATE TABLE IF NOT EXISTS usage (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  request_id TEXT,
  label TEXT NOT NULL,
  model TEXT NOT NULL,
  prompt_tokens INTEGER NOT NULL,
  completion_tokens INTEGER NOT NULL,
  total_tokens INTEGER NOT NULL,
  cost REAL,
  created_at_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_usage_label_created_at ON usage(label, created_at_ms);
"#,
    )?;
    Ok(())
}

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(conn)
}

/// The journal mode is stored in the database file, so this only needs to run once.
fn enable_wal(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        tracing::warn!(journal_mode = %mode, "sqlite refused WAL; concurrent writers may block");
    }
    Ok(())
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

fn u64_to_i64(value: u64) -> i64 {
    if value > i64::MAX as u64 {
        i64::MAX
    } else {
        value as i64
    }
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}
