//! Ledger backing stores.
//!
//! The ledger only talks to a [`LedgerStore`]: keyed state, keyed float
//! counters with an atomic increment, and an append-only usage log.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("store lock poisoned")]
    Poisoned,

    #[error("task join error: {0}")]
    Join(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// One usage entry in the ledger's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub model: String,
    pub credits: f64,
    pub recorded_at: DateTime<Utc>,
    /// Free-form tags (stage, niche, ...).
    pub metadata: serde_json::Value,
}

/// Durable store behind the budget ledger.
///
/// # Invariants
/// - `increment_float` is a single atomic operation: concurrent increments
///   never lose an update
/// - reads observe every write that completed before them
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Current value of a counter, `None` if it was never incremented.
    async fn get_float(&self, key: &str) -> Result<Option<f64>, StoreError>;

    /// Atomically add `amount` to a counter (created at 0) and return the new value.
    async fn increment_float(&self, key: &str, amount: f64) -> Result<f64, StoreError>;

    async fn append_usage(&self, record: &UsageRecord) -> Result<(), StoreError>;

    /// Increment counter `key` by `record.credits` and append `record` as
    /// one unit: either both writes land or neither does. Returns the new
    /// counter value.
    async fn record(&self, key: &str, record: &UsageRecord) -> Result<f64, StoreError>;

    /// Sum of credits recorded at or after `since`.
    async fn usage_since(&self, since: DateTime<Utc>) -> Result<f64, StoreError>;

    /// Most recent usage entries, newest first.
    async fn recent_usage(&self, limit: usize) -> Result<Vec<UsageRecord>, StoreError>;
}

/// SQLite-backed ledger store; survives process restarts and is shared by
/// every process opening the same file.
#[derive(Clone)]
pub struct SqliteLedgerStore {
    path: Option<PathBuf>,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLedgerStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        Self::init(conn, Some(path))
    }

    /// Private database that lives as long as this store.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        // In-memory databases answer "memory" here.
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.execute_batch(
            "PRAGMA synchronous=NORMAL;\
             CREATE TABLE IF NOT EXISTS ledger_state (\
               key TEXT PRIMARY KEY,\
               value TEXT NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS ledger_counters (\
               key TEXT PRIMARY KEY,\
               value REAL NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS usage_log (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               model TEXT NOT NULL,\
               credits REAL NOT NULL,\
               recorded_at INTEGER NOT NULL,\
               metadata TEXT NOT NULL\
             );\
             CREATE INDEX IF NOT EXISTS usage_log_recorded_at ON usage_log (recorded_at);",
        )?;
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError>,
    {
        let guard = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&*guard)
    }

    async fn blocking<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.with_conn(f))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

fn micros_to_datetime(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        self.blocking(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT value FROM ledger_state WHERE key = ?1",
                    params![key],
                    |row| row.get::<_, String>(0),
                )
                .optional()?)
        })
        .await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        let value = value.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO ledger_state (key, value) VALUES (?1, ?2) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_float(&self, key: &str) -> Result<Option<f64>, StoreError> {
        let key = key.to_string();
        self.blocking(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT value FROM ledger_counters WHERE key = ?1",
                    params![key],
                    |row| row.get::<_, f64>(0),
                )
                .optional()?)
        })
        .await
    }

    async fn increment_float(&self, key: &str, amount: f64) -> Result<f64, StoreError> {
        let key = key.to_string();
        self.blocking(move |conn| {
            Ok(conn.query_row(
                "INSERT INTO ledger_counters (key, value) VALUES (?1, ?2) \
                 ON CONFLICT(key) DO UPDATE SET value = value + excluded.value \
                 RETURNING value",
                params![key, amount],
                |row| row.get::<_, f64>(0),
            )?)
        })
        .await
    }

    async fn append_usage(&self, record: &UsageRecord) -> Result<(), StoreError> {
        let metadata = serde_json::to_string(&record.metadata)?;
        let model = record.model.clone();
        let credits = record.credits;
        let recorded_at = record.recorded_at.timestamp_micros();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO usage_log (model, credits, recorded_at, metadata) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![model, credits, recorded_at, metadata],
            )?;
            Ok(())
        })
        .await
    }

    async fn record(&self, key: &str, record: &UsageRecord) -> Result<f64, StoreError> {
        let key = key.to_string();
        let metadata = serde_json::to_string(&record.metadata)?;
        let model = record.model.clone();
        let credits = record.credits;
        let recorded_at = record.recorded_at.timestamp_micros();
        self.blocking(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let used = tx.query_row(
                "INSERT INTO ledger_counters (key, value) VALUES (?1, ?2) \
                 ON CONFLICT(key) DO UPDATE SET value = value + excluded.value \
                 RETURNING value",
                params![key, credits],
                |row| row.get::<_, f64>(0),
            )?;
            tx.execute(
                "INSERT INTO usage_log (model, credits, recorded_at, metadata) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![model, credits, recorded_at, metadata],
            )?;
            tx.commit()?;
            Ok(used)
        })
        .await
    }

    async fn usage_since(&self, since: DateTime<Utc>) -> Result<f64, StoreError> {
        let since = since.timestamp_micros();
        self.blocking(move |conn| {
            Ok(conn.query_row(
                "SELECT COALESCE(SUM(credits), 0.0) FROM usage_log WHERE recorded_at >= ?1",
                params![since],
                |row| row.get::<_, f64>(0),
            )?)
        })
        .await
    }

    async fn recent_usage(&self, limit: usize) -> Result<Vec<UsageRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT model, credits, recorded_at, metadata FROM usage_log \
                 ORDER BY recorded_at DESC, id DESC LIMIT ?1",
            )?;
            let mut rows = stmt.query(params![limit])?;
            let mut records = Vec::new();
            while let Some(row) = rows.next()? {
                let metadata: String = row.get(3)?;
                records.push(UsageRecord {
                    model: row.get(0)?,
                    credits: row.get(1)?,
                    recorded_at: micros_to_datetime(row.get(2)?),
                    metadata: serde_json::from_str(&metadata)?,
                });
            }
            Ok(records)
        })
        .await
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    values: HashMap<String, String>,
    counters: HashMap<String, f64>,
    usage: Vec<UsageRecord>,
}

/// Process-local store. Used by tests and as the degraded store when the
/// durable one cannot be opened.
#[derive(Debug, Default, Clone)]
pub struct MemoryLedgerStore {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut MemoryState) -> R,
    {
        let mut guard = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&mut *guard))
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_state(|s| s.values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.with_state(|s| {
            s.values.insert(key.to_string(), value.to_string());
        })
    }

    async fn get_float(&self, key: &str) -> Result<Option<f64>, StoreError> {
        self.with_state(|s| s.counters.get(key).copied())
    }

    async fn increment_float(&self, key: &str, amount: f64) -> Result<f64, StoreError> {
        self.with_state(|s| {
            let value = s.counters.entry(key.to_string()).or_insert(0.0);
            *value += amount;
            *value
        })
    }

    async fn append_usage(&self, record: &UsageRecord) -> Result<(), StoreError> {
        self.with_state(|s| s.usage.push(record.clone()))
    }

    async fn record(&self, key: &str, record: &UsageRecord) -> Result<f64, StoreError> {
        self.with_state(|s| {
            let value = s.counters.entry(key.to_string()).or_insert(0.0);
            *value += record.credits;
            let used = *value;
            s.usage.push(record.clone());
            used
        })
    }

    async fn usage_since(&self, since: DateTime<Utc>) -> Result<f64, StoreError> {
        self.with_state(|s| {
            s.usage
                .iter()
                .filter(|r| r.recorded_at >= since)
                .map(|r| r.credits)
                .sum()
        })
    }

    async fn recent_usage(&self, limit: usize) -> Result<Vec<UsageRecord>, StoreError> {
        self.with_state(|s| s.usage.iter().rev().take(limit).cloned().collect())
    }
}
