//! Stable identifier allocation and durable sync state
//!
//! Numeric ids for mirrored entities are allocated per namespace and keyed by
//! the entity's ARN. Allocations are append-only: an id is never reclaimed,
//! and the same key always maps to the same id, across restarts.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum AllocatorError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("No identifiers left in namespace {0}")]
    Exhausted(Namespace),

    #[error("Stored identifier {id} for {key} is outside namespace {namespace}")]
    OutOfRange { namespace: Namespace, key: String, id: i64 },
}

pub type Result<T> = std::result::Result<T, AllocatorError>;

/// Identifier namespace; ranges are disjoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// `uidNumber` of user and role accounts
    Users,
    /// `gidNumber` of groups (including per-role groups)
    Groups,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Users => "users",
            Namespace::Groups => "groups",
        }
    }

    /// Half-open range `[start, end)` of ids issued in this namespace
    pub fn range(&self) -> (u32, u32) {
        match self {
            Namespace::Users => (10_000, 1_000_000),
            Namespace::Groups => (1_000_000, 2_000_000),
        }
    }

    pub fn contains(&self, id: i64) -> bool {
        let (start, end) = self.range();
        id >= start as i64 && id < end as i64
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps an external key to a stable numeric id.
#[async_trait]
pub trait IdAllocator: Send + Sync {
    /// Return the id recorded for `key`, allocating a fresh one when unseen.
    async fn allocate(&self, namespace: Namespace, key: &str) -> Result<u32>;

    /// The id recorded for `key`, without allocating
    async fn allocated(&self, namespace: Namespace, key: &str) -> Result<Option<u32>>;
}

/// Durable flags about the sync lifecycle.
#[async_trait]
pub trait SyncStateStore: Send + Sync {
    async fn initial_clear_done(&self) -> Result<bool>;

    async fn mark_initial_clear_done(&self) -> Result<()>;
}

const INITIAL_CLEAR_KEY: &str = "initial_clear_done";

/// SQLite-backed allocator and sync state.
pub struct SqliteStateStore {
    pool: Pool<Sqlite>,
    // Serializes read-max-then-insert so concurrent allocations never race
    allocation_lock: Mutex<()>,
}

impl SqliteStateStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool, allocation_lock: Mutex::new(()) }
    }

    /// Open (creating if missing) the database at `url` and initialize the schema.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self::new(pool);
        store.init_schema().await?;
        info!(url = %url, "State store opened");
        Ok(store)
    }

    /// Private in-memory database; a single connection so every query sees
    /// the same data.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self::new(pool);
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS id_allocations (
                namespace TEXT NOT NULL,
                external_key TEXT NOT NULL,
                id INTEGER NOT NULL,
                allocated_at INTEGER NOT NULL,
                PRIMARY KEY (namespace, external_key),
                UNIQUE (namespace, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        debug!("State store schema initialized");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn checked_id(namespace: Namespace, key: &str, id: i64) -> Result<u32> {
    if namespace.contains(id) {
        Ok(id as u32)
    } else {
        Err(AllocatorError::OutOfRange { namespace, key: key.to_string(), id })
    }
}

#[async_trait]
impl IdAllocator for SqliteStateStore {
    async fn allocate(&self, namespace: Namespace, key: &str) -> Result<u32> {
        let _guard = self.allocation_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            "SELECT id FROM id_allocations WHERE namespace = ? AND external_key = ?",
        )
        .bind(namespace.as_str())
        .bind(key)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(row) = existing {
            return checked_id(namespace, key, row.get("id"));
        }

        let max: Option<i64> =
            sqlx::query_scalar("SELECT MAX(id) FROM id_allocations WHERE namespace = ?")
                .bind(namespace.as_str())
                .fetch_one(&mut *tx)
                .await?;

        let (start, end) = namespace.range();
        let next = max.map(|m| m + 1).unwrap_or(start as i64).max(start as i64);
        if next >= end as i64 {
            return Err(AllocatorError::Exhausted(namespace));
        }

        sqlx::query(
            "INSERT INTO id_allocations (namespace, external_key, id, allocated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(namespace.as_str())
        .bind(key)
        .bind(next)
        .bind(Utc::now().timestamp())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!(namespace = %namespace, key = %key, id = next, "Allocated identifier");
        metrics::counter!("sync.ids_allocated_total", "namespace" => namespace.as_str()).increment(1);
        Ok(next as u32)
    }

    async fn allocated(&self, namespace: Namespace, key: &str) -> Result<Option<u32>> {
        let row = sqlx::query(
            "SELECT id FROM id_allocations WHERE namespace = ? AND external_key = ?",
        )
        .bind(namespace.as_str())
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| checked_id(namespace, key, row.get("id"))).transpose()
    }
}

#[async_trait]
impl SyncStateStore for SqliteStateStore {
    async fn initial_clear_done(&self) -> Result<bool> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM sync_state WHERE key = ?")
                .bind(INITIAL_CLEAR_KEY)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.as_deref() == Some("true"))
    }

    async fn mark_initial_clear_done(&self) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (key, value, updated_at) VALUES (?, 'true', ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(INITIAL_CLEAR_KEY)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
