//! Checksum gate and migration bookkeeping.
//!
//! Tracks which backfill migrations have completed. A migration is complete
//! exactly when its recorded checksum equals its success checksum; anything
//! else (including a missing record) means pending, so the runner picks it up
//! again on the next pass. The recorded value is the only durable flag: the
//! cursor itself is always re-derived from domain tables.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::{FromRow, PgPool, Postgres};

use crate::migrations::PENDING_CHECKSUM;

/// Advisory lock key for the cross-process migration lock. Arbitrary but
/// stable across releases.
const MIGRATION_LOCK_KEY: i64 = 0x6261_636b_6669_6c6c;

/// One row of the bookkeeping table.
#[derive(Debug, Clone, FromRow)]
pub struct MigrationRecord {
    pub name: String,
    pub checksum: i32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Guard for the cross-process migration lock. Holding it pins the session
/// that owns the underlying advisory lock.
pub struct MigrationLock {
    conn: Option<PoolConnection<Postgres>>,
}

impl MigrationLock {
    /// A lock that guards nothing, for stores with no cross-process scope.
    pub fn noop() -> Self {
        Self { conn: None }
    }
}

/// Durable store behind the checksum gate.
#[async_trait]
pub trait ChecksumStore: Send + Sync {
    /// Create the bookkeeping storage if it does not exist yet.
    async fn ensure_schema(&self) -> Result<()>;

    /// Checksum last recorded for `name`, if the migration ever started.
    async fn recorded_checksum(&self, name: &str) -> Result<Option<i32>>;

    /// Record that a migration is starting. Inserts the pending sentinel for
    /// a first run; an existing divergent checksum is left untouched so a
    /// re-triggered migration keeps its history row.
    async fn record_pending(&self, name: &str) -> Result<()>;

    /// Record the success checksum after a complete pass.
    async fn record_success(&self, name: &str, checksum: i32) -> Result<()>;

    /// Acquire the migration lock, failing fast if another process holds it.
    async fn lock(&self) -> Result<MigrationLock>;

    /// Release a previously acquired lock.
    async fn unlock(&self, lock: MigrationLock) -> Result<()>;
}

/// Postgres-backed store using the `backfill_history` table and a session
/// advisory lock.
pub struct PgChecksumStore {
    pool: PgPool,
}

impl PgChecksumStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Full record for `name`, for status reporting.
    pub async fn record(&self, name: &str) -> Result<Option<MigrationRecord>> {
        sqlx::query_as::<_, MigrationRecord>(
            "SELECT name, checksum, started_at, completed_at FROM backfill_history WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }
}

#[async_trait]
impl ChecksumStore for PgChecksumStore {
    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS backfill_history (
                name text PRIMARY KEY,
                checksum integer NOT NULL,
                started_at timestamptz NOT NULL DEFAULT NOW(),
                completed_at timestamptz
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create backfill_history table")?;

        Ok(())
    }

    async fn recorded_checksum(&self, name: &str) -> Result<Option<i32>> {
        let row: Option<(i32,)> =
            sqlx::query_as("SELECT checksum FROM backfill_history WHERE name = $1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(checksum,)| checksum))
    }

    async fn record_pending(&self, name: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO backfill_history (name, checksum)
            VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET
                started_at = NOW(),
                completed_at = NULL
            "#,
        )
        .bind(name)
        .bind(PENDING_CHECKSUM)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_success(&self, name: &str, checksum: i32) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE backfill_history
            SET checksum = $2, completed_at = NOW()
            WHERE name = $1
            "#,
        )
        .bind(name)
        .bind(checksum)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn lock(&self) -> Result<MigrationLock> {
        // The advisory lock is session scoped, so the guard must keep the
        // connection it was taken on.
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("Failed to acquire connection for migration lock")?;

        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .fetch_one(&mut *conn)
            .await?;

        if !acquired {
            bail!("migration lock is held by another process");
        }

        Ok(MigrationLock { conn: Some(conn) })
    }

    async fn unlock(&self, lock: MigrationLock) -> Result<()> {
        let Some(mut conn) = lock.conn else {
            return Ok(());
        };

        let released: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .fetch_one(&mut *conn)
            .await?;

        if !released {
            tracing::warn!("advisory migration lock was not held at unlock time");
        }

        Ok(())
    }
}

/// In-memory store for exercising the runner without a database.
#[derive(Default)]
pub struct MemoryChecksumStore {
    records: Mutex<HashMap<String, i32>>,
}

impl MemoryChecksumStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChecksumStore for MemoryChecksumStore {
    async fn ensure_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn recorded_checksum(&self, name: &str) -> Result<Option<i32>> {
        Ok(self.records.lock().unwrap().get(name).copied())
    }

    async fn record_pending(&self, name: &str) -> Result<()> {
        self.records
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert(PENDING_CHECKSUM);
        Ok(())
    }

    async fn record_success(&self, name: &str, checksum: i32) -> Result<()> {
        self.records
            .lock()
            .unwrap()
            .insert(name.to_string(), checksum);
        Ok(())
    }

    async fn lock(&self) -> Result<MigrationLock> {
        Ok(MigrationLock::noop())
    }

    async fn unlock(&self, _lock: MigrationLock) -> Result<()> {
        Ok(())
    }
}
