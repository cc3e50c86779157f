//! Backfill the transaction hash lookup table.
//!
//! The `transaction_hash` table lets clients resolve a transaction by its
//! hash without scanning the main table; rows ingested before the table
//! existed have to be copied in after the fact. The migration copies fixed
//! consensus-time windows so each chunk stays bounded regardless of traffic.
//!
//! Cursor: the upper bound of the last filled window. Re-derived from the
//! target table itself, so a crash between windows costs nothing, and the
//! insert is conflict-free on re-application.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;
use tracing::info;

use super::BackfillMigration;
use crate::config::TransactionHashConfig;

pub struct BackfillTransactionHashMigration {
    config: TransactionHashConfig,
}

impl BackfillTransactionHashMigration {
    pub fn new(config: TransactionHashConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BackfillMigration for BackfillTransactionHashMigration {
    type Cursor = i64;

    fn name(&self) -> &'static str {
        "backfill_transaction_hash"
    }

    fn description(&self) -> &'static str {
        "Populate the transaction hash lookup table in consensus-time windows"
    }

    fn success_checksum(&self) -> i32 {
        2
    }

    async fn initial_cursor(&self, db: &PgPool) -> Result<i64> {
        // Resume just past the highest hash already copied; on a fresh table,
        // start just before the earliest transaction so the first window
        // covers it.
        let (cursor,): (i64,) = sqlx::query_as(
            r#"
            SELECT GREATEST(
                COALESCE((SELECT MAX(consensus_timestamp) FROM transaction_hash), 0),
                COALESCE((SELECT MIN(consensus_timestamp) - 1 FROM transaction), 0)
            )
            "#,
        )
        .fetch_one(db)
        .await?;

        Ok(cursor)
    }

    async fn step(&self, cursor: i64, db: &PgPool) -> Result<Option<i64>> {
        let (max_timestamp,): (Option<i64>,) =
            sqlx::query_as("SELECT MAX(consensus_timestamp) FROM transaction")
                .fetch_one(db)
                .await?;

        let Some(max_timestamp) = max_timestamp else {
            return Ok(None);
        };

        if cursor >= max_timestamp {
            return Ok(None);
        }

        let window_end = cursor.saturating_add(self.config.window_ns);

        let copied = sqlx::query(
            r#"
            INSERT INTO transaction_hash (hash, consensus_timestamp, payer_account_id)
            SELECT hash, consensus_timestamp, payer_account_id
            FROM transaction
            WHERE consensus_timestamp > $1 AND consensus_timestamp <= $2
            ON CONFLICT (consensus_timestamp) DO NOTHING
            "#,
        )
        .bind(cursor)
        .bind(window_end)
        .execute(db)
        .await?
        .rows_affected();

        info!(
            window_start = cursor,
            window_end,
            copied,
            "filled transaction hash window"
        );

        Ok(Some(window_end))
    }
}
