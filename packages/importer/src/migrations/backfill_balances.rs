//! Backfill per-account balance snapshots from transfer history.
//!
//! Older deployments only persisted the raw balance files; the queryable
//! `account_balance` table was introduced later. This migration walks the
//! balance file timestamps in consensus order and materializes the snapshot
//! each file represents by summing `crypto_transfer` rows up to that instant.
//!
//! Cursor: the consensus timestamp of the last materialized balance file,
//! re-derived on every run as `MAX(account_balance.consensus_timestamp)`.
//! Re-running a chunk is a no-op thanks to `ON CONFLICT DO NOTHING` on the
//! snapshot's composite key.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;
use tracing::info;

use super::BackfillMigration;
use crate::config::BalancesConfig;

pub struct BackfillBalancesMigration {
    config: BalancesConfig,
}

impl BackfillBalancesMigration {
    pub fn new(config: BalancesConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BackfillMigration for BackfillBalancesMigration {
    type Cursor = i64;

    fn name(&self) -> &'static str {
        "backfill_balances"
    }

    fn description(&self) -> &'static str {
        "Materialize account balance snapshots from balance files and transfer history"
    }

    fn success_checksum(&self) -> i32 {
        1
    }

    async fn initial_cursor(&self, db: &PgPool) -> Result<i64> {
        // The highest snapshot already materialized. Files at or below the
        // configured lower bound are covered by the genesis snapshot.
        let (cursor,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(consensus_timestamp), $1) FROM account_balance",
        )
        .bind(self.config.lower_bound_ns)
        .fetch_one(db)
        .await?;

        Ok(cursor)
    }

    async fn step(&self, cursor: i64, db: &PgPool) -> Result<Option<i64>> {
        let next_file: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT consensus_timestamp
            FROM account_balance_file
            WHERE consensus_timestamp > $1
            ORDER BY consensus_timestamp
            LIMIT 1
            "#,
        )
        .bind(cursor)
        .fetch_optional(db)
        .await?;

        let Some((file_timestamp,)) = next_file else {
            return Ok(None);
        };

        // One snapshot per transaction boundary.
        let mut tx = db.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO account_balance (consensus_timestamp, account_id, balance)
            SELECT $1, account_id, SUM(amount)
            FROM crypto_transfer
            WHERE consensus_timestamp <= $1
            GROUP BY account_id
            ON CONFLICT (consensus_timestamp, account_id) DO NOTHING
            "#,
        )
        .bind(file_timestamp)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        info!(
            consensus_timestamp = file_timestamp,
            accounts = inserted,
            "materialized balance snapshot"
        );

        Ok(Some(file_timestamp))
    }
}
