//! Resumable backfill migrations.
//!
//! Backfill migrations are different from schema migrations (sqlx):
//! - Schema migrations change the database structure
//! - Backfill migrations compute or repair historical data inside existing
//!   structures, in bounded chunks, without blocking startup
//!
//! # Contract
//!
//! Each migration must be:
//! - Idempotent: re-running a chunk over already-migrated rows is a no-op
//! - Resumable: the cursor is re-derived from durable domain state, never
//!   from in-memory flags, so a crash mid-pass loses nothing
//! - Gated: the success checksum is recorded only after a complete pass, so
//!   an interrupted migration stays pending and reruns on the next startup
//!
//! # Usage
//!
//! 1. Implement the `BackfillMigration` trait for your migration
//! 2. Register it in `all_migrations`
//! 3. Run via `migrate_cli run <name>` or let the background pass pick it up

pub mod backfill_balances;
pub mod backfill_transaction_hash;
pub mod example;

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;

use crate::config::BackfillConfig;

/// Sentinel checksum recorded while a migration has started but not finished.
/// The gate treats any recorded value other than the migration's success
/// checksum as pending.
pub const PENDING_CHECKSUM: i32 = -1;

/// Trait for implementing resumable backfill migrations
#[async_trait]
pub trait BackfillMigration: Send + Sync + 'static {
    /// Resume position. Owned by the migration; the runner treats it as an
    /// opaque value and never persists it.
    type Cursor: Clone + fmt::Debug + Send + Sync;

    /// Unique name for this migration (used as key in the history table)
    fn name(&self) -> &'static str;

    /// Optional description shown in the migration list
    fn description(&self) -> &'static str {
        ""
    }

    /// Constant per migration, recorded only after a complete pass. Bump it
    /// to force a rerun on the next startup. Must never equal
    /// `PENDING_CHECKSUM`.
    fn success_checksum(&self) -> i32;

    /// Derive the resume position from durable domain state.
    ///
    /// Called at the start of every run, including after a crash; it must
    /// not depend on anything the previous process held in memory.
    async fn initial_cursor(&self, db: &PgPool) -> Result<Self::Cursor>;

    /// Perform one bounded chunk of work at `cursor`.
    ///
    /// Returns the next cursor, or `None` when no work remains. The chunk's
    /// SQL must make re-application a no-op for rows it already migrated
    /// (range conditions, `ON CONFLICT DO NOTHING`, and the like).
    async fn step(&self, cursor: Self::Cursor, db: &PgPool) -> Result<Option<Self::Cursor>>;
}

/// Object-safe view over migrations with heterogeneous cursor types.
///
/// The blanket impl drives the step loop so the runner never sees a cursor.
#[async_trait]
pub trait ErasedMigration: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn success_checksum(&self) -> i32;

    /// Step from the initial cursor until end-of-work. Returns the number of
    /// step invocations.
    async fn run_to_completion(&self, db: &PgPool) -> Result<u64>;
}

#[async_trait]
impl<M: BackfillMigration> ErasedMigration for M {
    fn name(&self) -> &'static str {
        BackfillMigration::name(self)
    }

    fn description(&self) -> &'static str {
        BackfillMigration::description(self)
    }

    fn success_checksum(&self) -> i32 {
        BackfillMigration::success_checksum(self)
    }

    async fn run_to_completion(&self, db: &PgPool) -> Result<u64> {
        let mut cursor = self.initial_cursor(db).await?;
        let mut steps = 0u64;

        loop {
            steps += 1;
            match self.step(cursor, db).await? {
                Some(next) => {
                    tracing::debug!(
                        migration = BackfillMigration::name(self),
                        cursor = ?next,
                        steps,
                        "chunk applied"
                    );
                    cursor = next;
                }
                None => return Ok(steps),
            }
        }
    }
}

/// All registered migrations, in execution order.
///
/// Add new migrations to this function.
pub fn all_migrations(config: &BackfillConfig) -> Vec<Box<dyn ErasedMigration>> {
    vec![
        Box::new(backfill_balances::BackfillBalancesMigration::new(
            config.balances.clone(),
        )),
        Box::new(
            backfill_transaction_hash::BackfillTransactionHashMigration::new(
                config.transaction_hash.clone(),
            ),
        ),
        Box::new(example::ExampleMigration),
    ]
}

/// Find a migration by name
pub fn find_migration(name: &str, config: &BackfillConfig) -> Option<Box<dyn ErasedMigration>> {
    all_migrations(config).into_iter().find(|m| m.name() == name)
}
