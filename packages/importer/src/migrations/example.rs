//! Example backfill migration demonstrating the pattern
//!
//! This is a template migration that shows how to implement the
//! BackfillMigration trait. Copy this file and modify for your specific
//! migration needs.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;

use super::BackfillMigration;

/// Example migration that fills a default balance for entities created
/// before the column existed
///
/// It shows how to:
/// 1. Derive the cursor from durable state (here: restart from the origin,
///    since each chunk is a cheap no-op over already-fixed rows)
/// 2. Process rows in bounded id-ordered chunks
/// 3. Make each chunk idempotent so crash/resume is safe
pub struct ExampleMigration;

const CHUNK_SIZE: i64 = 100;

#[async_trait]
impl BackfillMigration for ExampleMigration {
    type Cursor = i64;

    fn name(&self) -> &'static str {
        "example_migration"
    }

    fn description(&self) -> &'static str {
        "Example migration demonstrating the pattern"
    }

    fn success_checksum(&self) -> i32 {
        // Bump this to force a rerun once the migration's logic changes.
        1
    }

    async fn initial_cursor(&self, _db: &PgPool) -> Result<i64> {
        // Position inside interleaved rows is not derivable here, so resume
        // re-scans from the start; chunks that were already applied fall
        // through the WHERE clause as no-ops.
        Ok(0)
    }

    async fn step(&self, cursor: i64, db: &PgPool) -> Result<Option<i64>> {
        // Fix the next chunk of rows above the cursor, ordered by id for
        // stable cursoring.
        let ids: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT id
            FROM entity
            WHERE balance IS NULL
              AND id > $1
            ORDER BY id
            LIMIT $2
            "#,
        )
        .bind(cursor)
        .bind(CHUNK_SIZE)
        .fetch_all(db)
        .await?;

        let Some((last_id,)) = ids.last().copied() else {
            return Ok(None);
        };

        // The WHERE clause makes re-application a no-op.
        sqlx::query(
            r#"
            UPDATE entity
            SET balance = 0
            WHERE balance IS NULL
              AND id > $1 AND id <= $2
            "#,
        )
        .bind(cursor)
        .bind(last_id)
        .execute(db)
        .await?;

        Ok(Some(last_id))
    }
}
