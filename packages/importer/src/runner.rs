//! Drives registered backfill migrations through the checksum gate.
//!
//! The runner owns the lifecycle: check the gate, record the pending
//! sentinel, loop the migration's step function to completion, record the
//! success checksum. It never persists cursors; resume position is always
//! re-derived by the migration from durable domain state.

use sqlx::PgPool;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::RunnerError;
use crate::history::ChecksumStore;
use crate::migrations::{ErasedMigration, PENDING_CHECKSUM};

/// Outcome of pushing a single migration through the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The recorded checksum already matched the success checksum.
    AlreadyComplete,
    /// Ran to completion in this pass; success checksum recorded.
    Completed { steps: u64 },
}

/// Sequential, single-worker runner for backfill migrations.
pub struct Runner<S> {
    store: S,
    migrations: Vec<Box<dyn ErasedMigration>>,
}

impl<S: ChecksumStore> Runner<S> {
    /// Build a runner over `migrations` in execution order.
    ///
    /// Rejects any migration whose success checksum collides with the
    /// pending sentinel, since the gate could never see it complete.
    pub fn new(store: S, migrations: Vec<Box<dyn ErasedMigration>>) -> Result<Self, RunnerError> {
        for migration in &migrations {
            if migration.success_checksum() == PENDING_CHECKSUM {
                return Err(RunnerError::InvalidChecksum {
                    name: migration.name().to_string(),
                });
            }
        }

        Ok(Self { store, migrations })
    }

    /// The checksum the outer gate sees for `name`.
    ///
    /// Deterministic from durable state only: the recorded value, or the
    /// pending sentinel when the migration has never started. Equals the
    /// success checksum exactly when the migration has fully completed.
    pub async fn checksum(&self, name: &str) -> Result<i32, RunnerError> {
        let migration = self.find(name)?;
        // Reads must work on a database no migration has ever touched.
        self.store.ensure_schema().await?;
        let recorded = self.store.recorded_checksum(migration.name()).await?;
        Ok(recorded.unwrap_or(PENDING_CHECKSUM))
    }

    /// Whether `name` has completed a full pass under its current checksum.
    pub async fn is_complete(&self, name: &str) -> Result<bool, RunnerError> {
        let migration = self.find(name)?;
        self.store.ensure_schema().await?;
        let recorded = self.store.recorded_checksum(migration.name()).await?;
        Ok(recorded == Some(migration.success_checksum()))
    }

    /// Run a single migration to completion through the gate.
    pub async fn run(&self, name: &str, db: &PgPool) -> Result<RunOutcome, RunnerError> {
        let migration = self.find(name)?;
        self.store.ensure_schema().await?;

        let lock = self.store.lock().await?;
        let result = self.run_gated(migration, db).await;
        if let Err(e) = self.store.unlock(lock).await {
            warn!(error = %e, "failed to release migration lock");
        }

        result
    }

    /// Run every pending migration sequentially in registration order,
    /// stopping at the first failure (fail-fast, matching startup semantics).
    ///
    /// Consumes the runner: at most one full pass per process lifetime.
    pub async fn run_all(self, db: &PgPool) -> Result<Vec<(String, RunOutcome)>, RunnerError> {
        self.store.ensure_schema().await?;

        let lock = self.store.lock().await?;
        let mut outcomes = Vec::with_capacity(self.migrations.len());
        let mut failure = None;

        for migration in &self.migrations {
            match self.run_gated(migration.as_ref(), db).await {
                Ok(outcome) => outcomes.push((migration.name().to_string(), outcome)),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Err(e) = self.store.unlock(lock).await {
            warn!(error = %e, "failed to release migration lock");
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(outcomes),
        }
    }

    async fn run_gated(
        &self,
        migration: &dyn ErasedMigration,
        db: &PgPool,
    ) -> Result<RunOutcome, RunnerError> {
        let name = migration.name();
        let success = migration.success_checksum();

        if self.store.recorded_checksum(name).await? == Some(success) {
            info!(migration = name, "already complete; skipping");
            return Ok(RunOutcome::AlreadyComplete);
        }

        self.store.record_pending(name).await?;
        info!(migration = name, "starting backfill");

        let steps = migration
            .run_to_completion(db)
            .await
            .map_err(|source| RunnerError::Step {
                name: name.to_string(),
                source,
            })?;

        self.store.record_success(name, success).await?;
        info!(migration = name, steps, "backfill complete");

        Ok(RunOutcome::Completed { steps })
    }

    fn find(&self, name: &str) -> Result<&dyn ErasedMigration, RunnerError> {
        self.migrations
            .iter()
            .find(|m| m.name() == name)
            .map(|m| m.as_ref())
            .ok_or_else(|| RunnerError::UnknownMigration(name.to_string()))
    }
}

impl<S: ChecksumStore + 'static> Runner<S> {
    /// Run all pending migrations on a detached background task so startup
    /// is never blocked on a long backfill. A step failure aborts the pass
    /// and is surfaced in the logs; the next process start resumes.
    pub fn spawn(self, db: PgPool) -> JoinHandle<()> {
        tokio::spawn(async move {
            match self.run_all(&db).await {
                Ok(outcomes) => {
                    info!(migrations = outcomes.len(), "background backfill pass finished")
                }
                Err(e) => error!(error = %e, "background backfill pass failed"),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use anyhow::Result;
    use async_trait::async_trait;
    use sqlx::PgPool;

    use super::*;
    use crate::history::MemoryChecksumStore;
    use crate::migrations::BackfillMigration;

    /// Pool that is never connected; the fake migrations ignore it.
    fn unused_pool() -> PgPool {
        PgPool::connect_lazy("postgres://localhost/unused").unwrap()
    }

    /// Stand-in for durable domain state: checkpoints that have been applied
    /// survive "process restarts" because the state outlives the runner.
    #[derive(Default)]
    struct CheckpointState {
        applied: Vec<i64>,
        cursors_seen: Vec<i64>,
        fail_on_call: Option<u64>,
        calls: u64,
    }

    /// Migration advancing through fixed checkpoints, one per step.
    struct CheckpointMigration {
        checkpoints: Vec<i64>,
        state: Arc<Mutex<CheckpointState>>,
    }

    impl CheckpointMigration {
        fn new(checkpoints: Vec<i64>) -> (Self, Arc<Mutex<CheckpointState>>) {
            let state = Arc::new(Mutex::new(CheckpointState::default()));
            (
                Self {
                    checkpoints,
                    state: state.clone(),
                },
                state,
            )
        }
    }

    #[async_trait]
    impl BackfillMigration for CheckpointMigration {
        type Cursor = i64;

        fn name(&self) -> &'static str {
            "checkpoint"
        }

        fn success_checksum(&self) -> i32 {
            42
        }

        async fn initial_cursor(&self, _db: &PgPool) -> Result<i64> {
            let state = self.state.lock().unwrap();
            Ok(state.applied.last().copied().unwrap_or(0))
        }

        async fn step(&self, cursor: i64, _db: &PgPool) -> Result<Option<i64>> {
            let mut state = self.state.lock().unwrap();
            state.calls += 1;
            state.cursors_seen.push(cursor);

            if state.fail_on_call == Some(state.calls) {
                anyhow::bail!("injected step failure");
            }

            let next = self.checkpoints.iter().copied().find(|c| *c > cursor);
            if let Some(next) = next {
                // Re-applying an already-applied checkpoint is a no-op.
                if !state.applied.contains(&next) {
                    state.applied.push(next);
                }
            }

            Ok(next)
        }
    }

    /// Store whose reads fail until the schema has been bootstrapped, the
    /// way a relational store does on a fresh database.
    #[derive(Default)]
    struct SchemaRequiredStore {
        ready: std::sync::atomic::AtomicBool,
        inner: MemoryChecksumStore,
    }

    #[async_trait]
    impl ChecksumStore for SchemaRequiredStore {
        async fn ensure_schema(&self) -> Result<()> {
            self.ready.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        async fn recorded_checksum(&self, name: &str) -> Result<Option<i32>> {
            if !self.ready.load(std::sync::atomic::Ordering::SeqCst) {
                anyhow::bail!("relation \"backfill_history\" does not exist");
            }
            self.inner.recorded_checksum(name).await
        }

        async fn record_pending(&self, name: &str) -> Result<()> {
            self.inner.record_pending(name).await
        }

        async fn record_success(&self, name: &str, checksum: i32) -> Result<()> {
            self.inner.record_success(name, checksum).await
        }

        async fn lock(&self) -> Result<crate::history::MigrationLock> {
            self.inner.lock().await
        }

        async fn unlock(&self, lock: crate::history::MigrationLock) -> Result<()> {
            self.inner.unlock(lock).await
        }
    }

    /// Migration with an invalid success checksum, for constructor tests.
    struct SentinelChecksumMigration;

    #[async_trait]
    impl BackfillMigration for SentinelChecksumMigration {
        type Cursor = i64;

        fn name(&self) -> &'static str {
            "sentinel"
        }

        fn success_checksum(&self) -> i32 {
            PENDING_CHECKSUM
        }

        async fn initial_cursor(&self, _db: &PgPool) -> Result<i64> {
            Ok(0)
        }

        async fn step(&self, _cursor: i64, _db: &PgPool) -> Result<Option<i64>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn advances_through_checkpoints_then_records_success() {
        let (migration, state) = CheckpointMigration::new(vec![10, 20, 30]);
        let runner = Runner::new(MemoryChecksumStore::new(), vec![Box::new(migration)]).unwrap();
        let db = unused_pool();

        // Pending sentinel before the migration ever starts.
        assert_eq!(runner.checksum("checkpoint").await.unwrap(), PENDING_CHECKSUM);
        assert!(!runner.is_complete("checkpoint").await.unwrap());

        let outcome = runner.run("checkpoint", &db).await.unwrap();

        // step(0)=10, step(10)=20, step(20)=30, step(30)=done
        assert_eq!(outcome, RunOutcome::Completed { steps: 4 });
        assert_eq!(runner.checksum("checkpoint").await.unwrap(), 42);
        assert!(runner.is_complete("checkpoint").await.unwrap());
        assert_eq!(state.lock().unwrap().applied, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn completed_migration_is_skipped_on_rerun() {
        let (migration, state) = CheckpointMigration::new(vec![10, 20]);
        let runner = Runner::new(MemoryChecksumStore::new(), vec![Box::new(migration)]).unwrap();
        let db = unused_pool();

        runner.run("checkpoint", &db).await.unwrap();
        let calls_after_first = state.lock().unwrap().calls;

        let outcome = runner.run("checkpoint", &db).await.unwrap();
        assert_eq!(outcome, RunOutcome::AlreadyComplete);
        assert_eq!(state.lock().unwrap().calls, calls_after_first);
    }

    #[tokio::test]
    async fn failed_step_leaves_checksum_divergent_and_resumes() {
        let (migration, state) = CheckpointMigration::new(vec![10, 20, 30]);
        state.lock().unwrap().fail_on_call = Some(3);
        let runner = Runner::new(MemoryChecksumStore::new(), vec![Box::new(migration)]).unwrap();
        let db = unused_pool();

        let err = runner.run("checkpoint", &db).await.unwrap_err();
        assert!(matches!(err, RunnerError::Step { .. }));

        // No success recorded mid-way.
        assert_eq!(runner.checksum("checkpoint").await.unwrap(), PENDING_CHECKSUM);
        assert!(!runner.is_complete("checkpoint").await.unwrap());

        // The rerun resumes from the cursor the second invocation returned.
        let outcome = runner.run("checkpoint", &db).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed { steps: 2 });

        let state = state.lock().unwrap();
        assert_eq!(state.cursors_seen, vec![0, 10, 20, 20, 30]);
        assert_eq!(state.applied, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn interrupted_run_converges_to_same_final_state() {
        // Uninterrupted baseline.
        let (baseline, baseline_state) = CheckpointMigration::new(vec![10, 20, 30]);
        let runner = Runner::new(MemoryChecksumStore::new(), vec![Box::new(baseline)]).unwrap();
        let db = unused_pool();
        runner.run("checkpoint", &db).await.unwrap();

        // Crash after the first step, then restart.
        let (crashing, crashing_state) = CheckpointMigration::new(vec![10, 20, 30]);
        crashing_state.lock().unwrap().fail_on_call = Some(2);
        let runner = Runner::new(MemoryChecksumStore::new(), vec![Box::new(crashing)]).unwrap();
        runner.run("checkpoint", &db).await.unwrap_err();
        runner.run("checkpoint", &db).await.unwrap();

        assert_eq!(
            baseline_state.lock().unwrap().applied,
            crashing_state.lock().unwrap().applied
        );
    }

    #[tokio::test]
    async fn reapplying_a_step_at_the_same_cursor_is_a_noop() {
        let (migration, state) = CheckpointMigration::new(vec![10]);
        let db = unused_pool();

        migration.step(0, &db).await.unwrap();
        migration.step(0, &db).await.unwrap();

        assert_eq!(state.lock().unwrap().applied, vec![10]);
    }

    #[tokio::test]
    async fn run_all_stops_at_first_failure() {
        let (first, first_state) = CheckpointMigration::new(vec![10]);
        first_state.lock().unwrap().fail_on_call = Some(1);
        let (second, second_state) = CheckpointMigration::new(vec![10]);

        let runner = Runner::new(
            MemoryChecksumStore::new(),
            vec![Box::new(first), Box::new(second)],
        )
        .unwrap();
        let db = unused_pool();

        runner.run_all(&db).await.unwrap_err();
        assert_eq!(second_state.lock().unwrap().calls, 0);
    }

    #[tokio::test]
    async fn status_reads_bootstrap_history_storage() {
        let (migration, _state) = CheckpointMigration::new(vec![10]);
        let runner =
            Runner::new(SchemaRequiredStore::default(), vec![Box::new(migration)]).unwrap();

        // Before any run the gate must still answer, not surface a missing
        // bookkeeping table.
        assert_eq!(runner.checksum("checkpoint").await.unwrap(), PENDING_CHECKSUM);
        assert!(!runner.is_complete("checkpoint").await.unwrap());
    }

    #[tokio::test]
    async fn unknown_migration_is_rejected() {
        let runner: Runner<MemoryChecksumStore> =
            Runner::new(MemoryChecksumStore::new(), vec![]).unwrap();
        let err = runner.checksum("nope").await.unwrap_err();
        assert!(matches!(err, RunnerError::UnknownMigration(_)));
    }

    #[test]
    fn sentinel_success_checksum_is_rejected() {
        let err = Runner::new(
            MemoryChecksumStore::new(),
            vec![Box::new(SentinelChecksumMigration)],
        )
        .map(|_| ())
        .unwrap_err();
        assert!(matches!(err, RunnerError::InvalidChecksum { .. }));
    }
}
