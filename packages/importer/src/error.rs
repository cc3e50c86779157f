use thiserror::Error;

/// Failure modes of the backfill runner.
///
/// Step errors are not retried; the run aborts without recording success and
/// the next run resumes from the cursor re-derived out of durable state.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("migration '{0}' is not registered")]
    UnknownMigration(String),

    #[error("migration '{name}' declares the pending sentinel as its success checksum")]
    InvalidChecksum { name: String },

    #[error("migration '{name}' failed")]
    Step {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
