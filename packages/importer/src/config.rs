use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub backfill: BackfillConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .context("DATABASE_URL must be set")?,
            backfill: BackfillConfig::from_env()?,
        })
    }
}

/// Tuning knobs for the registered backfill migrations.
///
/// Network-specific constants (snapshot lower bounds, window widths) live
/// here instead of as statics so deployments against different networks can
/// override them per environment.
#[derive(Debug, Clone, Default)]
pub struct BackfillConfig {
    pub balances: BalancesConfig,
    pub transaction_hash: TransactionHashConfig,
}

impl BackfillConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            balances: BalancesConfig {
                lower_bound_ns: env_i64(
                    "BACKFILL_BALANCES_LOWER_BOUND_NS",
                    BalancesConfig::default().lower_bound_ns,
                )?,
            },
            transaction_hash: TransactionHashConfig {
                window_ns: env_i64(
                    "BACKFILL_TRANSACTION_HASH_WINDOW_NS",
                    TransactionHashConfig::default().window_ns,
                )?,
            },
        })
    }
}

/// Configuration for the balance snapshot backfill
#[derive(Debug, Clone, Default)]
pub struct BalancesConfig {
    /// Balance files at or below this consensus timestamp are covered by the
    /// genesis snapshot and are never backfilled.
    pub lower_bound_ns: i64,
}

/// Configuration for the transaction hash backfill
#[derive(Debug, Clone)]
pub struct TransactionHashConfig {
    /// Width of one backfill window in nanoseconds of consensus time.
    pub window_ns: i64,
}

impl Default for TransactionHashConfig {
    fn default() -> Self {
        // One hour of consensus time per chunk
        Self {
            window_ns: 3_600 * 1_000_000_000,
        }
    }
}

fn env_i64(key: &str, default: i64) -> Result<i64> {
    match env::var(key) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("{} must be a valid integer", key)),
        Err(_) => Ok(default),
    }
}
