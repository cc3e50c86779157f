//! CLI for executing backfill migrations
//!
//! Used by operators and deployment tooling to inspect and drive backfills
//! outside the importer's background pass. Outputs one JSON document per
//! invocation for machine parsing.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use importer_core::config::Config;
use importer_core::history::PgChecksumStore;
use importer_core::migrations::{all_migrations, PENDING_CHECKSUM};
use importer_core::runner::{RunOutcome, Runner};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "migrate_cli")]
#[command(about = "Backfill migration CLI for the mirror node importer")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List all registered migrations
    List,

    /// Show a migration's gate status
    Status { name: String },

    /// Run a single migration to completion
    Run { name: String },

    /// Run every pending migration in registration order
    RunAll,
}

// ============================================================================
// JSON Response Types
// ============================================================================

#[derive(Serialize)]
struct Response {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    migrations: Option<Vec<MigrationInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<StatusResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcomes: Option<Vec<OutcomeInfo>>,
}

impl Response {
    fn ok(message: Option<String>) -> Self {
        Self {
            success: true,
            message,
            migrations: None,
            status: None,
            outcomes: None,
        }
    }

    fn error(message: String) -> Self {
        Self {
            success: false,
            message: Some(message),
            migrations: None,
            status: None,
            outcomes: None,
        }
    }
}

#[derive(Serialize)]
struct MigrationInfo {
    name: String,
    description: Option<String>,
}

#[derive(Serialize)]
struct StatusResponse {
    name: String,
    recorded_checksum: i32,
    success_checksum: i32,
    complete: bool,
}

#[derive(Serialize)]
struct OutcomeInfo {
    name: String,
    outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    steps: Option<u64>,
}

impl OutcomeInfo {
    fn new(name: String, outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::AlreadyComplete => Self {
                name,
                outcome: "already_complete".to_string(),
                steps: None,
            },
            RunOutcome::Completed { steps } => Self {
                name,
                outcome: "completed".to_string(),
                steps: Some(steps),
            },
        }
    }
}

fn output(resp: Response) {
    println!("{}", serde_json::to_string(&resp).unwrap());
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,importer_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::List => cmd_list(),
        Commands::Status { name } => cmd_status(&name).await,
        Commands::Run { name } => cmd_run(&name).await,
        Commands::RunAll => cmd_run_all().await,
    }
}

async fn connect(config: &Config) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")
}

fn build_runner(config: &Config, pool: &PgPool) -> Result<Runner<PgChecksumStore>> {
    let store = PgChecksumStore::new(pool.clone());
    Runner::new(store, all_migrations(&config.backfill)).map_err(Into::into)
}

// ============================================================================
// Commands
// ============================================================================

fn cmd_list() -> Result<()> {
    let config = importer_core::config::BackfillConfig::default();
    let migrations: Vec<MigrationInfo> = all_migrations(&config)
        .into_iter()
        .map(|m| MigrationInfo {
            name: m.name().to_string(),
            description: {
                let desc = m.description();
                if desc.is_empty() {
                    None
                } else {
                    Some(desc.to_string())
                }
            },
        })
        .collect();

    output(Response {
        migrations: Some(migrations),
        ..Response::ok(None)
    });

    Ok(())
}

async fn cmd_status(name: &str) -> Result<()> {
    let config = Config::from_env()?;
    let pool = connect(&config).await?;
    let runner = build_runner(&config, &pool)?;

    let recorded = match runner.checksum(name).await {
        Ok(c) => c,
        Err(e) => {
            output(Response::error(e.to_string()));
            std::process::exit(1);
        }
    };
    let complete = match runner.is_complete(name).await {
        Ok(c) => c,
        Err(e) => {
            output(Response::error(e.to_string()));
            std::process::exit(1);
        }
    };

    let success = importer_core::migrations::find_migration(name, &config.backfill)
        .map(|m| m.success_checksum())
        .unwrap_or(PENDING_CHECKSUM);

    output(Response {
        status: Some(StatusResponse {
            name: name.to_string(),
            recorded_checksum: recorded,
            success_checksum: success,
            complete,
        }),
        ..Response::ok(None)
    });

    Ok(())
}

async fn cmd_run(name: &str) -> Result<()> {
    let config = Config::from_env()?;
    let pool = connect(&config).await?;
    let runner = build_runner(&config, &pool)?;

    match runner.run(name, &pool).await {
        Ok(outcome) => {
            output(Response {
                outcomes: Some(vec![OutcomeInfo::new(name.to_string(), outcome)]),
                ..Response::ok(Some(format!("Migration '{}' finished", name)))
            });
            Ok(())
        }
        Err(e) => {
            output(Response::error(format!("{:#}", anyhow::Error::from(e))));
            std::process::exit(1);
        }
    }
}

async fn cmd_run_all() -> Result<()> {
    let config = Config::from_env()?;
    let pool = connect(&config).await?;
    let runner = build_runner(&config, &pool)?;

    match runner.run_all(&pool).await {
        Ok(outcomes) => {
            let infos: Vec<OutcomeInfo> = outcomes
                .into_iter()
                .map(|(name, outcome)| OutcomeInfo::new(name, outcome))
                .collect();

            output(Response {
                outcomes: Some(infos),
                ..Response::ok(Some("All migrations finished".to_string()))
            });
            Ok(())
        }
        Err(e) => {
            output(Response::error(format!("{:#}", anyhow::Error::from(e))));
            std::process::exit(1);
        }
    }
}
