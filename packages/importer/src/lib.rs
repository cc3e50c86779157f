// Mirror Node Importer - Historical Backfill Core
//
// This crate provides the resumable backfill framework used by the importer
// to repair or compute historical data after the fact: balance snapshots,
// transaction hash lookups, and similar long-running chunked passes over
// already-ingested rows.
//
// Concrete migrations live in migrations/*; the runner drives them through
// the checksum gate recorded in the bookkeeping table.

pub mod config;
pub mod error;
pub mod history;
pub mod migrations;
pub mod runner;

pub use config::*;
