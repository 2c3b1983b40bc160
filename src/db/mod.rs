//! # Database — SQLite Storage Layer
//!
//! Two databases, both plain SQLite files:
//!
//! - the **search db** (read-write): `range`, `range_stats`, `m_stats` —
//!   one row per sieved range, per-gap aggregates, and per-m probabilities.
//! - the **records db** (read-only): the `gaps(gapsize, merit)` table
//!   published by the record-keeping project.
//!
//! ## Schema
//!
//! `range` is keyed by `rid`, the stable hash of the configuration
//! fingerprint; `range_stats` and `m_stats` reference it. Stored as SQLite
//! INTEGER (i64) — the u64 hash round-trips through a bit-cast.
//!
//! ## Sync Wrapper
//!
//! The engines are synchronous (rayon inside); database calls are async
//! sqlx. The CLI owns a Tokio runtime and bridges with `block_on` at the
//! few call sites (connect, range upsert, the stats transaction). This is
//! safe because engine threads are not Tokio tasks.

mod ranges;
mod records;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

/// Wait budget for the stats transaction when another writer holds the db.
const BUSY_TIMEOUT: Duration = Duration::from_secs(60);

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the search database and ensure the schema.
    pub async fn connect(path: &Path) -> Result<Database> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("opening search db {}", path.display()))?;

        for ddl in [
            "CREATE TABLE IF NOT EXISTS range(
                rid INTEGER PRIMARY KEY,
                P INTEGER NOT NULL,
                D INTEGER NOT NULL,
                m_start INTEGER NOT NULL,
                m_inc INTEGER NOT NULL,
                sieve_length INTEGER NOT NULL,
                max_prime INTEGER NOT NULL,
                min_merit REAL NOT NULL,
                num_m INTEGER NOT NULL,
                num_remaining INTEGER,
                time_sieve REAL NOT NULL DEFAULT 0,
                time_stats REAL NOT NULL DEFAULT 0)",
            "CREATE TABLE IF NOT EXISTS range_stats(
                rid INTEGER NOT NULL,
                gap INTEGER NOT NULL,
                prob_combined REAL NOT NULL,
                prob_low_side REAL NOT NULL,
                prob_high_side REAL NOT NULL,
                PRIMARY KEY (rid, gap))",
            "CREATE TABLE IF NOT EXISTS m_stats(
                rid INTEGER NOT NULL,
                P INTEGER NOT NULL,
                D INTEGER NOT NULL,
                m INTEGER NOT NULL,
                prob_record REAL NOT NULL,
                prob_missing REAL NOT NULL,
                prob_merit REAL NOT NULL,
                e_gap_next REAL NOT NULL,
                e_gap_prev REAL NOT NULL,
                PRIMARY KEY (rid, m))",
        ] {
            sqlx::query(ddl).execute(&pool).await?;
        }

        Ok(Database { pool })
    }

    /// Open the records database; it must already exist.
    pub async fn open_records(path: &Path) -> Result<Database> {
        anyhow::ensure!(
            path.exists(),
            "records db {} does not exist",
            path.display()
        );
        let options = SqliteConnectOptions::new()
            .filename(path)
            .read_only(true)
            .immutable(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("opening records db {}", path.display()))?;
        Ok(Database { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
