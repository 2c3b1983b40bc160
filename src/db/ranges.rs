//! Range and stats persistence.
//!
//! The sieve upserts its `range` row as soon as it finishes; the estimator
//! refuses to run twice over the same range (`time_stats > 0`), then writes
//! the range row, the gap aggregates, and every per-m row inside a single
//! transaction so a crash never leaves a half-reported range.

use anyhow::{ensure, Result};
use sqlx::Row;

use super::Database;
use crate::config::Config;
use crate::estimator::GapStatsResult;

/// Aggregate rows below this in all three columns are not worth storing.
const MIN_STORED_PROB: f64 = 1e-10;

impl Database {
    /// Upsert the range row after a sieve run.
    pub async fn insert_range_sieve(
        &self,
        config: &Config,
        num_m: u64,
        time_sieve: f64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO range(rid, P, D, m_start, m_inc,
                               sieve_length, max_prime, min_merit, num_m, time_sieve)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(rid) DO UPDATE SET time_sieve = excluded.time_sieve",
        )
        .bind(config.rid() as i64)
        .bind(config.p as i64)
        .bind(config.d as i64)
        .bind(config.mstart as i64)
        .bind(config.minc as i64)
        .bind(config.sieve_length as i64)
        .bind(config.max_prime as i64)
        .bind(config.min_merit)
        .bind(num_m as i64)
        .bind(time_sieve)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Has the estimator already filled this range in?
    pub async fn is_range_processed(&self, config: &Config) -> Result<bool> {
        let count: i64 =
            sqlx::query("SELECT count(*) FROM range WHERE rid = ? AND time_stats > 0")
                .bind(config.rid() as i64)
                .fetch_one(&self.pool)
                .await?
                .get(0);
        Ok(count > 0)
    }

    /// Combined sieve+stats wall time, when a sieve run was recorded.
    pub async fn range_time(&self, config: &Config) -> Result<Option<f64>> {
        let row = sqlx::query(
            "SELECT time_sieve + time_stats FROM range WHERE rid = ? AND time_sieve > 0",
        )
        .bind(config.rid() as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get(0)))
    }

    /// Persist one whole stats run atomically.
    pub async fn store_stats(&self, config: &Config, result: &GapStatsResult) -> Result<()> {
        ensure!(
            !self.is_range_processed(config).await?,
            "range already processed"
        );

        let rid = config.rid() as i64;
        let num_rows = result.m_stats.len();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO range(rid, P, D, m_start, m_inc,
                               sieve_length, max_prime, min_merit,
                               num_m, num_remaining, time_stats)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(rid) DO UPDATE SET time_stats = excluded.time_stats,
                                            num_remaining = excluded.num_remaining",
        )
        .bind(rid)
        .bind(config.p as i64)
        .bind(config.d as i64)
        .bind(config.mstart as i64)
        .bind(config.minc as i64)
        .bind(config.sieve_length as i64)
        .bind(config.max_prime as i64)
        .bind(config.min_merit)
        .bind(num_rows as i64)
        .bind(num_rows as i64)
        .bind(result.seconds)
        .execute(&mut *tx)
        .await?;

        let mut skipped = 0usize;
        for gap in 1..result.prob_gap_norm.len() {
            let norm = result.prob_gap_norm[gap] as f64;
            let low = result.prob_gap_low[gap] as f64;
            let high = result.prob_gap_high[gap] as f64;
            if norm < MIN_STORED_PROB && low < MIN_STORED_PROB && high < MIN_STORED_PROB {
                skipped += 1;
                continue;
            }
            sqlx::query(
                "INSERT OR IGNORE INTO range_stats(rid, gap, prob_combined, prob_low_side, prob_high_side)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(rid)
            .bind(gap as i64)
            .bind(norm)
            .bind(low)
            .bind(high)
            .execute(&mut *tx)
            .await?;
        }
        if config.verbose >= 0 {
            println!(
                "saved {} rows to 'range_stats' table",
                result.prob_gap_norm.len() - 1 - skipped
            );
        }

        for (i, s) in result.m_stats.iter().enumerate() {
            let r = i + 1;
            if config.verbose >= 2
                && (r <= 2 || r % 10_000 == 0 || r == num_rows)
            {
                println!(
                    "saving row: {:6}/{} m={:<8} e: {:.1}, {:.1} | R: {:.1e} M: {:.1e} HM({:.1}): {:.1e}",
                    r, num_rows, s.m, s.e_next, s.e_prev,
                    s.prob_record, s.prob_missing, config.min_merit, s.prob_merit
                );
            }
            // IGNORE lets a range be re-run with a different max-prime or
            // sieve-length without clobbering rows it already owns.
            sqlx::query(
                "INSERT OR IGNORE INTO m_stats(rid, P, D, m,
                                               prob_record, prob_missing, prob_merit,
                                               e_gap_next, e_gap_prev)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(rid)
            .bind(config.p as i64)
            .bind(config.d as i64)
            .bind(s.m as i64)
            .bind(s.prob_record as f64)
            .bind(s.prob_missing as f64)
            .bind(s.prob_merit as f64)
            .bind(s.e_next as f64)
            .bind(s.e_prev as f64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        if config.verbose >= 0 {
            println!("saved {} rows to 'm_stats' table", num_rows);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    //! Sink behaviour against a real on-disk SQLite file: rid round-trip,
    //! the duplicate-range refusal, and the tiny-probability skip rule.

    use super::*;
    use crate::estimator::MStat;
    use sqlx::Row;
    use std::path::PathBuf;

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            p: 503,
            d: 2310,
            mstart: 1,
            minc: 100,
            sieve_length: 5000,
            max_prime: 100_000_000,
            min_merit: 18.0,
            save_unknowns: true,
            rle: false,
            method1: false,
            save_increments: false,
            validate_factors: false,
            verbose: -1,
            search_db: dir.join("gaps.db"),
            records_db: dir.join("records.db"),
            threads: 0,
        }
    }

    fn sample_result(si: usize) -> GapStatsResult {
        let mut prob_gap_norm = vec![0.0f32; si];
        let mut prob_gap_low = vec![0.0f32; si];
        let prob_gap_high = vec![0.0f32; si];
        prob_gap_norm[100] = 1e-3;
        prob_gap_low[40] = 1e-4;
        // Everything below the storage floor in all three columns.
        prob_gap_norm[200] = 1e-12;
        GapStatsResult {
            m_stats: vec![
                MStat {
                    m: 1,
                    e_prev: 900.0,
                    e_next: 950.0,
                    prob_seen: 0.99,
                    prob_record: 1e-6,
                    prob_missing: 1e-11,
                    prob_merit: 1e-4,
                    unknowns: (120, 118),
                },
                MStat {
                    m: 13,
                    e_prev: 850.0,
                    e_next: 870.0,
                    prob_seen: 0.98,
                    prob_record: 2e-6,
                    prob_missing: 0.0,
                    prob_merit: 2e-4,
                    unknowns: (119, 121),
                },
            ],
            prob_gap_norm,
            prob_gap_low,
            prob_gap_high,
            seconds: 3.5,
        }
    }

    #[test]
    fn range_roundtrip_and_duplicate_refusal() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let config = test_config(dir.path());
            let db = Database::connect(&config.search_db).await.unwrap();

            db.insert_range_sieve(&config, 80, 12.25).await.unwrap();
            assert!(!db.is_range_processed(&config).await.unwrap());
            assert_eq!(db.range_time(&config).await.unwrap(), Some(12.25));

            // The stored row re-derives the same rid.
            let row = sqlx::query("SELECT rid, P, D, m_start, m_inc, sieve_length, max_prime FROM range")
                .fetch_one(db.pool())
                .await
                .unwrap();
            let stored_rid: i64 = row.get(0);
            assert_eq!(stored_rid, config.rid() as i64);

            let result = sample_result(2 * config.sieve_length as usize + 1);
            db.store_stats(&config, &result).await.unwrap();
            assert!(db.is_range_processed(&config).await.unwrap());

            // Second stats run over the same range must refuse.
            assert!(db.store_stats(&config, &result).await.is_err());

            // A sieve re-run may still update its timing.
            db.insert_range_sieve(&config, 80, 14.0).await.unwrap();
            assert_eq!(db.range_time(&config).await.unwrap(), Some(14.0 + 3.5));
        });
    }

    #[test]
    fn tiny_probabilities_are_skipped() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let config = test_config(dir.path());
            let db = Database::connect(&config.search_db).await.unwrap();
            let result = sample_result(2 * config.sieve_length as usize + 1);
            db.store_stats(&config, &result).await.unwrap();

            let gaps: Vec<i64> = sqlx::query("SELECT gap FROM range_stats ORDER BY gap")
                .fetch_all(db.pool())
                .await
                .unwrap()
                .iter()
                .map(|r| r.get(0))
                .collect();
            // Gap 200 fell below the floor in all three columns.
            assert_eq!(gaps, vec![40, 100]);

            let m_rows: Vec<i64> = sqlx::query("SELECT m FROM m_stats ORDER BY m")
                .fetch_all(db.pool())
                .await
                .unwrap()
                .iter()
                .map(|r| r.get(0))
                .collect();
            assert_eq!(m_rows, vec![1, 13]);
        });
    }

    #[test]
    fn records_db_must_exist() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let missing = PathBuf::from("/nonexistent/records.db");
            assert!(Database::open_records(&missing).await.is_err());
        });
    }
}
