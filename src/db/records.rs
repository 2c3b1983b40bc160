//! Record-gap table loading.
//!
//! The records database carries one `gaps(gapsize, merit)` row per known
//! gap; the in-memory table wants `ln(start prime) = gap / merit`.
//! Gaps beyond the table prefix are ignored (they are far past any merit
//! the estimator considers).

use anyhow::Result;
use sqlx::Row;

use super::Database;
use crate::records::RecordGaps;

impl Database {
    /// Load every known gap into `records`; returns the row count.
    pub async fn load_record_gaps(&self, records: &mut RecordGaps) -> Result<usize> {
        let rows = sqlx::query("SELECT gapsize, merit FROM gaps")
            .fetch_all(&self.pool)
            .await?;
        for row in &rows {
            let gap: i64 = row.get(0);
            let merit: f64 = row.get(1);
            if gap > 0 {
                records.insert(gap as u64, merit);
            }
        }
        Ok(rows.len())
    }
}

#[cfg(test)]
mod tests {
    //! Round-trip through a real SQLite file shaped like the published
    //! records database.

    use super::*;
    use crate::records::GAP_INF;
    use sqlx::sqlite::SqliteConnectOptions;
    use sqlx::SqlitePool;

    #[test]
    fn loads_gap_rows() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("records.db");
            {
                let pool = SqlitePool::connect_with(
                    SqliteConnectOptions::new().filename(&path).create_if_missing(true),
                )
                .await
                .unwrap();
                sqlx::query("CREATE TABLE gaps(gapsize INTEGER, merit REAL)")
                    .execute(&pool)
                    .await
                    .unwrap();
                sqlx::query("INSERT INTO gaps VALUES (100, 4.0), (6, 0.06)")
                    .execute(&pool)
                    .await
                    .unwrap();
                pool.close().await;
            }

            let db = Database::open_records(&path).await.unwrap();
            let mut records = RecordGaps::new(5000);
            let n = db.load_record_gaps(&mut records).await.unwrap();
            assert_eq!(n, 2);
            assert!((records.log_start(100) - 25.0).abs() < 1e-4);
            assert!((records.log_start(6) - 100.0).abs() < 1e-3);
            assert_eq!(records.log_start(8), GAP_INF);
        });
    }
}
