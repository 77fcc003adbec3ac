//! SQLite-backed progress store
//!
//! One durable record per transfer fingerprint, holding per-chunk completion
//! state. All updates go through the database so concurrent chunk completions
//! serialize on the transaction instead of racing in memory.

use crate::error::FetchError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use datafetch_types::{
    ChunkSpec, ChunkState, ChunkStatus, ProgressRecord, TransferFingerprint,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqliteRow};
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Database connection pool for progress persistence
#[derive(Clone, Debug)]
pub struct ProgressStore {
    pool: SqlitePool,
}

impl ProgressStore {
    /// Open (or create) the store at the given path.
    pub async fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, FetchError> {
        let path = db_path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transfers (
                fingerprint TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                destination TEXT NOT NULL,
                total_size INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chunks (
                fingerprint TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                start_byte INTEGER NOT NULL,
                end_byte INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                bytes_written INTEGER NOT NULL DEFAULT 0,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (fingerprint, chunk_index),
                FOREIGN KEY (fingerprint) REFERENCES transfers(fingerprint) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_transfers_updated ON transfers(updated_at);
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Insert a fresh record with all chunks pending.
    pub async fn create(&self, record: &ProgressRecord) -> Result<(), FetchError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO transfers (fingerprint, url, destination, total_size, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(fingerprint) DO UPDATE SET
                url = excluded.url,
                destination = excluded.destination,
                total_size = excluded.total_size,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(record.fingerprint.as_str())
        .bind(&record.url)
        .bind(record.destination.to_string_lossy().to_string())
        .bind(record.total_size as i64)
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM chunks WHERE fingerprint = ?")
            .bind(record.fingerprint.as_str())
            .execute(&mut *tx)
            .await?;

        for chunk in &record.chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (
                    fingerprint, chunk_index, start_byte, end_byte,
                    status, bytes_written, attempt_count
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(record.fingerprint.as_str())
            .bind(chunk.spec.index as i64)
            .bind(chunk.spec.start as i64)
            .bind(chunk.spec.end as i64)
            .bind(chunk.status.as_str())
            .bind(chunk.bytes_written as i64)
            .bind(chunk.attempt_count as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(
            "Created progress record {} ({} chunks)",
            record.fingerprint,
            record.chunks.len()
        );
        Ok(())
    }

    /// Load the record for a fingerprint, if any.
    ///
    /// Rows that cannot be decoded surface as `ProgressCorruption`; the
    /// caller treats that as "no record" and restarts from scratch.
    pub async fn load(
        &self,
        fingerprint: &TransferFingerprint,
    ) -> Result<Option<ProgressRecord>, FetchError> {
        let row = sqlx::query("SELECT * FROM transfers WHERE fingerprint = ?")
            .bind(fingerprint.as_str())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let chunk_rows = sqlx::query(
            "SELECT * FROM chunks WHERE fingerprint = ? ORDER BY chunk_index",
        )
        .bind(fingerprint.as_str())
        .fetch_all(&self.pool)
        .await?;

        let chunks = chunk_rows
            .into_iter()
            .map(row_to_chunk)
            .collect::<Result<Vec<_>, _>>()?;

        if chunks.is_empty() {
            return Err(FetchError::ProgressCorruption(format!(
                "record {} has no chunk rows",
                fingerprint
            )));
        }

        Ok(Some(ProgressRecord {
            fingerprint: fingerprint.clone(),
            url: row.get("url"),
            destination: PathBuf::from(row.get::<String, _>("destination")),
            total_size: row.get::<i64, _>("total_size") as u64,
            chunks,
            created_at: parse_timestamp(&row, "created_at")?,
            updated_at: parse_timestamp(&row, "updated_at")?,
        }))
    }

    /// Atomically claim a chunk for a worker.
    ///
    /// Check-and-set: the transition to `in_progress` succeeds only if no
    /// other worker holds the chunk and it has not already completed. Returns
    /// false when the claim was lost.
    pub async fn try_claim(
        &self,
        fingerprint: &TransferFingerprint,
        chunk_index: u32,
    ) -> Result<bool, FetchError> {
        let result = sqlx::query(
            r#"
            UPDATE chunks
            SET status = 'in_progress'
            WHERE fingerprint = ? AND chunk_index = ?
              AND status NOT IN ('in_progress', 'completed')
            "#,
        )
        .bind(fingerprint.as_str())
        .bind(chunk_index as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Record a chunk transition. Also bumps the record's updated_at so the
    /// retention sweep sees activity.
    pub async fn update_chunk(
        &self,
        fingerprint: &TransferFingerprint,
        chunk_index: u32,
        status: ChunkStatus,
        bytes_written: u64,
        attempt_count: u32,
    ) -> Result<(), FetchError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE chunks
            SET status = ?, bytes_written = ?, attempt_count = ?
            WHERE fingerprint = ? AND chunk_index = ?
            "#,
        )
        .bind(status.as_str())
        .bind(bytes_written as i64)
        .bind(attempt_count as i64)
        .bind(fingerprint.as_str())
        .bind(chunk_index as i64)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE transfers SET updated_at = ? WHERE fingerprint = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(fingerprint.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Downgrade every in-flight chunk to its last durable status.
    ///
    /// Called on cancellation so no chunk stays stuck in `in_progress`:
    /// a chunk with recorded bytes goes back to `pending` (it can resume by
    /// offset), which is exactly what its durable state says.
    pub async fn release_claims(
        &self,
        fingerprint: &TransferFingerprint,
    ) -> Result<(), FetchError> {
        let result = sqlx::query(
            r#"
            UPDATE chunks
            SET status = 'pending'
            WHERE fingerprint = ? AND status = 'in_progress'
            "#,
        )
        .bind(fingerprint.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            debug!(
                "Released {} in-flight chunk claim(s) for {}",
                result.rows_affected(),
                fingerprint
            );
        }
        Ok(())
    }

    /// Delete the record after successful verification.
    pub async fn delete(&self, fingerprint: &TransferFingerprint) -> Result<(), FetchError> {
        sqlx::query("DELETE FROM chunks WHERE fingerprint = ?")
            .bind(fingerprint.as_str())
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM transfers WHERE fingerprint = ?")
            .bind(fingerprint.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Reclaim records idle for longer than `retention`. A maintenance
    /// operation independent of any single transfer. Returns the number of
    /// records removed.
    pub async fn sweep(&self, retention: Duration) -> Result<u64, FetchError> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(retention)
                .unwrap_or_else(|_| ChronoDuration::days(7));

        let stale: Vec<String> =
            sqlx::query("SELECT fingerprint FROM transfers WHERE updated_at < ?")
                .bind(cutoff.to_rfc3339())
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .map(|row| row.get("fingerprint"))
                .collect();

        for fingerprint in &stale {
            sqlx::query("DELETE FROM chunks WHERE fingerprint = ?")
                .bind(fingerprint)
                .execute(&self.pool)
                .await?;
            sqlx::query("DELETE FROM transfers WHERE fingerprint = ?")
                .bind(fingerprint)
                .execute(&self.pool)
                .await?;
        }

        if !stale.is_empty() {
            info!("Swept {} stale progress record(s)", stale.len());
        }
        Ok(stale.len() as u64)
    }

    /// Load the record and validate it against a fresh plan. Returns `None`
    /// (after discarding the record) when the boundaries do not match, so the
    /// caller restarts from scratch.
    pub async fn load_matching(
        &self,
        fingerprint: &TransferFingerprint,
        plan: &[ChunkSpec],
    ) -> Result<Option<ProgressRecord>, FetchError> {
        let record = match self.load(fingerprint).await {
            Ok(record) => record,
            Err(FetchError::ProgressCorruption(reason)) => {
                warn!("Discarding corrupt progress record {}: {}", fingerprint, reason);
                self.delete(fingerprint).await?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        match record {
            Some(record) if record.matches_plan(plan) => Ok(Some(record)),
            Some(record) => {
                warn!(
                    "Progress record {} does not match current plan ({} vs {} chunks); discarding",
                    fingerprint,
                    record.chunks.len(),
                    plan.len()
                );
                self.delete(fingerprint).await?;
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

fn row_to_chunk(row: SqliteRow) -> Result<ChunkState, FetchError> {
    let status_str: String = row.get("status");
    let status = status_str
        .parse::<ChunkStatus>()
        .map_err(FetchError::ProgressCorruption)?;

    let start = row.get::<i64, _>("start_byte");
    let end = row.get::<i64, _>("end_byte");
    if start < 0 || end < start {
        return Err(FetchError::ProgressCorruption(format!(
            "invalid chunk range {}..{}",
            start, end
        )));
    }

    Ok(ChunkState {
        spec: ChunkSpec::new(
            row.get::<i64, _>("chunk_index") as u32,
            start as u64,
            end as u64,
        ),
        status,
        bytes_written: row.get::<i64, _>("bytes_written") as u64,
        attempt_count: row.get::<i64, _>("attempt_count") as u32,
    })
}

fn parse_timestamp(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>, FetchError> {
    let raw: String = row.get(column);
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| FetchError::ProgressCorruption(format!("bad {} timestamp: {}", column, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::planner;

    async fn store() -> (ProgressStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::open(dir.path().join("progress.db"))
            .await
            .unwrap();
        (store, dir)
    }

    fn record(total: u64, chunks: u32) -> ProgressRecord {
        let plan = planner::plan(total, chunks).unwrap();
        ProgressRecord::new(
            TransferFingerprint::derive("http://x/f", Path::new("/tmp/f"), Some(total)),
            "http://x/f".into(),
            PathBuf::from("/tmp/f"),
            total,
            &plan,
        )
    }

    #[tokio::test]
    async fn create_load_round_trip() {
        let (store, _dir) = store().await;
        let rec = record(1000, 4);
        store.create(&rec).await.unwrap();

        let loaded = store.load(&rec.fingerprint).await.unwrap().unwrap();
        assert_eq!(loaded.total_size, 1000);
        assert_eq!(loaded.chunks.len(), 4);
        assert!(loaded
            .chunks
            .iter()
            .all(|c| c.status == ChunkStatus::Pending));
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let (store, _dir) = store().await;
        let rec = record(1000, 2);
        store.create(&rec).await.unwrap();

        assert!(store.try_claim(&rec.fingerprint, 0).await.unwrap());
        // Second claim on the same chunk must lose
        assert!(!store.try_claim(&rec.fingerprint, 0).await.unwrap());
        // Other chunks are unaffected
        assert!(store.try_claim(&rec.fingerprint, 1).await.unwrap());
    }

    #[tokio::test]
    async fn completed_chunks_cannot_be_reclaimed() {
        let (store, _dir) = store().await;
        let rec = record(1000, 2);
        store.create(&rec).await.unwrap();

        assert!(store.try_claim(&rec.fingerprint, 0).await.unwrap());
        store
            .update_chunk(&rec.fingerprint, 0, ChunkStatus::Completed, 500, 1)
            .await
            .unwrap();
        assert!(!store.try_claim(&rec.fingerprint, 0).await.unwrap());
    }

    #[tokio::test]
    async fn release_claims_downgrades_in_flight_chunks() {
        let (store, _dir) = store().await;
        let rec = record(1000, 2);
        store.create(&rec).await.unwrap();

        store.try_claim(&rec.fingerprint, 0).await.unwrap();
        store.try_claim(&rec.fingerprint, 1).await.unwrap();
        store
            .update_chunk(&rec.fingerprint, 1, ChunkStatus::Completed, 500, 1)
            .await
            .unwrap();

        store.release_claims(&rec.fingerprint).await.unwrap();

        let loaded = store.load(&rec.fingerprint).await.unwrap().unwrap();
        assert_eq!(loaded.chunks[0].status, ChunkStatus::Pending);
        assert_eq!(loaded.chunks[1].status, ChunkStatus::Completed);
    }

    #[tokio::test]
    async fn mismatched_plan_discards_record() {
        let (store, _dir) = store().await;
        let rec = record(1000, 4);
        store.create(&rec).await.unwrap();

        // Same fingerprint, different topology
        let other_plan = planner::plan(1000, 2).unwrap();
        let loaded = store
            .load_matching(&rec.fingerprint, &other_plan)
            .await
            .unwrap();
        assert!(loaded.is_none());
        // Record is gone for good
        assert!(store.load(&rec.fingerprint).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn matching_plan_is_returned() {
        let (store, _dir) = store().await;
        let rec = record(1000, 4);
        store.create(&rec).await.unwrap();

        let plan = planner::plan(1000, 4).unwrap();
        let loaded = store
            .load_matching(&rec.fingerprint, &plan)
            .await
            .unwrap();
        assert!(loaded.is_some());
    }

    #[tokio::test]
    async fn sweep_reclaims_only_stale_records() {
        let (store, _dir) = store().await;
        let rec = record(1000, 1);
        store.create(&rec).await.unwrap();

        // Fresh record survives a 7-day retention sweep
        let removed = store.sweep(Duration::from_secs(7 * 24 * 3600)).await.unwrap();
        assert_eq!(removed, 0);
        assert!(store.load(&rec.fingerprint).await.unwrap().is_some());

        // Zero retention reclaims everything not touched this instant
        tokio::time::sleep(Duration::from_millis(10)).await;
        let removed = store.sweep(Duration::ZERO).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.load(&rec.fingerprint).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_removes_record() {
        let (store, _dir) = store().await;
        let rec = record(1000, 2);
        store.create(&rec).await.unwrap();
        store.delete(&rec.fingerprint).await.unwrap();
        assert!(store.load(&rec.fingerprint).await.unwrap().is_none());
    }
}
