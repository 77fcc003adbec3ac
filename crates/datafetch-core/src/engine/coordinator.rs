//! Chunk coordinator - runs a bounded pool of chunk workers
//!
//! Probes the server for range support, pre-allocates the destination file,
//! reconciles persisted progress against the fresh chunk plan, and drives
//! all incomplete chunks to a terminal status through a semaphore-bounded
//! worker pool.

use crate::engine::backoff;
use crate::engine::chunk_worker::ChunkWorker;
use crate::engine::planner;
use crate::engine::progress::ProgressStore;
use crate::error::FetchError;
use datafetch_types::{ChunkStatus, ProgressRecord, TransferRequest};
use reqwest::{Client, StatusCode};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

const PROBE_BASE_DELAY: Duration = Duration::from_millis(500);
const PROBE_MAX_DELAY: Duration = Duration::from_secs(60);

/// Outcome of the range capability probe.
#[derive(Debug, Clone, Copy)]
pub struct RangeProbe {
    pub supports_range: bool,
    pub total_size: Option<u64>,
}

/// Issue a one-byte range request and classify the server's answer.
///
/// A 206 confirms range support (with the total size taken from
/// `Content-Range`); a 200 means the server ignored the header and chunked
/// transfers are off the table for this URL. Transient failures are retried
/// with backoff like any other fetch, up to `max_retries`.
pub async fn probe_range(
    client: &Client,
    url: &str,
    max_retries: u32,
) -> Result<RangeProbe, FetchError> {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;

        match probe_once(client, url).await {
            Ok(probe) => return Ok(probe),
            Err(e) if e.is_retryable() && attempt <= max_retries => {
                let wait = backoff::delay(attempt - 1, PROBE_BASE_DELAY, PROBE_MAX_DELAY);
                warn!(
                    "Range probe attempt {} for {} failed: {}. Retrying in {:?}",
                    attempt, url, e, wait
                );
                tokio::time::sleep(wait).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn probe_once(client: &Client, url: &str) -> Result<RangeProbe, FetchError> {
    let response = client
        .get(url)
        .header(reqwest::header::RANGE, "bytes=0-0")
        .send()
        .await?;

    match response.status() {
        StatusCode::PARTIAL_CONTENT => {
            // Content-Range: bytes 0-0/12345
            let total_size = response
                .headers()
                .get(reqwest::header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.rsplit('/').next())
                .filter(|total| *total != "*")
                .and_then(|total| total.parse().ok());

            Ok(RangeProbe {
                supports_range: true,
                total_size,
            })
        }
        StatusCode::OK => {
            let total_size = response
                .headers()
                .get(reqwest::header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());

            debug!("Server ignored range probe for {}", url);
            Ok(RangeProbe {
                supports_range: false,
                total_size,
            })
        }
        status => Err(FetchError::HttpStatus {
            status: status.as_u16(),
            chunk: None,
        }),
    }
}

/// Coordinates chunk workers for one transfer.
pub struct ChunkCoordinator {
    client: Client,
    store: ProgressStore,
}

impl ChunkCoordinator {
    pub fn new(client: Client, store: ProgressStore) -> Self {
        Self { client, store }
    }

    /// Run the chunked download to completion.
    ///
    /// Returns `RangeNotSupported` (before any byte is written) when the
    /// probe shows the server ignores range requests, so the engine can fall
    /// back to a single-stream transfer. On a chunk failure the progress
    /// record is left in place so a later invocation resumes only the
    /// incomplete chunks.
    pub async fn run(
        &self,
        request: &TransferRequest,
        total_size: u64,
        probe: Option<RangeProbe>,
        cancelled: Arc<AtomicBool>,
        bytes_transferred: Arc<AtomicU64>,
    ) -> Result<(), FetchError> {
        let probe = match probe {
            Some(probe) => probe,
            None => probe_range(&self.client, &request.url, request.max_retries).await?,
        };
        if !probe.supports_range {
            return Err(FetchError::RangeNotSupported);
        }
        if let Some(reported) = probe.total_size {
            if reported != total_size {
                return Err(FetchError::SizeMismatch {
                    expected: total_size,
                    actual: reported,
                });
            }
        }

        let plan = planner::plan(total_size, request.chunk_count)?;
        let fingerprint = request.fingerprint();

        // Pre-size the destination so chunk writes are independent
        // random-access operations.
        self.preallocate(request, total_size).await?;

        let record = match self.store.load_matching(&fingerprint, &plan).await? {
            Some(record) => {
                info!(
                    "Resuming transfer {} ({} of {} chunks complete)",
                    fingerprint,
                    record
                        .chunks
                        .iter()
                        .filter(|c| c.status == ChunkStatus::Completed)
                        .count(),
                    record.chunks.len()
                );
                record
            }
            None => {
                let record = ProgressRecord::new(
                    fingerprint.clone(),
                    request.url.clone(),
                    request.destination.clone(),
                    total_size,
                    &plan,
                );
                self.store.create(&record).await?;
                record
            }
        };

        // Interrupted runs leave chunks marked in_progress; make them
        // claimable again before dispatch.
        self.store.release_claims(&fingerprint).await?;

        bytes_transferred.store(record.bytes_written(), Ordering::Release);

        let pool_size = request
            .concurrent_chunks
            .min(request.chunk_count)
            .max(1) as usize;
        let semaphore = Arc::new(Semaphore::new(pool_size));
        let mut join_set = JoinSet::new();

        // Ascending index order when the pool has free capacity; completion
        // order is irrelevant because the ranges are disjoint.
        for mut state in record.chunks {
            if state.status == ChunkStatus::Completed {
                continue;
            }
            if cancelled.load(Ordering::Acquire) {
                break;
            }

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore never closed");

            if !self.store.try_claim(&fingerprint, state.spec.index).await? {
                debug!("Chunk {} already claimed, skipping", state.spec.index);
                continue;
            }
            state.status = ChunkStatus::InProgress;
            // The retry budget is per invocation; attempts from an earlier
            // run do not count against this one.
            state.attempt_count = 0;

            let worker = ChunkWorker::new(
                fingerprint.clone(),
                state,
                request.url.clone(),
                request.destination.clone(),
                self.client.clone(),
                self.store.clone(),
                cancelled.clone(),
                bytes_transferred.clone(),
                request.max_retries,
            );

            join_set.spawn(async move {
                let result = worker.run().await;
                drop(permit);
                result
            });
        }

        // Block until every dispatched chunk reaches a terminal status;
        // keep the first error but let the other workers finish.
        let mut first_error: Option<FetchError> = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(state)) => {
                    debug!("Chunk {} finished", state.spec.index);
                }
                Ok(Err(e)) => {
                    warn!("Chunk failed: {}", e);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(join_err) => {
                    if first_error.is_none() {
                        first_error = Some(FetchError::Io(std::io::Error::other(format!(
                            "chunk task panicked: {}",
                            join_err
                        ))));
                    }
                }
            }
        }

        if cancelled.load(Ordering::Acquire) {
            self.store.release_claims(&fingerprint).await?;
            return Err(FetchError::Cancelled);
        }

        if let Some(e) = first_error {
            // Keep the record: a later invocation resumes the failed and
            // incomplete chunks only.
            return Err(e);
        }

        // Everything dispatched finished; confirm the record agrees.
        let final_record = self
            .store
            .load(&fingerprint)
            .await?
            .ok_or_else(|| FetchError::ProgressCorruption("record vanished mid-run".into()))?;
        if !final_record.all_completed() {
            return Err(FetchError::ProgressCorruption(
                "workers finished but record reports incomplete chunks".into(),
            ));
        }

        Ok(())
    }

    async fn preallocate(
        &self,
        request: &TransferRequest,
        total_size: u64,
    ) -> Result<(), FetchError> {
        if let Some(parent) = request.destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&request.destination)
            .await?;

        if file.metadata().await?.len() != total_size {
            file.set_len(total_size).await?;
            debug!(
                "Pre-allocated {} to {} bytes",
                request.destination.display(),
                total_size
            );
        }

        Ok(())
    }
}
