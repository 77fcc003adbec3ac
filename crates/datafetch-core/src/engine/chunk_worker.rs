//! Chunk worker - fetches a single byte range with retry and backoff
//!
//! Each worker owns a disjoint range of a pre-sized destination file and
//! writes at absolute offsets, so no locking is needed between workers.
//! A partially fetched chunk resumes from its recorded byte offset, not from
//! the start of the range.

use crate::engine::backoff;
use crate::engine::progress::ProgressStore;
use crate::error::FetchError;
use datafetch_types::{ChunkState, ChunkStatus, TransferFingerprint};
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Base delay for exponential backoff between attempts.
const BASE_DELAY: Duration = Duration::from_millis(500);
/// Backoff ceiling.
const MAX_DELAY: Duration = Duration::from_secs(60);
/// Persist mid-chunk progress every this many bytes, to bound both write
/// amplification and the span lost on a crash.
const FLUSH_INTERVAL_BYTES: u64 = 4 * 1024 * 1024;

/// A worker that downloads one byte range into the destination file.
pub struct ChunkWorker {
    fingerprint: TransferFingerprint,
    state: ChunkState,
    url: String,
    dest_path: PathBuf,
    client: Client,
    store: ProgressStore,
    cancelled: Arc<AtomicBool>,
    bytes_transferred: Arc<AtomicU64>,
    max_retries: u32,
}

impl ChunkWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fingerprint: TransferFingerprint,
        state: ChunkState,
        url: String,
        dest_path: PathBuf,
        client: Client,
        store: ProgressStore,
        cancelled: Arc<AtomicBool>,
        bytes_transferred: Arc<AtomicU64>,
        max_retries: u32,
    ) -> Self {
        Self {
            fingerprint,
            state,
            url,
            dest_path,
            client,
            store,
            cancelled,
            bytes_transferred,
            max_retries,
        }
    }

    /// Run the chunk download to a terminal status.
    ///
    /// Transient errors are retried with exponential backoff up to
    /// `max_retries`; progress made before a failed attempt is kept, so a
    /// retry continues from the current byte offset.
    pub async fn run(mut self) -> Result<ChunkState, FetchError> {
        info!(
            "Starting chunk {} (bytes {}-{}, {} already written)",
            self.state.spec.index, self.state.spec.start, self.state.spec.end,
            self.state.bytes_written
        );

        loop {
            self.state.attempt_count += 1;

            match self.fetch_once().await {
                Ok(()) => {
                    self.state.status = ChunkStatus::Completed;
                    self.save_progress().await?;
                    info!(
                        "Chunk {} complete ({} bytes, {} attempt(s))",
                        self.state.spec.index,
                        self.state.bytes_written,
                        self.state.attempt_count
                    );
                    return Ok(self.state);
                }
                Err(FetchError::Cancelled) => {
                    // Durable state already reflects the bytes written; the
                    // claim is released by the coordinator.
                    return Err(FetchError::Cancelled);
                }
                Err(e) if e.is_retryable() && self.state.attempt_count <= self.max_retries => {
                    let wait = backoff::delay(self.state.attempt_count - 1, BASE_DELAY, MAX_DELAY);
                    warn!(
                        "Chunk {} attempt {} failed: {}. Retrying in {:?}",
                        self.state.spec.index, self.state.attempt_count, e, wait
                    );
                    self.save_progress().await?;
                    tokio::time::sleep(wait).await;

                    if self.cancelled.load(Ordering::Acquire) {
                        return Err(FetchError::Cancelled);
                    }
                }
                Err(e) => {
                    self.state.status = ChunkStatus::Failed;
                    self.save_progress().await?;
                    if e.is_retryable() {
                        return Err(FetchError::RetriesExhausted {
                            chunk: self.state.spec.index,
                            attempts: self.state.attempt_count,
                            source: Box::new(e),
                        });
                    }
                    return Err(e);
                }
            }
        }
    }

    /// One HTTP attempt: range request from the current offset, streamed to
    /// the destination file at absolute positions.
    async fn fetch_once(&mut self) -> Result<(), FetchError> {
        if self.state.remaining() == 0 {
            return Ok(());
        }

        let offset = self.state.spec.start + self.state.bytes_written;
        let range = format!("bytes={}-{}", offset, self.state.spec.end);
        debug!("Chunk {} requesting range {}", self.state.spec.index, range);

        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::RANGE, range)
            .send()
            .await?;

        match response.status() {
            StatusCode::PARTIAL_CONTENT => {}
            // A 200 means the server ignored the range header; chunked
            // assumptions no longer hold and the engine must fall back.
            StatusCode::OK => return Err(FetchError::RangeNotSupported),
            status => {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    chunk: Some(self.state.spec.index),
                })
            }
        }

        let mut file = OpenOptions::new().write(true).open(&self.dest_path).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;

        let mut stream = response.bytes_stream();
        let mut unsaved: u64 = 0;

        while let Some(chunk_result) = stream.next().await {
            if self.cancelled.load(Ordering::Acquire) {
                info!("Chunk {} cancelled", self.state.spec.index);
                file.flush().await?;
                self.save_progress().await?;
                return Err(FetchError::Cancelled);
            }

            let bytes = chunk_result?;
            let len = bytes.len() as u64;

            // Never write past the end of the owned range
            if self.state.bytes_written + len > self.state.spec.len() {
                return Err(FetchError::SizeMismatch {
                    expected: self.state.spec.len(),
                    actual: self.state.bytes_written + len,
                });
            }

            file.write_all(&bytes).await?;
            self.state.bytes_written += len;
            self.bytes_transferred.fetch_add(len, Ordering::AcqRel);

            unsaved += len;
            if unsaved >= FLUSH_INTERVAL_BYTES {
                file.flush().await?;
                self.save_progress().await?;
                unsaved = 0;
            }
        }

        file.flush().await?;
        file.sync_all().await?;

        // A short body means the connection dropped mid-stream; retryable
        // because the next attempt resumes from the new offset.
        if self.state.remaining() > 0 {
            return Err(FetchError::TruncatedBody {
                chunk: Some(self.state.spec.index),
            });
        }

        Ok(())
    }

    async fn save_progress(&self) -> Result<(), FetchError> {
        self.store
            .update_chunk(
                &self.fingerprint,
                self.state.spec.index,
                self.state.status,
                self.state.bytes_written,
                self.state.attempt_count,
            )
            .await
    }
}
