//! Single-stream fetcher - sequential transfer with resume-by-offset
//!
//! Used for small files, servers without range support, and as the automatic
//! fallback when the chunked probe fails. Resume state is the destination
//! file's current length, not the progress record: single-stream mode has one
//! contiguous frontier.

use crate::engine::backoff;
use crate::error::FetchError;
use datafetch_types::TransferRequest;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{info, warn};

const BASE_DELAY: Duration = Duration::from_millis(500);
const MAX_DELAY: Duration = Duration::from_secs(60);

/// Sequential fallback transfer.
pub struct SingleStreamFetcher {
    client: Client,
}

impl SingleStreamFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Run the transfer to completion, retrying the remaining bytes (never
    /// the whole file) on transient failure.
    pub async fn run(
        &self,
        request: &TransferRequest,
        cancelled: Arc<AtomicBool>,
        bytes_transferred: Arc<AtomicU64>,
    ) -> Result<(), FetchError> {
        if let Some(parent) = request.destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            match self
                .fetch_once(request, &cancelled, &bytes_transferred)
                .await
            {
                Ok(()) => return Ok(()),
                Err(FetchError::Cancelled) => return Err(FetchError::Cancelled),
                Err(e) if e.is_retryable() && attempt <= request.max_retries => {
                    let wait = backoff::delay(attempt - 1, BASE_DELAY, MAX_DELAY);
                    warn!(
                        "Transfer attempt {} failed: {}. Retrying in {:?}",
                        attempt, e, wait
                    );
                    tokio::time::sleep(wait).await;

                    if cancelled.load(Ordering::Acquire) {
                        return Err(FetchError::Cancelled);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_once(
        &self,
        request: &TransferRequest,
        cancelled: &AtomicBool,
        bytes_transferred: &AtomicU64,
    ) -> Result<(), FetchError> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&request.destination)
            .await?;

        // Resume frontier is whatever is already on disk.
        let mut offset = file.metadata().await?.len();
        if let Some(expected) = request.expected_size {
            if offset > expected {
                // A partial file longer than the resource is not resumable.
                file.set_len(0).await?;
                offset = 0;
            }
            if offset == expected {
                bytes_transferred.store(offset, Ordering::Release);
                return Ok(());
            }
        }

        let mut req = self.client.get(&request.url);
        if offset > 0 {
            info!("Resuming single-stream transfer from byte {}", offset);
            req = req.header(reqwest::header::RANGE, format!("bytes={}-", offset));
        }

        let response = req.send().await?;
        match response.status() {
            StatusCode::PARTIAL_CONTENT => {
                file.seek(std::io::SeekFrom::Start(offset)).await?;
            }
            StatusCode::OK => {
                // Full body: either no resume was requested or the server
                // ignored the range header. Start over from byte zero.
                if offset > 0 {
                    warn!("Server ignored resume range; restarting from scratch");
                }
                file.set_len(0).await?;
                file.seek(std::io::SeekFrom::Start(0)).await?;
                offset = 0;
            }
            status => {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    chunk: None,
                })
            }
        }

        bytes_transferred.store(offset, Ordering::Release);

        let mut stream = response.bytes_stream();
        while let Some(chunk_result) = stream.next().await {
            if cancelled.load(Ordering::Acquire) {
                file.flush().await?;
                return Err(FetchError::Cancelled);
            }

            let bytes = chunk_result?;
            file.write_all(&bytes).await?;
            offset += bytes.len() as u64;
            bytes_transferred.fetch_add(bytes.len() as u64, Ordering::AcqRel);
        }

        file.flush().await?;
        file.sync_all().await?;

        if let Some(expected) = request.expected_size {
            if offset < expected {
                // Dropped connection; the next attempt resumes at the frontier.
                return Err(FetchError::TruncatedBody { chunk: None });
            }
            if offset > expected {
                return Err(FetchError::SizeMismatch {
                    expected,
                    actual: offset,
                });
            }
        }

        info!("Single-stream transfer complete ({} bytes)", offset);
        Ok(())
    }
}
