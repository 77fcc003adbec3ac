//! Transfer engine - drives one request through plan, fetch, verify, extract
//!
//! The engine owns stage sequencing and strategy resolution; the mechanics
//! live in the coordinator, the single-stream fetcher, the checksum module,
//! and the extractor. Every outcome is folded into one immutable
//! `TransferResult` so callers never have to interpret raw errors.

use crate::checksum;
use crate::engine::coordinator::{probe_range, ChunkCoordinator, RangeProbe};
use crate::engine::progress::ProgressStore;
use crate::engine::single_stream::SingleStreamFetcher;
use crate::error::FetchError;
use crate::extract::{self, ExtractOptions};
use datafetch_types::{
    ArchiveFormat, Strategy, TransferFingerprint, TransferRequest, TransferResult, TransferStage,
};
use reqwest::Client;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Below this size the chunked machinery costs more than it saves.
const SMALL_FILE_THRESHOLD: u64 = 256 * 1024;

/// Progress records untouched for this long are swept at engine startup.
const PROGRESS_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Cooperative cancellation flag shared with in-flight workers.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Workers observe the flag at chunk boundaries
    /// within the body stream, so shutdown is prompt but not instant.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    fn flag(&self) -> Arc<AtomicBool> {
        self.flag.clone()
    }
}

/// Executes transfer requests against a shared progress store.
pub struct TransferEngine {
    store: ProgressStore,
}

impl TransferEngine {
    /// Open (or create) the progress database and sweep stale records.
    pub async fn new<P: AsRef<std::path::Path>>(db_path: P) -> Result<Self, FetchError> {
        let store = ProgressStore::open(db_path).await?;
        let engine = Self::with_store(store);
        let swept = engine.store.sweep(PROGRESS_RETENTION).await?;
        if swept > 0 {
            info!("Swept {} stale progress record(s)", swept);
        }
        Ok(engine)
    }

    pub fn with_store(store: ProgressStore) -> Self {
        Self { store }
    }

    /// Run a transfer to a terminal result. Never panics and never returns
    /// `Err`; failures are reported through the result's `ErrorDetail`.
    pub async fn execute(&self, request: &TransferRequest) -> TransferResult {
        self.execute_cancellable(request, &CancelHandle::new())
            .await
    }

    /// Run a transfer that the caller can cancel through `handle`.
    pub async fn execute_cancellable(
        &self,
        request: &TransferRequest,
        handle: &CancelHandle,
    ) -> TransferResult {
        let bytes_transferred = Arc::new(AtomicU64::new(0));
        let mut stage = TransferStage::Planning;

        match self
            .run(request, handle, &bytes_transferred, &mut stage)
            .await
        {
            Ok(outcome) => TransferResult::succeeded(
                outcome.path,
                bytes_transferred.load(Ordering::Acquire),
                outcome.checksum_verified,
            ),
            Err(e) => {
                warn!(
                    "Transfer of {} failed during {:?}: {}",
                    request.url, stage, e
                );
                TransferResult::failed(
                    request.destination.clone(),
                    bytes_transferred.load(Ordering::Acquire),
                    e.detail(stage),
                )
            }
        }
    }

    /// Remove progress records older than the retention window.
    pub async fn sweep_stale(&self) -> Result<u64, FetchError> {
        self.store.sweep(PROGRESS_RETENTION).await
    }

    async fn run(
        &self,
        request: &TransferRequest,
        handle: &CancelHandle,
        bytes_transferred: &Arc<AtomicU64>,
        stage: &mut TransferStage,
    ) -> Result<TransferOutcome, FetchError> {
        // Planning: validate, fingerprint, resolve the fetch strategy.
        url::Url::parse(&request.url)
            .map_err(|e| FetchError::InvalidUrl(format!("{}: {}", request.url, e)))?;

        let client = Client::builder()
            .connect_timeout(request.timeout)
            .read_timeout(request.timeout)
            .build()?;

        let fingerprint = request.fingerprint();
        info!(
            "Transfer {} -> {} ({})",
            request.url,
            request.destination.display(),
            fingerprint
        );

        if let Some(parent) = request.destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Fetching.
        *stage = TransferStage::Fetching;
        if self.already_complete(request, &fingerprint).await? {
            info!(
                "Destination {} already complete, skipping fetch",
                request.destination.display()
            );
            let len = tokio::fs::metadata(&request.destination).await?.len();
            bytes_transferred.store(len, Ordering::Release);
        } else {
            self.fetch(request, &client, handle, bytes_transferred)
                .await?;
        }

        // Any ambiguity about the final length is an error, never silent
        // truncation.
        let actual = tokio::fs::metadata(&request.destination).await?.len();
        if let Some(expected) = request.expected_size {
            if actual != expected {
                return Err(FetchError::SizeMismatch {
                    expected,
                    actual,
                });
            }
        }

        // Verifying.
        *stage = TransferStage::Verifying;
        let checksum_verified = match &request.checksum {
            Some(expected) => {
                let valid = checksum::validate(
                    &request.destination,
                    &expected.value,
                    expected.algorithm,
                )
                .await?;
                if !valid {
                    // The file is left on disk for diagnosis.
                    let actual =
                        checksum::compute(&request.destination, expected.algorithm).await?;
                    return Err(FetchError::ChecksumMismatch {
                        expected: expected.value.clone(),
                        actual,
                    });
                }
                true
            }
            None => {
                info!(
                    "No checksum supplied for {}; integrity not verified",
                    request.url
                );
                false
            }
        };

        // The record only becomes disposable once the bytes are proven good.
        self.store.delete(&fingerprint).await?;

        // Extracting.
        let mut final_path = request.destination.clone();
        if let Some(extract_req) = &request.extract {
            *stage = TransferStage::Extracting;

            let format = match extract_req.format {
                Some(format) => format,
                None => ArchiveFormat::from_path(&request.destination).ok_or_else(|| {
                    FetchError::UnsupportedFormat(format!(
                        "cannot detect archive format of {}",
                        request.destination.display()
                    ))
                })?,
            };
            let dest_dir = match &extract_req.destination {
                Some(dir) => dir.clone(),
                None => request
                    .destination
                    .parent()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(".")),
            };

            final_path = extract::extract(
                &request.destination,
                format,
                &dest_dir,
                ExtractOptions::default(),
            )
            .await?;

            if !request.keep_archive {
                tokio::fs::remove_file(&request.destination).await?;
                debug!("Removed archive {}", request.destination.display());
            }
        }

        Ok(TransferOutcome {
            path: final_path,
            checksum_verified,
        })
    }

    async fn fetch(
        &self,
        request: &TransferRequest,
        client: &Client,
        handle: &CancelHandle,
        bytes_transferred: &Arc<AtomicU64>,
    ) -> Result<(), FetchError> {
        let resolved = self.resolve_strategy(request, client).await?;

        if let ResolvedStrategy::Chunked { total_size, probe } = resolved {
            let coordinator = ChunkCoordinator::new(client.clone(), self.store.clone());
            match coordinator
                .run(request, total_size, probe, handle.flag(), bytes_transferred.clone())
                .await
            {
                Ok(()) => return Ok(()),
                Err(FetchError::RangeNotSupported) => {
                    warn!(
                        "Server does not honor range requests for {}; falling back to single stream",
                        request.url
                    );
                    // A record means the chunked attempt got past the probe
                    // and pre-sized the destination, so the file's length no
                    // longer encodes a single-stream resume offset. Start
                    // the fallback from a clean slate. A corrupt record gets
                    // the same treatment; any other store failure propagates.
                    let fingerprint = request.fingerprint();
                    let had_record = match self.store.load(&fingerprint).await {
                        Ok(record) => record.is_some(),
                        Err(FetchError::ProgressCorruption(_)) => true,
                        Err(e) => return Err(e),
                    };
                    if had_record {
                        self.store.delete(&fingerprint).await?;
                        tokio::fs::File::create(&request.destination).await?;
                        bytes_transferred.store(0, Ordering::Release);
                    }
                }
                Err(e) => return Err(e),
            }
        } else {
            debug!("Using single-stream transfer for {}", request.url);
        }

        SingleStreamFetcher::new(client.clone())
            .run(request, handle.flag(), bytes_transferred.clone())
            .await
    }

    /// Resolve the strategy hint to a concrete fetch mode, once.
    ///
    /// Chunked needs a known total size: the expected size when supplied,
    /// otherwise whatever a range probe reports. Small files and unknown
    /// lengths degrade to single-stream.
    async fn resolve_strategy(
        &self,
        request: &TransferRequest,
        client: &Client,
    ) -> Result<ResolvedStrategy, FetchError> {
        let (total_size, probe) = match request.strategy {
            Strategy::Single => (None, None),
            // One resource at a time here; multi-file fan-out happens above
            // this layer, so the hint degrades to chunked.
            Strategy::Chunked | Strategy::MultiFile => match request.expected_size {
                Some(size) => (Some(size), None),
                None => {
                    let probe =
                        probe_range(client, &request.url, request.max_retries).await?;
                    if !probe.supports_range {
                        return Ok(ResolvedStrategy::Single);
                    }
                    (probe.total_size, Some(probe))
                }
            },
        };

        Ok(match total_size {
            Some(size) if request.chunk_count > 1 && size >= SMALL_FILE_THRESHOLD => {
                // The probe result, when taken, rides along so the
                // coordinator does not re-issue it.
                ResolvedStrategy::Chunked {
                    total_size: size,
                    probe,
                }
            }
            _ => ResolvedStrategy::Single,
        })
    }

    /// Zero-network fast path: the destination is already at the expected
    /// size and either the persisted record says every chunk completed, or a
    /// supplied checksum validates the bytes on disk.
    async fn already_complete(
        &self,
        request: &TransferRequest,
        fingerprint: &TransferFingerprint,
    ) -> Result<bool, FetchError> {
        let Some(expected) = request.expected_size else {
            return Ok(false);
        };
        let metadata = match tokio::fs::metadata(&request.destination).await {
            Ok(m) => m,
            Err(_) => return Ok(false),
        };
        if !metadata.is_file() || metadata.len() != expected {
            return Ok(false);
        }

        match self.store.load(fingerprint).await {
            Ok(Some(record)) => return Ok(record.all_completed()),
            Ok(None) => {}
            // A corrupt record never short-circuits a fetch.
            Err(FetchError::ProgressCorruption(_)) => return Ok(false),
            Err(e) => return Err(e),
        }

        if let Some(expected) = &request.checksum {
            return checksum::validate(&request.destination, &expected.value, expected.algorithm)
                .await;
        }
        Ok(false)
    }
}

struct TransferOutcome {
    path: PathBuf,
    checksum_verified: bool,
}

/// The fetch mode after the strategy hint, size, and probe are reconciled.
#[derive(Debug, Clone, Copy)]
enum ResolvedStrategy {
    Single,
    Chunked {
        total_size: u64,
        /// Probe already taken during resolution, if any.
        probe: Option<RangeProbe>,
    },
}
