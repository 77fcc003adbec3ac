//! Shared types for datafetch
//!
//! This crate contains the data model shared between the transfer engine
//! and the layers that drive it: requests, chunk plans, persisted progress
//! records and transfer results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Transfer Identity
// ============================================================================

/// Stable identity for a logical transfer, used to key resume state.
///
/// Derived deterministically from (URL, destination path, expected size):
/// two requests with the same fingerprint are the same transfer even across
/// process restarts. Changing any of the three inputs yields a new identity,
/// so a resized or relocated resource never resumes against stale state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferFingerprint(String);

impl TransferFingerprint {
    pub fn derive(url: &str, destination: &Path, expected_size: Option<u64>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        hasher.update(b"\n");
        hasher.update(destination.to_string_lossy().as_bytes());
        hasher.update(b"\n");
        match expected_size {
            Some(size) => hasher.update(size.to_string().as_bytes()),
            None => hasher.update(b"-"),
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Reconstruct a fingerprint from its stored hex form.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransferFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Chunk Types
// ============================================================================

/// A contiguous byte range of the source file, fetched independently.
///
/// Ranges are end-inclusive. A valid plan partitions `[0, total_size)`
/// exactly: no gaps, no overlaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSpec {
    pub index: u32,
    pub start: u64,
    pub end: u64,
}

impl ChunkSpec {
    pub fn new(index: u32, start: u64, end: u64) -> Self {
        Self { index, start, end }
    }

    /// Length of the range in bytes. Never zero: `end` is inclusive.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Lifecycle status of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::InProgress => "in_progress",
            ChunkStatus::Completed => "completed",
            ChunkStatus::Failed => "failed",
        }
    }
}

impl FromStr for ChunkStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ChunkStatus::Pending),
            "in_progress" => Ok(ChunkStatus::InProgress),
            "completed" => Ok(ChunkStatus::Completed),
            "failed" => Ok(ChunkStatus::Failed),
            other => Err(format!("unknown chunk status: {}", other)),
        }
    }
}

/// Mutable state of one chunk of a transfer.
///
/// Owned exclusively by the worker assigned to it while `InProgress`;
/// ownership returns to the coordinator on a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkState {
    pub spec: ChunkSpec,
    pub status: ChunkStatus,
    pub bytes_written: u64,
    pub attempt_count: u32,
}

impl ChunkState {
    pub fn new(spec: ChunkSpec) -> Self {
        Self {
            spec,
            status: ChunkStatus::Pending,
            bytes_written: 0,
            attempt_count: 0,
        }
    }

    /// Bytes still missing from this chunk.
    pub fn remaining(&self) -> u64 {
        self.spec.len().saturating_sub(self.bytes_written)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, ChunkStatus::Completed | ChunkStatus::Failed)
    }
}

// ============================================================================
// Progress Record
// ============================================================================

/// Durable record of per-chunk completion state for one fingerprint.
///
/// The single source of truth for resume. Created on the first attempt,
/// updated after every chunk transition, deleted after successful checksum
/// verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub fingerprint: TransferFingerprint,
    pub url: String,
    pub destination: PathBuf,
    pub total_size: u64,
    pub chunks: Vec<ChunkState>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressRecord {
    pub fn new(
        fingerprint: TransferFingerprint,
        url: String,
        destination: PathBuf,
        total_size: u64,
        plan: &[ChunkSpec],
    ) -> Self {
        let now = Utc::now();
        Self {
            fingerprint,
            url,
            destination,
            total_size,
            chunks: plan.iter().copied().map(ChunkState::new).collect(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn all_completed(&self) -> bool {
        !self.chunks.is_empty()
            && self.chunks.iter().all(|c| c.status == ChunkStatus::Completed)
    }

    /// Total bytes durably recorded as written across all chunks.
    pub fn bytes_written(&self) -> u64 {
        self.chunks.iter().map(|c| c.bytes_written).sum()
    }

    /// Whether the stored chunk boundaries exactly match a freshly computed
    /// plan. A mismatch (size or topology change) invalidates resume and the
    /// record must be discarded.
    pub fn matches_plan(&self, plan: &[ChunkSpec]) -> bool {
        self.chunks.len() == plan.len()
            && self
                .chunks
                .iter()
                .zip(plan.iter())
                .all(|(state, spec)| state.spec == *spec)
    }
}

// ============================================================================
// Request / Result Types
// ============================================================================

/// Checksum algorithm for end-to-end integrity verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Md5,
    Sha256,
}

impl FromStr for ChecksumAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Ok(ChecksumAlgorithm::Md5),
            "sha256" | "sha-256" => Ok(ChecksumAlgorithm::Sha256),
            other => Err(format!("unsupported checksum algorithm: {}", other)),
        }
    }
}

/// Expected checksum paired with its algorithm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checksum {
    pub value: String,
    pub algorithm: ChecksumAlgorithm,
}

impl Checksum {
    pub fn new(value: impl Into<String>, algorithm: ChecksumAlgorithm) -> Self {
        Self {
            value: value.into(),
            algorithm,
        }
    }
}

/// Supported archive formats. `Gz` is a member-count-one format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveFormat {
    Tar,
    TarGz,
    Zip,
    Gz,
}

impl ArchiveFormat {
    /// Detect the format from a file name extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else if name.ends_with(".tar") {
            Some(ArchiveFormat::Tar)
        } else if name.ends_with(".zip") {
            Some(ArchiveFormat::Zip)
        } else if name.ends_with(".gz") {
            Some(ArchiveFormat::Gz)
        } else {
            None
        }
    }
}

/// Caller's strategy hint. Resolved once during planning; `MultiFile` is the
/// hint used by the outer multi-file layer and resolves per resource like
/// `Chunked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Single,
    Chunked,
    MultiFile,
}

/// Extraction settings carried on a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractRequest {
    /// Declared format; `None` means detect from the archive file name.
    pub format: Option<ArchiveFormat>,
    /// Destination directory; `None` means the archive's parent directory.
    pub destination: Option<PathBuf>,
}

/// A resolved transfer request, constructed by an external config/CLI layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub url: String,
    pub destination: PathBuf,
    pub expected_size: Option<u64>,
    pub checksum: Option<Checksum>,
    pub strategy: Strategy,
    pub chunk_count: u32,
    pub concurrent_chunks: u32,
    pub max_retries: u32,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub extract: Option<ExtractRequest>,
    pub keep_archive: bool,
}

impl TransferRequest {
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            expected_size: None,
            checksum: None,
            strategy: Strategy::Chunked,
            chunk_count: 4,
            concurrent_chunks: 4,
            max_retries: 3,
            timeout: Duration::from_secs(30),
            extract: None,
            keep_archive: false,
        }
    }

    pub fn fingerprint(&self) -> TransferFingerprint {
        TransferFingerprint::derive(&self.url, &self.destination, self.expected_size)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_secs().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Engine state in which a failure occurred. Lets a resumed invocation skip
/// stages that already finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStage {
    Planning,
    Fetching,
    Verifying,
    Extracting,
}

/// Classified error category surfaced on a failed result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Client,
    InvalidPlan,
    SizeMismatch,
    ChecksumMismatch,
    PathTraversal,
    InsufficientSpace,
    UnsupportedFormat,
    ProgressCorruption,
    Cancelled,
    Io,
}

/// Structured error detail carried on a failed [`TransferResult`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
    pub stage: TransferStage,
    pub chunk_index: Option<u32>,
    pub path: Option<PathBuf>,
}

/// Outcome of one transfer. Created once at the end of an engine run and
/// immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferResult {
    pub path: PathBuf,
    pub success: bool,
    pub bytes_transferred: u64,
    pub checksum_verified: bool,
    pub error: Option<ErrorDetail>,
}

impl TransferResult {
    pub fn succeeded(path: PathBuf, bytes_transferred: u64, checksum_verified: bool) -> Self {
        Self {
            path,
            success: true,
            bytes_transferred,
            checksum_verified,
            error: None,
        }
    }

    pub fn failed(path: PathBuf, bytes_transferred: u64, error: ErrorDetail) -> Self {
        Self {
            path,
            success: false,
            bytes_transferred,
            checksum_verified: false,
            error: Some(error),
        }
    }
}
