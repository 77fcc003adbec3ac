//! Error types for the datafetch core

use datafetch_types::{ErrorDetail, ErrorKind, TransferStage};
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in the transfer engine
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP status {status}")]
    HttpStatus { status: u16, chunk: Option<u32> },

    #[error("Server does not honor range requests")]
    RangeNotSupported,

    #[error("Connection ended before the requested range completed")]
    TruncatedBody { chunk: Option<u32> },

    #[error("Invalid chunk plan: {0}")]
    InvalidPlan(String),

    #[error("Size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Path traversal attempt: {rejected:?} escape the destination")]
    PathTraversal { rejected: Vec<PathBuf> },

    #[error("Insufficient disk space: need {required} bytes, have {available}")]
    InsufficientSpace { required: u64, available: u64 },

    #[error("Unsupported archive format: {0}")]
    UnsupportedFormat(String),

    #[error("Progress record corrupt: {0}")]
    ProgressCorruption(String),

    #[error("Transfer was cancelled")]
    Cancelled,

    #[error("Chunk {chunk} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        chunk: u32,
        attempts: u32,
        #[source]
        source: Box<FetchError>,
    },
}

impl FetchError {
    /// Check if this error is retryable with backoff.
    ///
    /// Transient network failures and 5xx/408/429 responses are retryable;
    /// other 4xx responses and every local error are terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Network(e) => {
                // Connection-level failures and timeouts come back as
                // transport errors; a status captured by error_for_status
                // is classified by code.
                match e.status() {
                    Some(status) => is_retryable_status(status.as_u16()),
                    None => true,
                }
            }
            FetchError::HttpStatus { status, .. } => is_retryable_status(*status),
            FetchError::TruncatedBody { .. } => true,
            _ => false,
        }
    }

    /// Map to the structured detail carried on a failed `TransferResult`.
    pub fn detail(&self, stage: TransferStage) -> ErrorDetail {
        let kind = match self {
            FetchError::Network(_)
            | FetchError::RangeNotSupported
            | FetchError::TruncatedBody { .. } => ErrorKind::Network,
            FetchError::HttpStatus { status, .. } => {
                if is_retryable_status(*status) {
                    ErrorKind::Network
                } else {
                    ErrorKind::Client
                }
            }
            FetchError::InvalidUrl(_) => ErrorKind::Client,
            FetchError::InvalidPlan(_) => ErrorKind::InvalidPlan,
            FetchError::SizeMismatch { .. } => ErrorKind::SizeMismatch,
            FetchError::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            FetchError::PathTraversal { .. } => ErrorKind::PathTraversal,
            FetchError::InsufficientSpace { .. } => ErrorKind::InsufficientSpace,
            FetchError::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            FetchError::ProgressCorruption(_) => ErrorKind::ProgressCorruption,
            FetchError::Cancelled => ErrorKind::Cancelled,
            FetchError::Io(_) | FetchError::Database(_) => ErrorKind::Io,
            FetchError::RetriesExhausted { source, .. } => {
                return ErrorDetail {
                    chunk_index: self.chunk_index(),
                    ..source.detail(stage)
                }
            }
        };

        ErrorDetail {
            kind,
            message: self.to_string(),
            stage,
            chunk_index: self.chunk_index(),
            path: match self {
                FetchError::PathTraversal { rejected } => rejected.first().cloned(),
                _ => None,
            },
        }
    }

    fn chunk_index(&self) -> Option<u32> {
        match self {
            FetchError::HttpStatus { chunk, .. } | FetchError::TruncatedBody { chunk } => *chunk,
            FetchError::RetriesExhausted { chunk, .. } => Some(*chunk),
            _ => None,
        }
    }
}

/// Retryable HTTP statuses: all 5xx plus 408 (request timeout) and
/// 429 (too many requests).
pub(crate) fn is_retryable_status(status: u16) -> bool {
    status >= 500 || status == 408 || status == 429
}
