//! Streaming checksum computation and validation
//!
//! Fixed memory regardless of file size: the file is hashed in 64 KiB reads,
//! never loaded whole.

use crate::error::FetchError;
use datafetch_types::ChecksumAlgorithm;
use md5::Md5;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

const READ_BUF_SIZE: usize = 64 * 1024;

/// Compute the hex digest of a file.
pub async fn compute(path: &Path, algorithm: ChecksumAlgorithm) -> Result<String, FetchError> {
    let mut file = File::open(path).await?;
    let mut buf = vec![0u8; READ_BUF_SIZE];

    let digest = match algorithm {
        ChecksumAlgorithm::Md5 => {
            let mut hasher = Md5::new();
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            hex::encode(hasher.finalize())
        }
        ChecksumAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            hex::encode(hasher.finalize())
        }
    };

    debug!("Computed {:?} digest for {}: {}", algorithm, path.display(), digest);
    Ok(digest)
}

/// Validate a file against an expected digest (case-insensitive).
///
/// A content mismatch is `Ok(false)` — the file is wrong but readable.
/// An I/O failure reading the file is an `Err`, so callers can tell the two
/// apart.
pub async fn validate(
    path: &Path,
    expected: &str,
    algorithm: ChecksumAlgorithm,
) -> Result<bool, FetchError> {
    let actual = compute(path, algorithm).await?;
    let matches = actual.eq_ignore_ascii_case(expected);
    if matches {
        info!("Checksum verified for {}", path.display());
    } else {
        info!(
            "Checksum mismatch for {}: expected {}, got {}",
            path.display(),
            expected,
            actual
        );
    }
    Ok(matches)
}
