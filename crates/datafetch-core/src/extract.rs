//! Archive extraction with traversal-safe member validation
//!
//! Members are enumerated and validated before any byte is written: one
//! escaping path aborts the whole extraction, and a disk-space precheck
//! against the summed uncompressed sizes fails fast instead of leaving a
//! partial tree to clean up.
//!
//! Supports tar, tar.gz, zip, and gz (a member-count-one format). The archive
//! crates are synchronous, so all work runs under `spawn_blocking`.

use crate::error::FetchError;
use datafetch_types::ArchiveFormat;
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

/// Extraction settings.
#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    /// Override for the available-space check; `None` queries the disk that
    /// holds the destination. Setting `Some(0)` effectively simulates a full
    /// disk.
    pub available_space: Option<u64>,
}

/// One enumerated archive member.
#[derive(Debug, Clone)]
struct MemberInfo {
    path: PathBuf,
    size: u64,
    is_dir: bool,
}

/// Extract `archive` into `dest_dir`, returning the destination directory.
pub async fn extract(
    archive: &Path,
    format: ArchiveFormat,
    dest_dir: &Path,
    options: ExtractOptions,
) -> Result<PathBuf, FetchError> {
    let archive = archive.to_path_buf();
    let dest = dest_dir.to_path_buf();

    tokio::task::spawn_blocking(move || extract_sync(&archive, format, &dest, &options))
        .await
        .map_err(|e| FetchError::Io(std::io::Error::other(format!("extract task failed: {}", e))))?
}

fn extract_sync(
    archive: &Path,
    format: ArchiveFormat,
    dest: &Path,
    options: &ExtractOptions,
) -> Result<PathBuf, FetchError> {
    info!(
        "Extracting {:?} archive {} into {}",
        format,
        archive.display(),
        dest.display()
    );

    // Phase 1: enumerate and validate every member before writing anything.
    let members = list_members(archive, format)?;

    let rejected: Vec<PathBuf> = members
        .iter()
        .filter(|m| !is_safe_member_path(&m.path))
        .map(|m| m.path.clone())
        .collect();
    if !rejected.is_empty() {
        warn!(
            "Rejecting archive {}: {} member(s) escape the destination",
            archive.display(),
            rejected.len()
        );
        return Err(FetchError::PathTraversal { rejected });
    }

    // Phase 2: disk-space precheck against summed uncompressed sizes.
    let required: u64 = members.iter().map(|m| m.size).sum();
    let available = match options.available_space {
        Some(space) => space,
        None => available_space_for(dest),
    };
    if available < required {
        return Err(FetchError::InsufficientSpace {
            required,
            available,
        });
    }

    // Phase 3: write.
    std::fs::create_dir_all(dest)?;
    match format {
        ArchiveFormat::Tar => extract_tar(File::open(archive)?, dest)?,
        ArchiveFormat::TarGz => extract_tar(GzDecoder::new(File::open(archive)?), dest)?,
        ArchiveFormat::Zip => extract_zip(archive, dest)?,
        ArchiveFormat::Gz => extract_gz(archive, dest)?,
    }

    info!("Extraction complete: {}", dest.display());
    Ok(dest.to_path_buf())
}

/// Enumerate members with their uncompressed sizes.
fn list_members(archive: &Path, format: ArchiveFormat) -> Result<Vec<MemberInfo>, FetchError> {
    match format {
        ArchiveFormat::Tar => list_tar(File::open(archive)?),
        ArchiveFormat::TarGz => list_tar(GzDecoder::new(File::open(archive)?)),
        ArchiveFormat::Zip => {
            let mut zip = zip::ZipArchive::new(File::open(archive)?)
                .map_err(|e| FetchError::UnsupportedFormat(format!("not a zip archive: {}", e)))?;
            let mut members = Vec::with_capacity(zip.len());
            for i in 0..zip.len() {
                let entry = zip
                    .by_index(i)
                    .map_err(|e| FetchError::UnsupportedFormat(format!("bad zip entry: {}", e)))?;
                members.push(MemberInfo {
                    path: PathBuf::from(entry.name()),
                    size: entry.size(),
                    is_dir: entry.is_dir(),
                });
            }
            Ok(members)
        }
        ArchiveFormat::Gz => {
            // Single decompressed member named after the archive. The ISIZE
            // trailer holds the uncompressed length (mod 2^32) as a hint.
            let name = gz_output_name(archive)?;
            Ok(vec![MemberInfo {
                path: PathBuf::from(name),
                size: gz_isize_hint(archive)?,
                is_dir: false,
            }])
        }
    }
}

fn list_tar<R: Read>(reader: R) -> Result<Vec<MemberInfo>, FetchError> {
    let mut tar = tar::Archive::new(reader);
    let mut members = Vec::new();

    for entry in tar.entries()? {
        let entry = entry?;
        let header = entry.header();
        let path = entry.path()?.into_owned();

        // Symlink and hardlink targets can escape too; validate them against
        // the link's own directory.
        if header.entry_type().is_symlink() || header.entry_type().is_hard_link() {
            if let Some(target) = entry.link_name()? {
                if !is_safe_link_target(&path, &target) {
                    members.push(MemberInfo {
                        // Surface the offending target as the rejected path
                        path: target.into_owned(),
                        size: 0,
                        is_dir: false,
                    });
                    continue;
                }
            }
        }

        members.push(MemberInfo {
            path,
            size: entry.size(),
            is_dir: header.entry_type().is_dir(),
        });
    }

    Ok(members)
}

fn extract_tar<R: Read>(reader: R, dest: &Path) -> Result<(), FetchError> {
    let mut tar = tar::Archive::new(reader);

    for entry in tar.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let target = dest.join(&path);

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&target)?;
        debug!("Extracted {}", path.display());
    }

    Ok(())
}

fn extract_zip(archive: &Path, dest: &Path) -> Result<(), FetchError> {
    let mut zip = zip::ZipArchive::new(File::open(archive)?)
        .map_err(|e| FetchError::UnsupportedFormat(format!("not a zip archive: {}", e)))?;

    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| FetchError::UnsupportedFormat(format!("bad zip entry: {}", e)))?;
        let target = dest.join(entry.name());

        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        std::io::copy(&mut entry, &mut out)?;
        debug!("Extracted {}", entry.name());
    }

    Ok(())
}

fn extract_gz(archive: &Path, dest: &Path) -> Result<(), FetchError> {
    let output = dest.join(gz_output_name(archive)?);
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut decoder = GzDecoder::new(File::open(archive)?);
    let mut out = File::create(&output)?;
    std::io::copy(&mut decoder, &mut out)?;
    debug!("Decompressed to {}", output.display());

    Ok(())
}

/// Output file name for a gz archive: the archive name minus its `.gz`
/// suffix.
fn gz_output_name(archive: &Path) -> Result<String, FetchError> {
    let name = archive
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| FetchError::UnsupportedFormat("unnamed gz archive".into()))?;

    Ok(name
        .strip_suffix(".gz")
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}.out", name)))
}

/// Read the gzip ISIZE trailer: uncompressed length mod 2^32.
fn gz_isize_hint(archive: &Path) -> Result<u64, FetchError> {
    let mut file = File::open(archive)?;
    let len = file.metadata()?.len();
    if len < 4 {
        return Ok(0);
    }
    file.seek(SeekFrom::End(-4))?;
    let mut trailer = [0u8; 4];
    file.read_exact(&mut trailer)?;
    Ok(u32::from_le_bytes(trailer) as u64)
}

/// Whether a member path stays beneath the extraction directory.
///
/// Rejects absolute paths, Windows prefixes, and any `..` component — the
/// member must be expressible as a plain descendant path.
fn is_safe_member_path(path: &Path) -> bool {
    if path.as_os_str().is_empty() {
        return false;
    }
    for component in path.components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return false,
            Component::CurDir | Component::Normal(_) => {}
        }
    }
    true
}

/// Whether a link target, resolved relative to the link's directory, stays
/// beneath the extraction root.
fn is_safe_link_target(link_path: &Path, target: &Path) -> bool {
    if target.is_absolute() {
        return false;
    }

    // Walk the target from the link's parent directory, tracking depth; any
    // step above the root escapes.
    let mut depth: i64 = link_path.components().count() as i64 - 1;
    for component in target.components() {
        match component {
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    true
}

/// Available bytes on the disk holding `path` (longest mount-point match).
/// Returns `u64::MAX` when no disk matches, so the check degrades to a no-op
/// rather than a false failure.
fn available_space_for(path: &Path) -> u64 {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn tar_gz_with(entries: &[(&str, &[u8])]) -> tempfile::NamedTempFile {
        let file = tempfile::Builder::new().suffix(".tar.gz").tempfile().unwrap();
        let gz = flate2::write::GzEncoder::new(
            file.reopen().unwrap(),
            flate2::Compression::default(),
        );
        let mut builder = tar::Builder::new(gz);
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
        file
    }

    /// Build a tar.gz from raw 512-byte blocks, bypassing the writer's own
    /// member-name validation so hostile names like `../../etc/passwd` can
    /// actually be encoded.
    fn raw_tar_gz_with(entries: &[(&str, &[u8])]) -> tempfile::NamedTempFile {
        let mut tar_bytes = Vec::new();
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            {
                let gnu = header.as_gnu_mut().unwrap();
                gnu.name[..name.len()].copy_from_slice(name.as_bytes());
            }
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_entry_type(tar::EntryType::Regular);
            header.set_cksum();

            tar_bytes.extend_from_slice(header.as_bytes());
            tar_bytes.extend_from_slice(data);
            tar_bytes.resize(tar_bytes.len().div_ceil(512) * 512, 0);
        }
        // End-of-archive marker
        tar_bytes.extend_from_slice(&[0u8; 1024]);

        let file = tempfile::Builder::new().suffix(".tar.gz").tempfile().unwrap();
        let mut gz = flate2::write::GzEncoder::new(
            file.reopen().unwrap(),
            flate2::Compression::default(),
        );
        gz.write_all(&tar_bytes).unwrap();
        gz.finish().unwrap();
        file
    }

    fn zip_with(entries: &[(&str, &[u8])]) -> tempfile::NamedTempFile {
        let file = tempfile::Builder::new().suffix(".zip").tempfile().unwrap();
        let mut writer = zip::ZipWriter::new(file.reopen().unwrap());
        let opts = zip::write::FileOptions::default();
        for (name, data) in entries {
            writer.start_file(*name, opts).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
        file
    }

    #[tokio::test]
    async fn extracts_tar_gz_members() {
        let archive = tar_gz_with(&[("a.txt", b"alpha"), ("sub/b.txt", b"beta")]);
        let dest = tempfile::tempdir().unwrap();

        let out = extract(
            archive.path(),
            ArchiveFormat::TarGz,
            dest.path(),
            ExtractOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(std::fs::read(out.join("a.txt")).unwrap(), b"alpha");
        assert_eq!(std::fs::read(out.join("sub/b.txt")).unwrap(), b"beta");
    }

    #[tokio::test]
    async fn extracts_zip_members() {
        let archive = zip_with(&[("x.bin", b"xx"), ("dir/y.bin", b"yy")]);
        let dest = tempfile::tempdir().unwrap();

        extract(
            archive.path(),
            ArchiveFormat::Zip,
            dest.path(),
            ExtractOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(std::fs::read(dest.path().join("x.bin")).unwrap(), b"xx");
        assert_eq!(std::fs::read(dest.path().join("dir/y.bin")).unwrap(), b"yy");
    }

    #[tokio::test]
    async fn extracts_gz_single_member() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("data.csv.gz");
        let mut gz = flate2::write::GzEncoder::new(
            File::create(&archive_path).unwrap(),
            flate2::Compression::default(),
        );
        gz.write_all(b"1,2,3\n").unwrap();
        gz.finish().unwrap();

        let dest = tempfile::tempdir().unwrap();
        extract(
            &archive_path,
            ArchiveFormat::Gz,
            dest.path(),
            ExtractOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(
            std::fs::read(dest.path().join("data.csv")).unwrap(),
            b"1,2,3\n"
        );
    }

    #[tokio::test]
    async fn traversal_member_aborts_with_no_files_written() {
        let archive = raw_tar_gz_with(&[("ok.txt", b"fine"), ("../../etc/passwd", b"root:x")]);
        let dest = tempfile::tempdir().unwrap();

        let result = extract(
            archive.path(),
            ArchiveFormat::TarGz,
            dest.path(),
            ExtractOptions::default(),
        )
        .await;

        match result {
            Err(FetchError::PathTraversal { rejected }) => {
                assert_eq!(rejected, vec![PathBuf::from("../../etc/passwd")]);
            }
            other => panic!("expected PathTraversal, got {:?}", other.map(|_| ())),
        }

        // Nothing was written, not even the safe member
        assert!(std::fs::read_dir(dest.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn absolute_member_is_rejected() {
        let archive = zip_with(&[("/tmp/evil", b"no")]);
        let dest = tempfile::tempdir().unwrap();

        let result = extract(
            archive.path(),
            ArchiveFormat::Zip,
            dest.path(),
            ExtractOptions::default(),
        )
        .await;
        assert!(matches!(result, Err(FetchError::PathTraversal { .. })));
    }

    #[tokio::test]
    async fn insufficient_space_fails_before_writing() {
        let archive = tar_gz_with(&[("big.bin", &[0u8; 1024])]);
        let dest = tempfile::tempdir().unwrap();

        let result = extract(
            archive.path(),
            ArchiveFormat::TarGz,
            dest.path(),
            ExtractOptions {
                available_space: Some(16),
            },
        )
        .await;

        match result {
            Err(FetchError::InsufficientSpace { required, available }) => {
                assert_eq!(required, 1024);
                assert_eq!(available, 16);
            }
            other => panic!("expected InsufficientSpace, got {:?}", other.map(|_| ())),
        }
        assert!(std::fs::read_dir(dest.path()).unwrap().next().is_none());
    }

    #[test]
    fn member_path_safety() {
        assert!(is_safe_member_path(Path::new("file.txt")));
        assert!(is_safe_member_path(Path::new("a/b/c.txt")));
        assert!(is_safe_member_path(Path::new("./a/b")));
        assert!(!is_safe_member_path(Path::new("../escape")));
        assert!(!is_safe_member_path(Path::new("a/../../escape")));
        assert!(!is_safe_member_path(Path::new("/etc/passwd")));
        assert!(!is_safe_member_path(Path::new("")));
    }

    #[test]
    fn link_target_safety() {
        // bin/link -> ../lib stays inside the root
        assert!(is_safe_link_target(Path::new("bin/link"), Path::new("../lib")));
        // top-level link -> ../../etc escapes
        assert!(!is_safe_link_target(Path::new("link"), Path::new("../etc")));
        assert!(!is_safe_link_target(
            Path::new("bin/link"),
            Path::new("/etc/passwd")
        ));
    }
}
