use std::io::Read;
use std::path::{Component, Path};

use crate::error::{DrydockError, Result};

/// Unpack a shard tarball (`.tar.gz`, `.tar.xz` or `.tar.zst`) into `dest_dir`.
pub fn extract_archive(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    let filename = archive_path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("");

    if filename.ends_with(".tar.zst") {
        extract_tar_zst(archive_path, dest_dir)
    } else if filename.ends_with(".tar.gz") || filename.ends_with(".tgz") {
        extract_tar_gz(archive_path, dest_dir)
    } else if filename.ends_with(".tar.xz") {
        extract_tar_xz(archive_path, dest_dir)
    } else {
        Err(DrydockError::ArchiveError(format!(
            "unsupported archive format: {}",
            filename
        )))
    }
}

fn open(archive_path: &Path) -> Result<std::fs::File> {
    std::fs::File::open(archive_path).map_err(|e| {
        DrydockError::ArchiveError(format!("failed to open {}: {}", archive_path.display(), e))
    })
}

pub fn extract_tar_zst(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    let decoder = zstd::Decoder::new(open(archive_path)?)
        .map_err(|e| DrydockError::ArchiveError(format!("zstd decoder init failed: {}", e)))?;
    unpack_tar_safely(tar::Archive::new(decoder), dest_dir)
}

pub fn extract_tar_gz(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    let decoder = flate2::read::GzDecoder::new(open(archive_path)?);
    unpack_tar_safely(tar::Archive::new(decoder), dest_dir)
}

pub fn extract_tar_xz(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    let decoder = xz2::read::XzDecoder::new(open(archive_path)?);
    unpack_tar_safely(tar::Archive::new(decoder), dest_dir)
}

fn is_path_safe(path: &Path) -> bool {
    !path.is_absolute() && !path.components().any(|c| matches!(c, Component::ParentDir))
}

fn unpack_tar_safely<R: Read>(mut archive: tar::Archive<R>, dest_dir: &Path) -> Result<()> {
    // Shards carry setuid helpers and exact modes; keep them.
    archive.set_preserve_permissions(true);

    for entry in archive.entries().map_err(|e| {
        DrydockError::ArchiveError(format!("failed to read archive entries: {}", e))
    })? {
        let mut entry = entry
            .map_err(|e| DrydockError::ArchiveError(format!("failed to read tar entry: {}", e)))?;

        let path = entry
            .path()
            .map_err(|e| DrydockError::ArchiveError(format!("failed to read entry path: {}", e)))?;

        if !is_path_safe(&path) {
            return Err(DrydockError::ArchiveError(format!(
                "unsafe path in archive: {}",
                path.to_string_lossy()
            )));
        }

        entry
            .unpack_in(dest_dir)
            .map_err(|e| DrydockError::ArchiveError(format!("tar extract failed: {}", e)))?;
    }
    Ok(())
}
