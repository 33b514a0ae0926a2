//! Zip upload → tar stream conversion.
//!
//! Uploaded site archives arrive as zip files; the container daemon's copy
//! endpoint takes tar. The conversion reads every regular file, keeps its
//! zip-relative path and mode, and skips directories (tar creates parents
//! implicitly on unpack).

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::spawn_blocking;
use tracing::debug;

use crate::error::{InfraError, InfraResult};
use crate::traits::ArchiveOps;

const DEFAULT_FILE_MODE: u32 = 0o644;

/// [`ArchiveOps`] reading zip files from the staging area.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipExtractor;

impl ZipExtractor {
    /// Create a zip extractor.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ArchiveOps for ZipExtractor {
    async fn extract_zip(&self, path: &Path) -> InfraResult<Bytes> {
        let path = path.to_owned();
        spawn_blocking(move || zip_to_tar(&path))
            .await
            .map_err(|e| InfraError::adapter("archive", format!("extraction task: {e}")))?
    }
}

fn zip_to_tar(path: &PathBuf) -> InfraResult<Bytes> {
    let file = File::open(path)
        .map_err(|e| InfraError::adapter("archive", format!("open {}: {e}", path.display())))?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| InfraError::adapter("archive", format!("read zip: {e}")))?;

    let mut tar_data = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut tar_data);

        for index in 0..archive.len() {
            let mut entry = archive
                .by_index(index)
                .map_err(|e| InfraError::adapter("archive", format!("zip entry {index}: {e}")))?;

            if entry.is_dir() {
                continue;
            }

            // Reject entries that would escape the destination directory.
            let name = entry
                .enclosed_name()
                .ok_or_else(|| {
                    InfraError::adapter(
                        "archive",
                        format!("unsafe path in zip: {}", entry.name()),
                    )
                })?
                .to_owned();

            let mut contents = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut contents)
                .map_err(|e| InfraError::adapter("archive", format!("read {}: {e}", name.display())))?;

            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(entry.unix_mode().unwrap_or(DEFAULT_FILE_MODE));
            header.set_cksum();
            builder
                .append_data(&mut header, &name, contents.as_slice())
                .map_err(|e| InfraError::adapter("archive", format!("tar {}: {e}", name.display())))?;
        }

        builder
            .finish()
            .map_err(|e| InfraError::adapter("archive", format!("tar finish: {e}")))?;
    }

    debug!(
        source = %path.display(),
        tar_size = tar_data.len(),
        "converted zip upload to tar stream"
    );
    Ok(Bytes::from(tar_data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn write_test_zip(path: &Path) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);

        writer
            .start_file("index.html", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"<h1>hello</h1>").unwrap();

        writer
            .add_directory("assets/", SimpleFileOptions::default())
            .unwrap();
        writer
            .start_file(
                "assets/run.sh",
                SimpleFileOptions::default().unix_permissions(0o755),
            )
            .unwrap();
        writer.write_all(b"#!/bin/sh\n").unwrap();

        writer.finish().unwrap();
    }

    #[tokio::test]
    async fn regular_files_survive_with_paths_and_modes() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("site.zip");
        write_test_zip(&zip_path);

        let tar_bytes = ZipExtractor::new().extract_zip(&zip_path).await.unwrap();

        let mut reader = tar::Archive::new(tar_bytes.as_ref());
        let mut seen = Vec::new();
        for entry in reader.entries().unwrap() {
            let entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().into_owned();
            let mode = entry.header().mode().unwrap();
            seen.push((path, mode));
        }

        assert_eq!(seen.len(), 2, "directories are skipped");
        assert!(seen.contains(&("index.html".to_owned(), 0o644)));
        assert!(seen.contains(&("assets/run.sh".to_owned(), 0o755)));
    }

    #[tokio::test]
    async fn missing_archive_errors() {
        let err = ZipExtractor::new()
            .extract_zip(Path::new("/nonexistent/site.zip"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("archive"));
    }
}
