//! Local staging area.
//!
//! Decoded frames are written as JPEG files under the staging directory with
//! deterministic names, and the source containers live under the container
//! directory as `{document_id}.tif`.

use std::io::{self, Cursor};
use std::path::{Path, PathBuf};

use image::{ImageBuffer, ImageFormat, Luma, Rgb};
use tiffster_core::{
    EngineConfig, PageNumber, SequenceIndex, StorageError, TiffsterError, TiffsterResult,
};

use crate::traits::{PixelLayout, Raster};

const FRAME_EXTENSION: &str = "jpg";
const CONTAINER_EXTENSION: &str = "tif";

/// Owns the staging and container directories.
#[derive(Debug, Clone)]
pub struct LocalStage {
    staging_dir: PathBuf,
    container_dir: PathBuf,
}

impl LocalStage {
    pub fn new(staging_dir: impl Into<PathBuf>, container_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            container_dir: container_dir.into(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(&config.staging_dir, &config.container_dir)
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub fn container_dir(&self) -> &Path {
        &self.container_dir
    }

    /// `{staging}/{document_id}_{page}_{sequence}.jpg`
    pub fn frame_path(
        &self,
        document_id: &str,
        page: PageNumber,
        sequence_index: SequenceIndex,
    ) -> PathBuf {
        self.staging_dir.join(format!(
            "{}_{}_{}.{}",
            document_id, page, sequence_index, FRAME_EXTENSION
        ))
    }

    /// `{container_dir}/{document_id}.tif`
    pub fn container_path(&self, document_id: &str) -> PathBuf {
        self.container_dir
            .join(format!("{}.{}", document_id, CONTAINER_EXTENSION))
    }

    pub async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    /// Encode a raster as JPEG and write it to `path`.
    ///
    /// The file appears atomically: bytes go to a sibling `.part` file that is
    /// renamed into place once fully written.
    pub async fn write_raster(&self, path: &Path, raster: Raster) -> TiffsterResult<()> {
        let encoded = tokio::task::spawn_blocking(move || encode_jpeg(&raster))
            .await
            .map_err(|e| {
                TiffsterError::Storage(StorageError::TaskFailed {
                    reason: e.to_string(),
                })
            })??;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| local_io(parent, e))?;
        }

        let partial = path.with_extension("part");
        tokio::fs::write(&partial, &encoded)
            .await
            .map_err(|e| local_io(&partial, e))?;
        tokio::fs::rename(&partial, path)
            .await
            .map_err(|e| local_io(path, e))?;

        tracing::debug!(path = %path.display(), bytes = encoded.len(), "Staged raster");
        Ok(())
    }

    /// Remove a staged file. Returns `false` if it was already gone.
    pub async fn remove(&self, path: &Path) -> TiffsterResult<bool> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(local_io(path, e)),
        }
    }

    /// Delete staged frames and containers whose names do not start with
    /// `prefix`. Individual failures are logged and skipped.
    pub async fn purge_foreign(&self, prefix: &str) -> usize {
        let frames = purge_dir(&self.staging_dir, FRAME_EXTENSION, prefix).await;
        let containers = purge_dir(&self.container_dir, CONTAINER_EXTENSION, prefix).await;
        frames + containers
    }
}

async fn purge_dir(dir: &Path, extension: &str, prefix: &str) -> usize {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return 0,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "Failed to list directory for purge");
            return 0;
        }
    };

    let mut removed = 0;
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "Directory listing interrupted");
                break;
            }
        };

        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(extension) {
            continue;
        }
        let keep = path
            .file_name()
            .and_then(|name| name.to_str())
            .map_or(false, |name| name.starts_with(prefix));
        if keep {
            continue;
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => removed += 1,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to purge file");
            }
        }
    }

    removed
}

fn encode_jpeg(raster: &Raster) -> TiffsterResult<Vec<u8>> {
    let mut bytes = Cursor::new(Vec::new());
    let result = match raster.layout {
        PixelLayout::Gray8 => {
            ImageBuffer::<Luma<u8>, _>::from_raw(raster.width, raster.height, raster.pixels.as_slice())
                .ok_or_else(|| raster_mismatch(raster))?
                .write_to(&mut bytes, ImageFormat::Jpeg)
        }
        PixelLayout::Rgb8 => {
            ImageBuffer::<Rgb<u8>, _>::from_raw(raster.width, raster.height, raster.pixels.as_slice())
                .ok_or_else(|| raster_mismatch(raster))?
                .write_to(&mut bytes, ImageFormat::Jpeg)
        }
    };

    result.map_err(|e| {
        TiffsterError::Storage(StorageError::Encode {
            reason: e.to_string(),
        })
    })?;
    Ok(bytes.into_inner())
}

fn raster_mismatch(raster: &Raster) -> TiffsterError {
    TiffsterError::Storage(StorageError::Encode {
        reason: format!(
            "raster is {} bytes, expected {} for {}x{} {:?}",
            raster.pixels.len(),
            raster.expected_len(),
            raster.width,
            raster.height,
            raster.layout
        ),
    })
}

fn local_io(path: &Path, e: io::Error) -> TiffsterError {
    TiffsterError::Storage(StorageError::LocalIo {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn stage(dir: &TempDir) -> LocalStage {
        LocalStage::new(dir.path().join("jpg"), dir.path().join("tiff"))
    }

    #[test]
    fn test_paths_are_deterministic() {
        let stage = LocalStage::new("/data/jpg", "/data/tiff");
        assert_eq!(
            stage.frame_path("scan", 2, 5),
            PathBuf::from("/data/jpg/scan_2_5.jpg")
        );
        assert_eq!(
            stage.container_path("scan"),
            PathBuf::from("/data/tiff/scan.tif")
        );
    }

    #[tokio::test]
    async fn test_write_raster_creates_jpeg() {
        let dir = TempDir::new().unwrap();
        let stage = stage(&dir);
        let path = stage.frame_path("doc", 1, 1);

        stage
            .write_raster(&path, Raster::gray(8, 8, vec![128; 64]))
            .await
            .unwrap();

        assert!(stage.exists(&path).await);
        assert!(!stage.exists(&path.with_extension("part")).await);
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }

    #[tokio::test]
    async fn test_write_raster_rejects_short_buffer() {
        let dir = TempDir::new().unwrap();
        let stage = stage(&dir);
        let path = stage.frame_path("doc", 1, 1);

        let err = stage
            .write_raster(&path, Raster::rgb(8, 8, vec![0; 10]))
            .await
            .unwrap_err();
        assert!(matches!(err, TiffsterError::Storage(StorageError::Encode { .. })));
        assert!(!stage.exists(&path).await);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let stage = stage(&dir);
        let path = stage.frame_path("doc", 1, 1);
        stage
            .write_raster(&path, Raster::gray(2, 2, vec![0; 4]))
            .await
            .unwrap();

        assert!(stage.remove(&path).await.unwrap());
        assert!(!stage.remove(&path).await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_foreign_keeps_prefixed_files() {
        let dir = TempDir::new().unwrap();
        let stage = stage(&dir);
        for doc in ["current", "old"] {
            stage
                .write_raster(&stage.frame_path(doc, 1, 1), Raster::gray(2, 2, vec![0; 4]))
                .await
                .unwrap();
        }
        std::fs::create_dir_all(stage.container_dir()).unwrap();
        std::fs::write(stage.container_path("current"), b"II*\0").unwrap();
        std::fs::write(stage.container_path("old"), b"II*\0").unwrap();
        std::fs::write(stage.container_dir().join("notes.txt"), b"keep").unwrap();

        let removed = stage.purge_foreign("current").await;

        assert_eq!(removed, 2);
        assert!(stage.exists(&stage.frame_path("current", 1, 1)).await);
        assert!(!stage.exists(&stage.frame_path("old", 1, 1)).await);
        assert!(stage.exists(&stage.container_path("current")).await);
        assert!(!stage.exists(&stage.container_path("old")).await);
        assert!(stage.exists(&stage.container_dir().join("notes.txt")).await);
    }

    #[tokio::test]
    async fn test_purge_foreign_tolerates_missing_directories() {
        let dir = TempDir::new().unwrap();
        assert_eq!(stage(&dir).purge_foreign("doc").await, 0);
    }
}
