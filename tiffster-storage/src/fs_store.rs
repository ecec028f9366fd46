//! Directory-backed remote object store.
//!
//! Objects are plain files in a bucket directory, addressed as
//! `fs://<object name>`. Uploaded frames sit at the top of the bucket; names
//! may also point into folders (`fs://containers/scan.tif`), which purges
//! never sweep. Useful for local deployments and as the reference store in
//! tests; a cloud-backed store implements the same trait.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tiffster_core::{RemoteRef, StorageError, TiffsterError, TiffsterResult, ValidationError};

use crate::traits::RemoteObjectStore;

const SCHEME: &str = "fs://";

#[derive(Debug, Clone)]
pub struct FsObjectStore {
    bucket: PathBuf,
}

impl FsObjectStore {
    pub fn new(bucket: impl Into<PathBuf>) -> Self {
        Self {
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &Path {
        &self.bucket
    }

    /// Resolve a reference to the object's path inside the bucket.
    pub fn object_path(&self, reference: &RemoteRef) -> TiffsterResult<PathBuf> {
        let name = reference
            .as_str()
            .strip_prefix(SCHEME)
            .filter(|name| is_object_name(name))
            .ok_or_else(|| ValidationError::MalformedRemoteRef {
                reference: reference.to_string(),
            })?;
        Ok(self.bucket.join(name))
    }

    /// Names of the objects at the top of the bucket.
    pub async fn list(&self) -> TiffsterResult<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.bucket).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(list_failed(e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(list_failed)? {
            let is_file = entry.file_type().await.map_err(list_failed)?.is_file();
            if !is_file {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

fn is_object_name(name: &str) -> bool {
    name.split('/').all(|segment| {
        !segment.is_empty() && segment != "." && segment != ".." && !segment.contains('\\')
    })
}

fn list_failed(e: io::Error) -> TiffsterError {
    TiffsterError::Storage(StorageError::RemoteList {
        reason: e.to_string(),
    })
}

#[async_trait]
impl RemoteObjectStore for FsObjectStore {
    async fn upload(&self, local_path: &Path) -> TiffsterResult<RemoteRef> {
        let upload_failed = |reason: String| {
            TiffsterError::Storage(StorageError::Upload {
                path: local_path.display().to_string(),
                reason,
            })
        };

        let name = local_path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| upload_failed("path has no usable file name".to_string()))?;

        tokio::fs::create_dir_all(&self.bucket)
            .await
            .map_err(|e| upload_failed(e.to_string()))?;
        tokio::fs::copy(local_path, self.bucket.join(name))
            .await
            .map_err(|e| upload_failed(e.to_string()))?;

        Ok(RemoteRef::new(format!("{}{}", SCHEME, name)))
    }

    async fn delete(&self, reference: &RemoteRef) -> TiffsterResult<()> {
        let path = self.object_path(reference)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TiffsterError::Storage(StorageError::RemoteDelete {
                reference: reference.to_string(),
                reason: e.to_string(),
            })),
        }
    }

    async fn download(&self, reference: &RemoteRef, destination: &Path) -> TiffsterResult<()> {
        let download_failed = |reason: String| {
            TiffsterError::Storage(StorageError::Download {
                reference: reference.to_string(),
                reason,
            })
        };

        let source = self.object_path(reference)?;
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| download_failed(e.to_string()))?;
        }

        let partial = destination.with_extension("part");
        let bytes = tokio::fs::copy(&source, &partial)
            .await
            .map_err(|e| download_failed(e.to_string()))?;
        tokio::fs::rename(&partial, destination)
            .await
            .map_err(|e| download_failed(e.to_string()))?;

        tracing::debug!(remote_ref = %reference, path = %destination.display(), bytes, "Downloaded object");
        Ok(())
    }

    async fn remove_all_except(&self, prefix: &str) -> TiffsterResult<usize> {
        let foreign: Vec<String> = self
            .list()
            .await?
            .into_iter()
            .filter(|name| !name.starts_with(prefix))
            .collect();

        let mut removed = 0;
        for name in &foreign {
            match tokio::fs::remove_file(self.bucket.join(name)).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(object = %name, error = %e, "Failed to delete remote object");
                }
            }
        }

        tracing::debug!(prefix, found = foreign.len(), removed, "Removed foreign remote objects");
        Ok(removed)
    }
}
