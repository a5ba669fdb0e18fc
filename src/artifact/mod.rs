//! Flat-layout artifact storage for originals and compressed outputs.
//!
//! Files are stored under two base directories keyed by opaque job ids;
//! originals keep their upload extension, compressed outputs are always
//! `.gif`. Neither directory is ever listed or walked at request time —
//! every path is derived from a known job id.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

use crate::error::{AppError, Result};

#[derive(Clone)]
pub struct ArtifactStore {
    upload_dir: PathBuf,
    output_dir: PathBuf,
}

impl ArtifactStore {
    pub async fn new(upload_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Result<Self> {
        let upload_dir = upload_dir.into();
        let output_dir = output_dir.into();
        fs::create_dir_all(&upload_dir).await?;
        fs::create_dir_all(&output_dir).await?;
        Ok(Self { upload_dir, output_dir })
    }

    /// Persists an uploaded original under its job id, preserving the
    /// extension from `original_filename` so the probed tool can infer
    /// format from the path.
    pub async fn put_original(&self, job_id: &str, original_filename: &str, bytes: &[u8]) -> Result<String> {
        let ext = Path::new(original_filename)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("gif");
        let path = self.upload_dir.join(format!("{job_id}.{ext}"));
        fs::write(&path, bytes).await?;
        debug!(job_id, bytes = bytes.len(), "stored original artifact");
        Ok(path.to_string_lossy().into_owned())
    }

    pub fn compressed_path(&self, job_id: &str) -> PathBuf {
        self.output_dir.join(format!("{job_id}.gif"))
    }

    pub async fn size(&self, path: &str) -> Result<u64> {
        let meta = fs::metadata(path)
            .await
            .map_err(|_| AppError::NotFound { resource: format!("artifact at {path}") })?;
        Ok(meta.len())
    }

    pub async fn open(&self, path: &str) -> Result<Vec<u8>> {
        fs::read(path)
            .await
            .map_err(|_| AppError::NotFound { resource: format!("artifact at {path}") })
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete_job_artifacts(&self, original_path: &str, compressed_path: Option<&str>) -> Result<()> {
        self.delete(original_path).await?;
        if let Some(path) = compressed_path {
            self.delete(path).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_original_preserves_extension() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("up"), dir.path().join("out")).await.unwrap();

        let path = store.put_original("job-1", "cat.gif", b"GIF89a").await.unwrap();
        assert!(path.ends_with("job-1.gif"));
        let read_back = store.open(&path).await.unwrap();
        assert_eq!(read_back, b"GIF89a");
    }

    #[tokio::test]
    async fn open_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("up"), dir.path().join("out")).await.unwrap();

        let err = store.open("/no/such/path.gif").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound { .. }));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("up"), dir.path().join("out")).await.unwrap();
        let path = store.put_original("job-2", "x.gif", b"abc").await.unwrap();

        store.delete(&path).await.unwrap();
        store.delete(&path).await.unwrap();
    }
}
