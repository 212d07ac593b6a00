//! File-backed blob store for downloaded page bodies.
//!
//! Addresses are (task id, attempt number); the put is conditional, so
//! a duplicate delivery of the same attempt observes the first write
//! instead of clobbering it.
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;

use crate::core::error::{OrchestratorError, Result};
use crate::core::traits::{BlobStore, PutOutcome};
use crate::core::types::{BlobRef, TaskId};

pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| OrchestratorError::StoreUnavailable(format!("blob root: {}", e)))?;
        Ok(Self { root })
    }

    fn key(task: &TaskId, attempt: u32) -> String {
        format!("{}/{}.html", task, attempt)
    }

    fn path_for(&self, blob: &BlobRef) -> PathBuf {
        self.root.join(blob.as_str())
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn put_if_absent(&self, task: &TaskId, attempt: u32, body: Bytes) -> Result<PutOutcome> {
        let blob = BlobRef::new(Self::key(task, attempt));
        let path = self.path_for(&blob);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| OrchestratorError::StoreUnavailable(format!("blob dir: {}", e)))?;
        }
        if fs::try_exists(&path)
            .await
            .map_err(|e| OrchestratorError::StoreUnavailable(format!("blob stat: {}", e)))?
        {
            return Ok(PutOutcome::AlreadyExists(blob));
        }
        fs::write(&path, &body)
            .await
            .map_err(|e| OrchestratorError::StoreUnavailable(format!("blob write: {}", e)))?;
        Ok(PutOutcome::Created(blob))
    }

    async fn get(&self, blob: &BlobRef) -> Result<Bytes> {
        let path = self.path_for(blob);
        match fs::read(&path).await {
            Ok(body) => Ok(Bytes::from(body)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(OrchestratorError::NotFound {
                    entity: "blob",
                    id: blob.to_string(),
                })
            }
            Err(e) => Err(OrchestratorError::StoreUnavailable(format!(
                "blob read: {}",
                e
            ))),
        }
    }

    async fn exists(&self, blob: &BlobRef) -> Result<bool> {
        fs::try_exists(self.path_for(blob))
            .await
            .map_err(|e| OrchestratorError::StoreUnavailable(format!("blob stat: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn put_is_write_once_per_attempt() {
        let dir = TempDir::new().unwrap();
        let store = FileBlobStore::new(dir.path()).unwrap();
        let task = TaskId::generate();

        let first = store
            .put_if_absent(&task, 1, Bytes::from_static(b"<html>a</html>"))
            .await
            .unwrap();
        let blob = match first {
            PutOutcome::Created(r) => r,
            PutOutcome::AlreadyExists(_) => panic!("fresh address reported as existing"),
        };

        let second = store
            .put_if_absent(&task, 1, Bytes::from_static(b"<html>b</html>"))
            .await
            .unwrap();
        assert!(matches!(second, PutOutcome::AlreadyExists(_)));

        // First write wins.
        assert_eq!(store.get(&blob).await.unwrap(), Bytes::from_static(b"<html>a</html>"));

        // A new attempt gets its own address.
        let third = store
            .put_if_absent(&task, 2, Bytes::from_static(b"<html>b</html>"))
            .await
            .unwrap();
        assert!(matches!(third, PutOutcome::Created(_)));
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = FileBlobStore::new(dir.path()).unwrap();
        let blob = BlobRef::new("task_missing/1.html");
        assert!(!store.exists(&blob).await.unwrap());
        let err = store.get(&blob).await.unwrap_err();
        assert_eq!(err.kind(), crate::core::error::ErrorKind::NotFound);
    }
}
