use std::future::Future;
use std::path::{Component, Path, PathBuf};

use crate::error::BatchError;

/// Content type for uploaded submissions.
pub const JSONL_CONTENT_TYPE: &str = "application/jsonl";

/// Durable object storage holding submissions and results.
pub trait ObjectStore: Send + Sync {
    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> impl Future<Output = Result<(), BatchError>> + Send;

    /// Fetch an object. A missing object is a `Transfer` error.
    fn get_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> impl Future<Output = Result<Vec<u8>, BatchError>> + Send;
}

/// Object store backed by a local directory: `root/{bucket}/{key}`.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a bucket/key pair, refusing anything that would leave the root.
    pub fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, BatchError> {
        let relative = Path::new(bucket).join(key);
        let escapes = bucket.is_empty()
            || key.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)));
        if escapes {
            return Err(BatchError::Transfer {
                key: key.to_string(),
                message: format!("invalid object location {bucket}/{key}"),
            });
        }
        Ok(self.root.join(relative))
    }
}

impl ObjectStore for FsObjectStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        _content_type: &str,
    ) -> Result<(), BatchError> {
        let path = self.object_path(bucket, key)?;
        let transfer_err = |e: std::io::Error| BatchError::Transfer {
            key: key.to_string(),
            message: e.to_string(),
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(transfer_err)?;
        }
        // Temp file + rename so readers never see a partial object
        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &body).await.map_err(transfer_err)?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(transfer_err(e));
        }
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BatchError> {
        let path = self.object_path(bucket, key)?;
        tokio::fs::read(&path).await.map_err(|e| BatchError::Transfer {
            key: key.to_string(),
            message: if e.kind() == std::io::ErrorKind::NotFound {
                format!("object s3://{bucket}/{key} does not exist")
            } else {
                e.to_string()
            },
        })
    }
}

/// Write `body` to `path` atomically, creating parent directories.
pub(crate) async fn write_local(path: &Path, body: &[u8]) -> Result<(), BatchError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = path.with_extension("tmp");
    tokio::fs::write(&tmp_path, body).await?;
    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }
    Ok(())
}
