//! Object storage for generated hand receipts and uploaded scans
//!
//! The core only needs "key in, bytes or URL out". `FileStore` keeps objects
//! under a local directory and signs time-limited `file://` URLs with a
//! per-process secret.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info};

use crate::error::{HandReceiptError, Result};

/// File-key storage contract
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn upload_file(&self, key: &str, data: Bytes, content_type: &str) -> Result<()>;

    async fn download_file(&self, key: &str) -> Result<Bytes>;

    async fn delete_file(&self, key: &str) -> Result<()>;

    /// URL that grants read access to `key` until `ttl` elapses
    async fn get_presigned_url(&self, key: &str, ttl: Duration) -> Result<String>;
}

/// Local-directory object store
pub struct FileStore {
    root_dir: PathBuf,
    signing_secret: String,
}

impl FileStore {
    /// Create a store rooted at `root_dir`, creating the directory if needed
    pub async fn new<P: AsRef<Path>>(root_dir: P) -> Result<Self> {
        let root_dir = root_dir.as_ref().to_path_buf();
        fs::create_dir_all(&root_dir).await?;

        info!(path = %root_dir.display(), "Initialized file store");

        Ok(Self {
            root_dir,
            signing_secret: uuid::Uuid::new_v4().to_string(),
        })
    }

    /// Resolve a key to a path, refusing anything that escapes the root
    fn object_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));

        if !safe {
            return Err(HandReceiptError::InvalidInput(format!("Invalid storage key: {}", key)));
        }

        Ok(self.root_dir.join(relative))
    }

    fn signature(&self, key: &str, expires: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.signing_secret.as_bytes());
        hasher.update(b"|");
        hasher.update(key.as_bytes());
        hasher.update(b"|");
        hasher.update(expires.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Check a URL signature produced by `get_presigned_url`
    pub fn verify_signature(&self, key: &str, expires: i64, signature: &str) -> bool {
        expires > Utc::now().timestamp() && self.signature(key, expires) == signature
    }
}

#[async_trait]
impl ObjectStorage for FileStore {
    async fn upload_file(&self, key: &str, data: Bytes, content_type: &str) -> Result<()> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::write(&path, &data).await?;
        debug!(key, content_type, size = data.len(), "Stored object");
        Ok(())
    }

    async fn download_file(&self, key: &str) -> Result<Bytes> {
        let path = self.object_path(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(HandReceiptError::NotFound(format!("Object {} not found", key)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_file(&self, key: &str) -> Result<()> {
        let path = self.object_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(key, "Deleted object");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(HandReceiptError::NotFound(format!("Object {} not found", key)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_presigned_url(&self, key: &str, ttl: Duration) -> Result<String> {
        let path = self.object_path(key)?;
        if fs::metadata(&path).await.is_err() {
            return Err(HandReceiptError::NotFound(format!("Object {} not found", key)));
        }

        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        Ok(format!(
            "file://{}?expires={}&signature={}",
            path.display(),
            expires,
            self.signature(key, expires)
        ))
    }
}
