//! Large-body offload, keyed by the MD5 hash of the stored bytes.
//!
//! Grounded in `lib/proxies/aws_short.py`, which spills bodies over
//! `MAX_LAMBDA_BODY_SIZE` to S3 under their MD5 hex digest and passes the
//! key through the envelope instead of the bytes. We keep the same
//! content-addressed contract but implement it against the local
//! filesystem rather than baking in an AWS SDK dependency the rest of
//! this crate has no other use for.

use crate::errors::{EnvelopeError, ProxyError, ProxyResult};
use async_trait::async_trait;
use md5::{Digest, Md5};
use std::path::PathBuf;
use tokio::fs;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, bytes: &[u8]) -> ProxyResult<String>;
    async fn get(&self, key: &str) -> ProxyResult<Vec<u8>>;
    /// Best-effort cleanup; failures are logged, never propagated. The
    /// original has no TTL/GC story for spilled bodies either (spec.md
    /// §9 Open Question), so this is cooperative, not relied upon.
    async fn delete(&self, key: &str);
}

pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_for(&self, key: &str) -> ProxyResult<PathBuf> {
        if key.is_empty() || key.contains(std::path::is_separator) || key.contains("..") {
            return Err(ProxyError::Envelope(EnvelopeError::Malformed(format!(
                "invalid object key: {key}"
            ))));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, bytes: &[u8]) -> ProxyResult<String> {
        let mut hasher = Md5::new();
        hasher.update(bytes);
        let key = hex::encode(hasher.finalize());
        fs::create_dir_all(&self.root).await?;
        let path = self.path_for(&key)?;
        fs::write(&path, bytes).await?;
        Ok(key)
    }

    async fn get(&self, key: &str) -> ProxyResult<Vec<u8>> {
        let path = self.path_for(key)?;
        Ok(fs::read(&path).await?)
    }

    async fn delete(&self, key: &str) {
        if let Ok(path) = self.path_for(key) {
            if let Err(err) = fs::remove_file(&path).await {
                tracing::debug!(%key, %err, "object store cleanup failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_through_md5_key() {
        let dir = tempdir();
        let store = FsObjectStore::new(dir.clone());
        let key = store.put(b"a large response body").await.unwrap();
        assert_eq!(key, "c9a0dd6e01a36f43f8e7ed3cbfa9430a"); // md5("a large response body")
        let back = store.get(&key).await.unwrap();
        assert_eq!(back, b"a large response body");
        store.delete(&key).await;
        assert!(store.get(&key).await.is_err());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn rejects_path_traversal_keys() {
        let dir = tempdir();
        let store = FsObjectStore::new(dir.clone());
        assert!(store.get("../../etc/passwd").await.is_err());
        let _ = std::fs::remove_dir_all(dir);
    }

    fn tempdir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("proxy-core-test-{}", uuid::Uuid::new_v4()));
        dir
    }
}
