//! Content addressed layer cache and the read-through image decorator built on it

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use oci_client::manifest::OciImageManifest;
use oci_client::Reference;
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::digest::{self, Digest, DigestError};
use crate::errors::{Result, TransferError};
use crate::registry::Image;

/// Prefix of temporary cache directories
pub const TEMP_DIR_PREFIX: &str = "oci-transfer";

const BLOBS_DIR: &str = "blobs";

/// Storage for blobs keyed by digest
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Look a blob up. `Ok(None)` is a miss.
    async fn get(&self, digest: &str) -> Result<Option<Bytes>>;

    /// Store a blob under its digest
    async fn put(&self, digest: &str, data: &Bytes) -> Result<()>;

    /// Forget a blob; deleting a missing blob is not an error
    async fn delete(&self, digest: &str) -> Result<()>;
}

/// [`CacheStore`] keeping blobs as files under `<root>/blobs/<algorithm>/<hex>`
///
/// Entries are written to a temporary file first and renamed into place, so readers never see
/// partial content and concurrent writers of the same digest are harmless. Reads verify content
/// against the digest; corrupt entries are dropped and reported as misses.
#[derive(Debug)]
pub struct FilesystemCache {
    root: PathBuf,
    // keeps a temporary root alive, and removes it on drop
    temp_dir: Option<TempDir>,
    next_temp_id: AtomicU64,
}

impl FilesystemCache {
    /// Use (and create if needed) a persistent cache directory
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join(BLOBS_DIR)).map_err(TransferError::CacheInit)?;
        debug!(root = %root.display(), "Opened layer cache");
        Ok(Self {
            root,
            temp_dir: None,
            next_temp_id: AtomicU64::new(0),
        })
    }

    /// Create a cache in a fresh temporary directory, removed when the cache is closed or dropped
    pub fn temporary() -> Result<Self> {
        let temp_dir = tempfile::Builder::new()
            .prefix(TEMP_DIR_PREFIX)
            .tempdir()
            .map_err(TransferError::CacheInit)?;
        let mut cache = Self::open(temp_dir.path())?;
        cache.temp_dir = Some(temp_dir);
        Ok(cache)
    }

    /// Root directory of the cache
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Remove a temporary cache directory now, reporting failures. Persistent caches are left
    /// untouched.
    pub fn close(self) -> Result<()> {
        if let Some(temp_dir) = self.temp_dir {
            let path = temp_dir.path().to_path_buf();
            temp_dir
                .close()
                .map_err(|source| TransferError::Cache { path, source })?;
        }
        Ok(())
    }

    /// Location of the blob with the given digest
    pub fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        let parsed = Digest::new(digest)?;
        Ok(self
            .root
            .join(BLOBS_DIR)
            .join(parsed.algorithm)
            .join(parsed.encoded))
    }

    fn temp_path(&self, path: &Path) -> PathBuf {
        let id = self.next_temp_id.fetch_add(1, Ordering::Relaxed);
        path.with_extension(format!("tmp-{}-{}", std::process::id(), id))
    }
}

fn cache_error(path: &Path) -> impl FnOnce(std::io::Error) -> TransferError {
    let path = path.to_path_buf();
    move |source| TransferError::Cache { path, source }
}

#[async_trait]
impl CacheStore for FilesystemCache {
    async fn get(&self, digest: &str) -> Result<Option<Bytes>> {
        let path = self.blob_path(digest)?;
        let data = match tokio::fs::read(&path).await {
            Ok(data) => Bytes::from(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(cache_error(&path)(e)),
        };
        match digest::verify(&data, digest) {
            Ok(()) => Ok(Some(data)),
            Err(DigestError::VerificationError { actual, .. }) => {
                warn!(%digest, %actual, path = %path.display(), "Dropping corrupt cache entry");
                self.delete(digest).await?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, digest: &str, data: &Bytes) -> Result<()> {
        let path = self.blob_path(digest)?;
        digest::verify(data, digest)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(cache_error(parent))?;
        }
        let temp = self.temp_path(&path);
        tokio::fs::write(&temp, data)
            .await
            .map_err(cache_error(&temp))?;
        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            // best effort, the rename error is what matters
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(cache_error(&path)(e));
        }
        debug!(%digest, size = data.len(), "Stored blob in cache");
        Ok(())
    }

    async fn delete(&self, digest: &str) -> Result<()> {
        let path = self.blob_path(digest)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(cache_error(&path)(e)),
        }
    }
}

/// Image decorator serving layers from a [`CacheStore`], falling back to the wrapped image on a
/// miss and storing what it fetched
#[derive(Clone)]
pub struct CachedImage {
    inner: Arc<dyn Image>,
    cache: Arc<dyn CacheStore>,
}

impl CachedImage {
    /// Wrap `inner` so its layers are read through `cache`
    pub fn new(inner: Arc<dyn Image>, cache: Arc<dyn CacheStore>) -> Self {
        Self { inner, cache }
    }

    /// The wrapped image
    pub fn inner(&self) -> &Arc<dyn Image> {
        &self.inner
    }
}

#[async_trait]
impl Image for CachedImage {
    fn reference(&self) -> &Reference {
        self.inner.reference()
    }

    fn digest(&self) -> &str {
        self.inner.digest()
    }

    fn manifest(&self) -> &OciImageManifest {
        self.inner.manifest()
    }

    async fn config_blob(&self) -> Result<Bytes> {
        self.inner.config_blob().await
    }

    async fn layer(&self, digest: &str) -> Result<Bytes> {
        if let Some(data) = self.cache.get(digest).await? {
            debug!(%digest, "Layer cache hit");
            return Ok(data);
        }
        debug!(%digest, "Layer cache miss");
        let data = self.inner.layer(digest).await?;
        self.cache.put(digest, &data).await?;
        Ok(data)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sha256_digest;

    #[tokio::test]
    async fn put_then_get() -> anyhow::Result<()> {
        let cache = FilesystemCache::temporary()?;
        let data = Bytes::from_static(b"layer content");
        let digest = sha256_digest(&data);

        assert!(cache.get(&digest).await?.is_none());
        cache.put(&digest, &data).await?;
        assert_eq!(cache.get(&digest).await?, Some(data));

        let expected = cache
            .root()
            .join("blobs")
            .join("sha256")
            .join(digest.trim_start_matches("sha256:"));
        assert!(expected.is_file());
        Ok(())
    }

    #[tokio::test]
    async fn put_rejects_mismatched_content() -> anyhow::Result<()> {
        let cache = FilesystemCache::temporary()?;
        let digest = sha256_digest(b"expected");
        let err = cache
            .put(&digest, &Bytes::from_static(b"something else"))
            .await
            .expect_err("content does not match digest");
        assert!(matches!(
            err,
            TransferError::Digest(DigestError::VerificationError { .. })
        ));
        assert!(cache.get(&digest).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_entry_is_a_miss() -> anyhow::Result<()> {
        let cache = FilesystemCache::temporary()?;
        let data = Bytes::from_static(b"layer content");
        let digest = sha256_digest(&data);
        cache.put(&digest, &data).await?;

        let path = cache.blob_path(&digest)?;
        std::fs::write(&path, b"bit rot")?;

        assert!(cache.get(&digest).await?.is_none());
        assert!(!path.exists());
        Ok(())
    }

    #[tokio::test]
    async fn rejects_unsafe_digests() -> anyhow::Result<()> {
        let cache = FilesystemCache::temporary()?;
        for digest in ["sha256:../../../etc/passwd", "nope", "md5:abcd"] {
            let err = cache
                .get(digest)
                .await
                .expect_err("digest must be rejected");
            assert!(matches!(err, TransferError::Digest(_)));
        }
        Ok(())
    }

    #[tokio::test]
    async fn delete_is_idempotent() -> anyhow::Result<()> {
        let cache = FilesystemCache::temporary()?;
        let data = Bytes::from_static(b"layer content");
        let digest = sha256_digest(&data);
        cache.put(&digest, &data).await?;
        cache.delete(&digest).await?;
        cache.delete(&digest).await?;
        assert!(cache.get(&digest).await?.is_none());
        Ok(())
    }

    #[test]
    fn close_removes_temporary_root() -> anyhow::Result<()> {
        let cache = FilesystemCache::temporary()?;
        let root = cache.root().to_path_buf();
        assert!(root.is_dir());
        assert!(root
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(TEMP_DIR_PREFIX)));
        cache.close()?;
        assert!(!root.exists());
        Ok(())
    }

    #[test]
    fn close_keeps_persistent_root() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let root = dir.path().join("layers");
        let cache = FilesystemCache::open(&root)?;
        cache.close()?;
        assert!(root.join("blobs").is_dir());
        Ok(())
    }
}
