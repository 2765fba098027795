//! Local content-addressable store.
//!
//! Blobs live under `<root>/blobs/sha256/<hex>`, so a blob shared by many
//! images is stored once. Every write is verified against its digest and
//! published with an atomic rename; a half-written blob is never visible.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use imgsync_core::digest::{Digest, DigestHasher};
use imgsync_core::error::{Result, SyncError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

/// A stream of blob bytes.
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

const COPY_BUF_SIZE: usize = 64 * 1024;

/// Content-addressed read/write of blobs by digest.
#[async_trait]
pub trait Cas: Send + Sync {
    /// Read a whole blob into memory.
    async fn read_blob(&self, digest: &Digest) -> Result<Bytes>;

    /// Open a blob for streaming.
    async fn reader_for_blob(&self, digest: &Digest) -> Result<BlobReader>;

    /// Store an in-memory blob whose digest is already known.
    async fn write_small_with_digest(&self, digest: &Digest, data: &[u8]) -> Result<()>;

    /// Stream a blob into the store, verifying it on the way.
    async fn write_large(&self, digest: &Digest, reader: BlobReader) -> Result<()>;

    /// Whether the blob is present.
    async fn contains(&self, digest: &Digest) -> bool;
}

/// Filesystem-backed CAS.
pub struct DiskCas {
    root: PathBuf,
}

impl DiskCas {
    /// Open (and create if needed) a CAS rooted at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        for dir in [root.join("blobs").join("sha256"), root.join("tmp")] {
            std::fs::create_dir_all(&dir).map_err(|e| SyncError::Cas {
                digest: String::new(),
                message: format!("Failed to create CAS directory {}: {}", dir.display(), e),
            })?;
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a blob, whether or not it exists.
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root.join("blobs").join("sha256").join(digest.hex())
    }

    fn tmp_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join("tmp")
            .join(format!("{}.{:016x}", digest.hex(), rand::random::<u64>()))
    }

    async fn publish(&self, digest: &Digest, tmp: &Path) -> Result<()> {
        let target = self.blob_path(digest);
        tokio::fs::rename(tmp, &target).await.map_err(|e| SyncError::Cas {
            digest: digest.to_string(),
            message: format!("Failed to publish blob {}: {}", target.display(), e),
        })
    }
}

#[async_trait]
impl Cas for DiskCas {
    async fn read_blob(&self, digest: &Digest) -> Result<Bytes> {
        match tokio::fs::read(self.blob_path(digest)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(SyncError::Cas {
                digest: digest.to_string(),
                message: "blob not found".to_string(),
            }),
            Err(e) => Err(SyncError::Cas {
                digest: digest.to_string(),
                message: e.to_string(),
            }),
        }
    }

    async fn reader_for_blob(&self, digest: &Digest) -> Result<BlobReader> {
        let file = tokio::fs::File::open(self.blob_path(digest))
            .await
            .map_err(|e| SyncError::Cas {
                digest: digest.to_string(),
                message: format!("Failed to open blob: {}", e),
            })?;
        Ok(Box::new(file))
    }

    async fn write_small_with_digest(&self, digest: &Digest, data: &[u8]) -> Result<()> {
        imgsync_core::digest::verify(&digest.to_string(), data)?;
        if self.contains(digest).await {
            return Ok(());
        }

        let tmp = self.tmp_path(digest);
        tokio::fs::write(&tmp, data).await.map_err(|e| SyncError::Cas {
            digest: digest.to_string(),
            message: format!("Failed to write blob: {}", e),
        })?;
        if let Err(e) = self.publish(digest, &tmp).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }

        tracing::debug!(digest = %digest, size = data.len(), "Stored blob");
        Ok(())
    }

    async fn write_large(&self, digest: &Digest, mut reader: BlobReader) -> Result<()> {
        let tmp = self.tmp_path(digest);
        let result = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            let mut hasher = DigestHasher::new();
            let mut buf = vec![0u8; COPY_BUF_SIZE];
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                file.write_all(&buf[..n]).await?;
            }
            file.flush().await?;
            file.sync_all().await?;
            Ok::<_, SyncError>(hasher.finalize())
        }
        .await;

        let actual = match result {
            Ok(actual) => actual,
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(e);
            }
        };

        if actual.hash() != digest.hash() || (digest.size() >= 0 && actual.size() != digest.size())
        {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(SyncError::Integrity {
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }

        if let Err(e) = self.publish(digest, &tmp).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }

        tracing::debug!(digest = %digest, size = actual.size(), "Stored streamed blob");
        Ok(())
    }

    async fn contains(&self, digest: &Digest) -> bool {
        tokio::fs::metadata(self.blob_path(digest)).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_small_then_read() {
        let dir = TempDir::new().unwrap();
        let cas = DiskCas::open(dir.path()).unwrap();
        let digest = Digest::of(b"config");

        cas.write_small_with_digest(&digest, b"config").await.unwrap();
        assert!(cas.contains(&digest).await);
        assert_eq!(cas.read_blob(&digest).await.unwrap(), Bytes::from_static(b"config"));
        assert!(cas
            .blob_path(&digest)
            .ends_with(format!("blobs/sha256/{}", digest.hex())));
    }

    #[tokio::test]
    async fn test_write_small_rejects_wrong_digest() {
        let dir = TempDir::new().unwrap();
        let cas = DiskCas::open(dir.path()).unwrap();
        let digest = Digest::of(b"expected");

        let err = cas
            .write_small_with_digest(&digest, b"something else")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Integrity { .. }));
        assert!(!cas.contains(&digest).await);
    }

    #[tokio::test]
    async fn test_write_large_streams_and_verifies() {
        let dir = TempDir::new().unwrap();
        let cas = DiskCas::open(dir.path()).unwrap();
        let data = vec![7u8; 3 * COPY_BUF_SIZE + 11];
        let digest = Digest::of(&data);

        cas.write_large(&digest, Box::new(std::io::Cursor::new(data.clone())))
            .await
            .unwrap();

        let mut reader = cas.reader_for_blob(&digest).await.unwrap();
        let mut back = Vec::new();
        reader.read_to_end(&mut back).await.unwrap();
        assert_eq!(back, data);
    }

    #[tokio::test]
    async fn test_write_large_mismatch_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let cas = DiskCas::open(dir.path()).unwrap();
        let digest = Digest::of(b"layer");

        let err = cas
            .write_large(&digest, Box::new(std::io::Cursor::new(b"tampered".to_vec())))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Integrity { .. }));
        assert!(!cas.contains(&digest).await);
        assert_eq!(std::fs::read_dir(dir.path().join("tmp")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_read_missing_blob() {
        let dir = TempDir::new().unwrap();
        let cas = DiskCas::open(dir.path()).unwrap();
        let err = cas.read_blob(&Digest::of(b"nope")).await.unwrap_err();
        assert!(matches!(err, SyncError::Cas { .. }));
    }
}
