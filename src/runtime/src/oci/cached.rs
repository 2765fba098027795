//! Transport wrapper that serves content-addressed requests locally first.
//!
//! Lookup order for anything addressed by digest:
//! 1. validated small responses kept in memory
//! 2. the local CAS (content re-verified before use)
//! 3. the wrapped transport, unless airgapped
//!
//! Tag resolution always needs the registry, so it is refused when airgapped.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use imgsync_core::descriptor::{detect_media_type, media_types};
use imgsync_core::digest::{self, Digest};
use imgsync_core::error::{Result, SyncError};
use imgsync_core::request::Repository;

use super::{BlobPayload, BlobPut, FetchedManifest, ManifestRef, RegistryTransport};
use crate::cache::SmallBlobCache;
use crate::cas::{BlobReader, Cas};

/// Local-first wrapper around a [`RegistryTransport`].
pub struct CachedBlobTransport {
    inner: Arc<dyn RegistryTransport>,
    cas: Arc<dyn Cas>,
    cache: Arc<SmallBlobCache>,
    airgapped: bool,
}

impl CachedBlobTransport {
    pub fn new(
        inner: Arc<dyn RegistryTransport>,
        cas: Arc<dyn Cas>,
        cache: Arc<SmallBlobCache>,
    ) -> Self {
        Self {
            inner,
            cas,
            cache,
            airgapped: false,
        }
    }

    /// Refuse every request that would need the network.
    pub fn airgapped(mut self, airgapped: bool) -> Self {
        self.airgapped = airgapped;
        self
    }

    pub fn is_airgapped(&self) -> bool {
        self.airgapped
    }

    /// Verified bytes for `digest` from memory or the CAS.
    async fn local_bytes(&self, digest: &Digest) -> Option<Bytes> {
        if let Some(data) = self.cache.get(digest) {
            return Some(data);
        }
        if !self.cas.contains(digest).await {
            return None;
        }
        match self.cas.read_blob(digest).await {
            Ok(data) if digest::verify(&digest.to_string(), &data).is_ok() => {
                self.cache.insert(digest, data.clone());
                Some(data)
            }
            Ok(_) => {
                tracing::warn!(digest = %digest, "Ignoring corrupt blob in local CAS");
                None
            }
            Err(e) => {
                tracing::debug!(digest = %digest, error = %e, "Local CAS read failed");
                None
            }
        }
    }

    fn refuse(&self, what: String) -> SyncError {
        SyncError::Airgapped(format!("{} is not available locally", what))
    }
}

#[async_trait]
impl RegistryTransport for CachedBlobTransport {
    async fn get_manifest(
        &self,
        repo: &Repository,
        reference: &ManifestRef,
    ) -> Result<FetchedManifest> {
        let ManifestRef::Digest(wanted) = reference else {
            if self.airgapped {
                return Err(SyncError::Airgapped(format!(
                    "cannot resolve tag {}{} without the network",
                    repo, reference
                )));
            }
            return self.inner.get_manifest(repo, reference).await;
        };

        let digest = Digest::parse(wanted, -1)?;
        if let Some(data) = self.local_bytes(&digest).await {
            tracing::debug!(digest = %wanted, "Serving manifest locally");
            let media_type =
                detect_media_type(&data).unwrap_or_else(|| media_types::OCI_MANIFEST.to_string());
            return Ok(FetchedManifest { data, media_type });
        }
        if self.airgapped {
            return Err(self.refuse(format!("manifest {}", wanted)));
        }

        let fetched = self.inner.get_manifest(repo, reference).await?;
        // Only content that matches its digest is remembered.
        if digest::verify(wanted, &fetched.data).is_ok() {
            self.cache.insert(&digest, fetched.data.clone());
        }
        Ok(fetched)
    }

    async fn get_blob(&self, repo: &Repository, digest: &Digest) -> Result<BlobReader> {
        if let Some(data) = self.cache.get(digest) {
            return Ok(Box::new(std::io::Cursor::new(data)));
        }
        if self.cas.contains(digest).await {
            tracing::debug!(digest = %digest, "Serving blob from local CAS");
            return self.cas.reader_for_blob(digest).await;
        }
        if self.airgapped {
            return Err(self.refuse(format!("blob {}", digest)));
        }
        self.inner.get_blob(repo, digest).await
    }

    async fn put_blob(
        &self,
        repo: &Repository,
        digest: &Digest,
        payload: BlobPayload,
    ) -> Result<BlobPut> {
        if self.airgapped {
            return Err(SyncError::Airgapped(format!("upload of {} needs the network", digest)));
        }
        self.inner.put_blob(repo, digest, payload).await
    }

    async fn put_manifest(
        &self,
        repo: &Repository,
        reference: &ManifestRef,
        media_type: &str,
        data: Bytes,
    ) -> Result<()> {
        if self.airgapped {
            return Err(SyncError::Airgapped(format!(
                "writing {}{} needs the network",
                repo, reference
            )));
        }
        self.inner
            .put_manifest(repo, reference, media_type, data)
            .await
    }
}
