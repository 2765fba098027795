//! Registry access for the engines.
//!
//! The engines talk to registries only through [`RegistryTransport`], the
//! four distribution-API operations they need:
//!
//! ```text
//!   GET  /v2/<repo>/manifests/<tag|digest>   get_manifest
//!   GET  /v2/<repo>/blobs/<digest>           get_blob
//!   PUT  /v2/<repo>/blobs/uploads/...        put_blob
//!   PUT  /v2/<repo>/manifests/<tag|digest>   put_manifest
//! ```
//!
//! [`OciTransport`] implements it over `oci-distribution`;
//! [`CachedBlobTransport`] wraps any transport with local-CAS and in-memory
//! caching plus the airgapped mode.

pub mod cached;
pub mod credentials;
pub mod reference;
pub mod registry;

use async_trait::async_trait;
use bytes::Bytes;
use imgsync_core::digest::Digest;
use imgsync_core::error::Result;
use imgsync_core::request::{PullReference, Repository};

use crate::cas::BlobReader;

pub use cached::CachedBlobTransport;
pub use credentials::CredentialStore;
pub use reference::ImageName;
pub use registry::{OciTransport, RegistryAuth};

/// Tag or digest addressing a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ManifestRef {
    Tag(String),
    Digest(String),
}

impl ManifestRef {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Tag(s) | Self::Digest(s) => s,
        }
    }

    pub fn is_digest(&self) -> bool {
        matches!(self, Self::Digest(_))
    }
}

impl From<&PullReference> for ManifestRef {
    fn from(reference: &PullReference) -> Self {
        match reference {
            PullReference::Digest(d) => Self::Digest(d.clone()),
            PullReference::Tag(t) => Self::Tag(t.clone()),
        }
    }
}

impl std::fmt::Display for ManifestRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tag(t) => write!(f, ":{}", t),
            Self::Digest(d) => write!(f, "@{}", d),
        }
    }
}

/// Raw manifest bytes as served by a registry.
#[derive(Debug, Clone)]
pub struct FetchedManifest {
    pub data: Bytes,
    /// Media type reported by the registry (or detected from the body).
    pub media_type: String,
}

/// Blob content handed to `put_blob`.
pub enum BlobPayload {
    /// Read from the CAS while uploading.
    Streamed(BlobReader),
    /// Already in memory.
    Cached(Bytes),
}

impl std::fmt::Debug for BlobPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Streamed(_) => write!(f, "Streamed"),
            Self::Cached(b) => write!(f, "Cached({} bytes)", b.len()),
        }
    }
}

/// Outcome of a blob upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobPut {
    Uploaded,
    /// The registry already had the blob.
    AlreadyPresent,
}

/// Distribution-API client used by the engines.
#[async_trait]
pub trait RegistryTransport: Send + Sync {
    /// Fetch a manifest or index by tag or digest.
    async fn get_manifest(&self, repo: &Repository, reference: &ManifestRef)
        -> Result<FetchedManifest>;

    /// Open a blob for streaming.
    async fn get_blob(&self, repo: &Repository, digest: &Digest) -> Result<BlobReader>;

    /// Upload a blob.
    async fn put_blob(
        &self,
        repo: &Repository,
        digest: &Digest,
        payload: BlobPayload,
    ) -> Result<BlobPut>;

    /// Write a manifest or index. Callers issue this only once every
    /// descriptor it references is present at `repo`.
    async fn put_manifest(
        &self,
        repo: &Repository,
        reference: &ManifestRef,
        media_type: &str,
        data: Bytes,
    ) -> Result<()>;
}
