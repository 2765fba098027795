//! Registry transport over `oci-distribution`.
//!
//! Talks to real registries (Docker Hub, GHCR, private mirrors). Blob reads
//! are streamed through an in-process pipe so large layers never have to be
//! held in memory by the caller.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use imgsync_core::descriptor::{detect_media_type, media_types};
use imgsync_core::digest::Digest;
use imgsync_core::error::{Result, SyncError};
use imgsync_core::request::Repository;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::OciDescriptor;
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference, RegistryOperation};
use tokio::io::{AsyncRead, AsyncReadExt, DuplexStream, ReadBuf};
use tokio::task::JoinHandle;

use super::credentials::CredentialStore;
use super::{BlobPayload, BlobPut, FetchedManifest, ManifestRef, RegistryTransport};
use crate::cas::BlobReader;

/// Pipe buffer between the download task and the reader.
const PIPE_BUFFER: usize = 256 * 1024;

/// Authentication credentials for a container registry.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// No credentials.
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    /// Username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// `REGISTRY_USERNAME` / `REGISTRY_PASSWORD`, or anonymous when either is unset.
    pub fn from_env() -> Self {
        match (
            std::env::var("REGISTRY_USERNAME").ok(),
            std::env::var("REGISTRY_PASSWORD").ok(),
        ) {
            (Some(username), Some(password)) => Self::basic(username, password),
            _ => Self::anonymous(),
        }
    }

    /// Credential store entry for `registry`, then the environment, then anonymous.
    pub fn from_credential_store(registry: &str) -> Self {
        match CredentialStore::default_path().get(registry) {
            Ok(Some((username, password))) => Self::basic(username, password),
            Ok(None) => Self::from_env(),
            Err(e) => {
                tracing::warn!(registry, error = %e, "Ignoring unreadable credential store");
                Self::from_env()
            }
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_none()
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// [`RegistryTransport`] backed by an `oci-distribution` client.
pub struct OciTransport {
    client: Client,
    /// Fixed credentials for every registry; resolved per registry when unset.
    auth: Option<RegistryAuth>,
    resolved: parking_lot::Mutex<HashMap<String, RegistryAuth>>,
}

impl OciTransport {
    /// Create a transport. `insecure_registries` are reached over plain HTTP.
    pub fn new(insecure_registries: &[String]) -> Self {
        let protocol = if insecure_registries.is_empty() {
            ClientProtocol::Https
        } else {
            ClientProtocol::HttpsExcept(insecure_registries.to_vec())
        };
        let config = ClientConfig {
            protocol,
            ..Default::default()
        };

        Self {
            client: Client::new(config),
            auth: None,
            resolved: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Use `auth` for every registry instead of the credential store.
    pub fn with_auth(mut self, auth: RegistryAuth) -> Self {
        self.auth = Some(auth);
        self
    }

    fn auth_for(&self, registry: &str) -> OciRegistryAuth {
        if let Some(auth) = &self.auth {
            return auth.to_oci_auth();
        }
        self.resolved
            .lock()
            .entry(registry.to_string())
            .or_insert_with(|| RegistryAuth::from_credential_store(registry))
            .to_oci_auth()
    }

    async fn authenticate(
        &self,
        repo: &Repository,
        reference: &Reference,
        operation: RegistryOperation,
    ) -> Result<OciRegistryAuth> {
        let auth = self.auth_for(&repo.registry);
        self.client
            .auth(reference, &auth, operation)
            .await
            .map_err(|e| registry_error(repo, "authenticate with", reference, e))?;
        Ok(auth)
    }
}

#[async_trait]
impl RegistryTransport for OciTransport {
    async fn get_manifest(
        &self,
        repo: &Repository,
        reference: &ManifestRef,
    ) -> Result<FetchedManifest> {
        let oci_ref = oci_reference(repo, reference)?;
        let auth = self
            .authenticate(repo, &oci_ref, RegistryOperation::Pull)
            .await?;

        let (body, _) = self
            .client
            .pull_manifest_raw(&oci_ref, &auth, media_types::ACCEPTED_MANIFESTS)
            .await
            .map_err(|e| registry_error(repo, "pull manifest", &oci_ref, e))?;

        let data = Bytes::copy_from_slice(&body);
        let media_type =
            detect_media_type(&data).unwrap_or_else(|| media_types::OCI_MANIFEST.to_string());
        tracing::debug!(reference = %oci_ref, media_type = %media_type, size = data.len(), "Fetched manifest");

        Ok(FetchedManifest { data, media_type })
    }

    async fn get_blob(&self, repo: &Repository, digest: &Digest) -> Result<BlobReader> {
        let oci_ref = oci_reference(repo, &ManifestRef::Digest(digest.to_string()))?;
        self.authenticate(repo, &oci_ref, RegistryOperation::Pull)
            .await?;

        let descriptor = OciDescriptor {
            digest: digest.to_string(),
            size: digest.size(),
            ..Default::default()
        };
        let (reader, mut writer) = tokio::io::duplex(PIPE_BUFFER);
        let client = self.client.clone();
        let task = tokio::spawn(async move {
            client
                .pull_blob(&oci_ref, &descriptor, &mut writer)
                .await
                .map_err(|e| format!("Failed to pull blob from {}: {}", oci_ref, e))
        });

        Ok(Box::new(PulledBlob {
            inner: reader,
            task: Some(task),
        }))
    }

    async fn put_blob(
        &self,
        repo: &Repository,
        digest: &Digest,
        payload: BlobPayload,
    ) -> Result<BlobPut> {
        let oci_ref = oci_reference(repo, &ManifestRef::Digest(digest.to_string()))?;

        // The client uploads monolithically from a buffer.
        let data = match payload {
            BlobPayload::Cached(data) => data,
            BlobPayload::Streamed(mut reader) => {
                let mut buf = Vec::with_capacity(digest.size().max(0) as usize);
                reader.read_to_end(&mut buf).await?;
                Bytes::from(buf)
            }
        };

        self.authenticate(repo, &oci_ref, RegistryOperation::Push)
            .await?;
        self.client
            .push_blob(&oci_ref, &data, &digest.to_string())
            .await
            .map_err(|e| registry_error(repo, "push blob to", &oci_ref, e))?;

        Ok(BlobPut::Uploaded)
    }

    async fn put_manifest(
        &self,
        repo: &Repository,
        reference: &ManifestRef,
        media_type: &str,
        data: Bytes,
    ) -> Result<()> {
        let oci_ref = oci_reference(repo, reference)?;
        self.authenticate(repo, &oci_ref, RegistryOperation::Push)
            .await?;

        self.client
            .push_manifest_raw(&oci_ref, data.to_vec(), header_value(media_type)?)
            .await
            .map_err(|e| registry_error(repo, "push manifest to", &oci_ref, e))?;
        Ok(())
    }
}

/// Build an `oci-distribution` reference such as `ghcr.io/org/app:v1`.
fn oci_reference(repo: &Repository, reference: &ManifestRef) -> Result<Reference> {
    let ref_str = format!("{}/{}{}", repo.registry, repo.repository, reference);
    ref_str.parse::<Reference>().map_err(|e| {
        SyncError::Config(format!("Invalid OCI reference '{}': {}", ref_str, e))
    })
}

/// Parse a header value (e.g. a manifest content type).
fn header_value<H>(value: &str) -> Result<H>
where
    H: FromStr,
    H::Err: Display,
{
    value
        .parse()
        .map_err(|e: H::Err| SyncError::UnsupportedMediaType(format!("{}: {}", value, e)))
}

fn registry_error(
    repo: &Repository,
    action: &str,
    reference: &Reference,
    err: impl Display,
) -> SyncError {
    SyncError::Registry {
        registry: repo.registry.clone(),
        message: format!("Failed to {} {}: {}", action, reference, err),
    }
}

/// Reader side of a blob download running in a background task.
///
/// The download outcome is checked at end of stream, so a transfer that
/// fails midway surfaces as an I/O error rather than a short blob.
struct PulledBlob {
    inner: DuplexStream,
    task: Option<JoinHandle<std::result::Result<(), String>>>,
}

impl AsyncRead for PulledBlob {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        ready!(Pin::new(&mut self.inner).poll_read(cx, buf))?;
        if buf.filled().len() > before || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let Some(task) = self.task.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let outcome = ready!(Pin::new(task).poll(cx));
        self.task = None;
        match outcome {
            Ok(Ok(())) => Poll::Ready(Ok(())),
            Ok(Err(message)) => Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, message))),
            Err(join) => Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, join.to_string()))),
        }
    }
}

impl Drop for PulledBlob {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890";

    #[test]
    fn test_registry_auth_anonymous() {
        let auth = RegistryAuth::anonymous();
        assert!(auth.is_anonymous());
        assert!(matches!(auth.to_oci_auth(), OciRegistryAuth::Anonymous));
    }

    #[test]
    fn test_registry_auth_basic() {
        let auth = RegistryAuth::basic("user", "pass");
        assert!(!auth.is_anonymous());
        assert!(matches!(auth.to_oci_auth(), OciRegistryAuth::Basic(u, p) if u == "user" && p == "pass"));
    }

    #[test]
    fn test_oci_reference_with_tag() {
        let repo = Repository::new("ghcr.io", "org/app");
        let r = oci_reference(&repo, &ManifestRef::Tag("v0.1.0".to_string())).unwrap();
        assert_eq!(r.to_string(), "ghcr.io/org/app:v0.1.0");
    }

    #[test]
    fn test_oci_reference_with_digest() {
        let repo = Repository::new("ghcr.io", "org/app");
        let r = oci_reference(&repo, &ManifestRef::Digest(DIGEST.to_string())).unwrap();
        assert_eq!(r.digest(), Some(DIGEST));
    }

    #[test]
    fn test_header_value_errors_are_media_type_errors() {
        let err = header_value::<u32>("application/json").unwrap_err();
        assert!(matches!(err, SyncError::UnsupportedMediaType(_)));
        assert_eq!(header_value::<u32>("42").unwrap(), 42);
    }

    #[tokio::test]
    async fn test_pulled_blob_reports_task_failure_at_eof() {
        let (reader, mut writer) = tokio::io::duplex(64);
        let task = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            writer.write_all(b"partial").await.map_err(|e| e.to_string())?;
            Err("connection reset".to_string())
        });
        let mut blob = PulledBlob {
            inner: reader,
            task: Some(task),
        };

        let mut out = Vec::new();
        let err = blob.read_to_end(&mut out).await.unwrap_err();
        assert!(err.to_string().contains("connection reset"));
    }

    #[tokio::test]
    async fn test_pulled_blob_clean_eof() {
        let (reader, mut writer) = tokio::io::duplex(64);
        let task = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            writer.write_all(b"whole blob").await.map_err(|e| e.to_string())
        });
        let mut blob = PulledBlob {
            inner: reader,
            task: Some(task),
        };

        let mut out = Vec::new();
        blob.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"whole blob");
    }
}
