//! Pull engine: registries to CAS.
//!
//! ```text
//! RESOLVE_MANIFEST ──► IMAGE ─────────────┐
//!                 └──► INDEX ─► children ─┴─► ENUMERATE_BLOBS ─► [EAGER_DOWNLOAD] ─► DONE
//! ```
//!
//! A digest reference is authoritative: the fetched bytes must hash to it or
//! the pull fails before anything is stored. A tag reference is resolved to
//! whatever digest the registry served, and the outcome is marked not
//! reproducible.

pub mod failover;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt, TryStreamExt};
use imgsync_core::descriptor::{
    detect_media_type, media_types, Descriptor, DocumentKind, ImageIndex, ImageManifest,
};
use imgsync_core::digest::{self, Digest};
use imgsync_core::error::{Result, SyncError};
use imgsync_core::refgraph::RefGraphEntry;
use imgsync_core::request::{LayerHandling, PullReference, PullRequest, Repository};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use crate::cache::SmallBlobCache;
use crate::cas::Cas;
use crate::oci::{CachedBlobTransport, ManifestRef, RegistryTransport};
use crate::pool::WorkerPool;

pub use failover::{first_blob_success, first_success, shuffled};

/// Result of a successful pull.
#[derive(Debug, Clone)]
pub struct PullOutcome {
    /// Authoritative digest of the root document.
    pub digest: String,
    pub kind: DocumentKind,
    /// Source the root document came from.
    pub source: Repository,
    /// False when the pull started from a tag.
    pub reproducible: bool,
    /// Blobs newly written to the CAS by this call.
    pub stored: Vec<Descriptor>,
    /// Ref-graph entries of every manifest and index resolved.
    pub graph: BTreeMap<String, RefGraphEntry>,
}

/// What resolving one document produced.
#[derive(Default)]
struct Resolved {
    stored: Vec<Descriptor>,
    graph: BTreeMap<String, RefGraphEntry>,
    layers: Vec<Descriptor>,
}

impl Resolved {
    fn merge(&mut self, other: Resolved) {
        self.stored.extend(other.stored);
        self.graph.extend(other.graph);
        self.layers.extend(other.layers);
    }
}

/// Per-call state shared by the resolution steps.
struct PullContext<'a> {
    transport: &'a Arc<CachedBlobTransport>,
    sources: &'a [Repository],
    concurrency: usize,
    cancel: &'a CancellationToken,
}

/// Materializes images from registries into the local CAS.
pub struct PullEngine {
    cas: Arc<dyn Cas>,
    online: Arc<CachedBlobTransport>,
    offline: Arc<CachedBlobTransport>,
}

impl PullEngine {
    pub fn new(
        cas: Arc<dyn Cas>,
        registry: Arc<dyn RegistryTransport>,
        cache: Arc<SmallBlobCache>,
    ) -> Self {
        let online = CachedBlobTransport::new(Arc::clone(&registry), Arc::clone(&cas), Arc::clone(&cache));
        let offline = CachedBlobTransport::new(registry, Arc::clone(&cas), cache).airgapped(true);
        Self {
            cas,
            online: Arc::new(online),
            offline: Arc::new(offline),
        }
    }

    fn transport(&self, airgapped: bool) -> &Arc<CachedBlobTransport> {
        if airgapped {
            &self.offline
        } else {
            &self.online
        }
    }

    /// Resolve `request.reference` against `request.sources` and store what it
    /// references.
    pub async fn pull(&self, request: &PullRequest, cancel: &CancellationToken) -> Result<PullOutcome> {
        if request.sources.is_empty() {
            return Err(SyncError::Config("pull request has no sources".to_string()));
        }
        let reference = request.parsed_reference()?;
        let ctx = PullContext {
            transport: self.transport(request.airgapped),
            sources: &request.sources,
            concurrency: request.concurrency(),
            cancel,
        };

        tracing::info!(
            reference = %reference,
            sources = request.sources.len(),
            layer_handling = %request.layer_handling,
            airgapped = request.airgapped,
            "Pulling"
        );

        let manifest_ref = ManifestRef::from(&reference);
        let what = format!("manifest {}", manifest_ref);
        let (source, (fetched, digest)) =
            first_success(&what, ctx.sources, cancel, |src| {
                let transport = ctx.transport;
                let reference = &reference;
                let manifest_ref = &manifest_ref;
                async move {
                    let fetched = transport.get_manifest(&src, manifest_ref).await?;
                    let digest = match reference {
                        PullReference::Digest(expected) => digest::verify(expected, &fetched.data)?,
                        PullReference::Tag(_) => Digest::of(&fetched.data),
                    };
                    Ok((fetched, digest))
                }
            })
            .await?;

        let reproducible = matches!(reference, PullReference::Digest(_));
        if !reproducible {
            tracing::warn!(
                tag = %reference.as_str(),
                digest = %digest,
                source = %source,
                "Pulled by tag; result is not reproducible, pin the digest instead"
            );
        }

        let media_type = document_media_type(&fetched.media_type, &fetched.data);
        let kind = document_kind(&media_type)?;
        let root = Descriptor::new(media_type, digest.to_string(), digest.size());

        let mut resolved = self.expand(&ctx, root, fetched.data).await?;
        if request.layer_handling == LayerHandling::Eager {
            let layers = std::mem::take(&mut resolved.layers);
            let downloaded = self.download_layers(&ctx, layers).await?;
            resolved.stored.extend(downloaded);
        }

        // Siblings may share a config; report each blob once.
        let mut seen = HashSet::new();
        resolved.stored.retain(|d| seen.insert(d.digest.clone()));

        tracing::info!(
            digest = %digest,
            kind = %kind,
            source = %source,
            stored = resolved.stored.len(),
            "Pull complete"
        );

        Ok(PullOutcome {
            digest: digest.to_string(),
            kind,
            source,
            reproducible,
            stored: resolved.stored,
            graph: resolved.graph,
        })
    }

    /// Fetch one blob by digest from `sources` (tried in random order) into the CAS.
    pub async fn download_blob(
        &self,
        sources: &[Repository],
        digest: &Digest,
        airgapped: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.cas.contains(digest).await {
            tracing::debug!(digest = %digest, "Blob already in CAS");
            return Ok(());
        }
        fetch_blob_into_cas(
            Arc::clone(&self.cas),
            Arc::clone(self.transport(airgapped)),
            shuffled(sources),
            digest.clone(),
            cancel.clone(),
        )
        .await?;
        tracing::info!(digest = %digest, "Downloaded blob");
        Ok(())
    }

    /// Store a verified document and everything it references (except layer
    /// bodies, which are only collected).
    fn expand<'a>(
        &'a self,
        ctx: &'a PullContext<'a>,
        desc: Descriptor,
        data: Bytes,
    ) -> BoxFuture<'a, Result<Resolved>> {
        async move {
            let digest = desc.parsed_digest()?;
            let mut resolved = Resolved::default();
            if self.store_small(&digest, &data).await? {
                resolved.stored.push(desc.clone());
            }
            resolved
                .graph
                .insert(desc.digest.clone(), RefGraphEntry::from_manifest_bytes(&data)?);

            match document_kind(&desc.media_type)? {
                DocumentKind::Manifest => {
                    let manifest = ImageManifest::from_slice(&data)?;
                    let config = &manifest.config;
                    let config_digest = config.parsed_digest()?;
                    let config_data = self.fetch_small_blob(ctx, &config_digest).await?;
                    if self.store_small(&config_digest, &config_data).await? {
                        resolved.stored.push(config.clone());
                    }
                    resolved.layers = manifest.layers;
                }
                DocumentKind::Index => {
                    let index = ImageIndex::from_slice(&data)?;
                    let workers = ctx.concurrency.min(index.manifests.len()).max(1);
                    tracing::debug!(
                        index = %desc.digest,
                        children = index.manifests.len(),
                        workers,
                        "Resolving index children"
                    );
                    let children: Vec<Resolved> = stream::iter(index.manifests)
                        .map(|child| self.resolve_child(ctx, child))
                        .buffer_unordered(workers)
                        .try_collect()
                        .await?;
                    for child in children {
                        resolved.merge(child);
                    }
                }
            }
            Ok(resolved)
        }
        .boxed()
    }

    async fn resolve_child(&self, ctx: &PullContext<'_>, child: Descriptor) -> Result<Resolved> {
        let expected = child.parsed_digest()?;
        let manifest_ref = ManifestRef::Digest(child.digest.clone());
        let what = format!("manifest {}", child.digest);
        let (_, fetched) = first_success(&what, ctx.sources, ctx.cancel, |src| {
            let manifest_ref = &manifest_ref;
            let expected = &child.digest;
            async move {
                let fetched = ctx.transport.get_manifest(&src, manifest_ref).await?;
                digest::verify(expected, &fetched.data)?;
                Ok(fetched)
            }
        })
        .await?;

        // Keep the media type the parent declared; fall back to the body.
        let mut desc = child.clone();
        if document_kind(&desc.media_type).is_err() {
            desc.media_type = document_media_type(&fetched.media_type, &fetched.data);
        }
        tracing::debug!(digest = %expected, media_type = %desc.media_type, "Resolved child manifest");
        self.expand(ctx, desc, fetched.data).await
    }

    async fn fetch_small_blob(&self, ctx: &PullContext<'_>, digest: &Digest) -> Result<Bytes> {
        let what = format!("blob {}", digest);
        let expected = digest.to_string();
        let (_, data) = first_blob_success(&what, &shuffled(ctx.sources), ctx.cancel, |src| {
            let expected = &expected;
            async move {
                let mut reader = ctx.transport.get_blob(&src, digest).await?;
                let mut buf = Vec::with_capacity(digest.size().max(0) as usize);
                reader.read_to_end(&mut buf).await?;
                digest::verify(expected, &buf)?;
                Ok(Bytes::from(buf))
            }
        })
        .await?;
        Ok(data)
    }

    /// Write a verified small document; false if the CAS already had it.
    async fn store_small(&self, digest: &Digest, data: &[u8]) -> Result<bool> {
        if self.cas.contains(digest).await {
            return Ok(false);
        }
        self.cas.write_small_with_digest(digest, data).await?;
        Ok(true)
    }

    /// Download layer bodies on a pool of `ctx.concurrency` workers.
    async fn download_layers(
        &self,
        ctx: &PullContext<'_>,
        layers: Vec<Descriptor>,
    ) -> Result<Vec<Descriptor>> {
        let mut seen = HashSet::new();
        let mut pending = Vec::new();
        for layer in layers {
            if !seen.insert(layer.digest.clone()) {
                continue;
            }
            let digest = layer.parsed_digest()?;
            if self.cas.contains(&digest).await {
                tracing::debug!(digest = %digest, "Layer already in CAS");
                continue;
            }
            pending.push((layer, digest));
        }
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        tracing::info!(layers = pending.len(), concurrency = ctx.concurrency, "Downloading layers");
        let pool = WorkerPool::new(ctx.concurrency);
        // First failure stops the remaining downloads.
        let group = ctx.cancel.child_token();

        let mut handles = Vec::with_capacity(pending.len());
        let mut submit_error = None;
        for (layer, digest) in pending {
            let job = {
                let group = group.clone();
                let download = fetch_blob_into_cas(
                    Arc::clone(&self.cas),
                    Arc::clone(ctx.transport),
                    shuffled(ctx.sources),
                    digest,
                    group.clone(),
                );
                async move {
                    let result = download.await;
                    if result.is_err() {
                        group.cancel();
                    }
                    result
                }
            };
            match pool.submit(&group, job).await {
                Ok(handle) => handles.push((layer, handle)),
                Err(e) => {
                    submit_error = Some(e);
                    break;
                }
            }
        }

        let mut downloaded = Vec::with_capacity(handles.len());
        let mut first_error: Option<SyncError> = None;
        for (layer, handle) in handles {
            match handle.join().await {
                Ok(()) => downloaded.push(layer),
                Err(e) => keep_first_failure(&mut first_error, e),
            }
        }
        if let Some(e) = submit_error {
            keep_first_failure(&mut first_error, e);
        }
        pool.shutdown().await;

        match first_error {
            Some(e) => Err(e),
            None => Ok(downloaded),
        }
    }
}

/// Prefer a real failure over the cancellations it caused.
fn keep_first_failure(slot: &mut Option<SyncError>, err: SyncError) {
    match slot {
        None => *slot = Some(err),
        Some(existing) if existing.is_cancellation() && !err.is_cancellation() => *slot = Some(err),
        Some(_) => {}
    }
}

/// Stream one blob from the first source that has it into the CAS.
async fn fetch_blob_into_cas(
    cas: Arc<dyn Cas>,
    transport: Arc<CachedBlobTransport>,
    sources: Vec<Repository>,
    digest: Digest,
    cancel: CancellationToken,
) -> Result<()> {
    let what = format!("blob {}", digest);
    first_blob_success(&what, &sources, &cancel, |src| {
        let cas = &cas;
        let transport = &transport;
        let digest = &digest;
        async move {
            let reader = transport.get_blob(&src, digest).await?;
            cas.write_large(digest, reader).await
        }
    })
    .await?;
    Ok(())
}

/// Media type reported by the registry, or detected from the body.
fn document_media_type(reported: &str, data: &[u8]) -> String {
    if DocumentKind::from_media_type(reported).is_some() {
        return reported.to_string();
    }
    detect_media_type(data)
        .filter(|mt| !mt.is_empty())
        .unwrap_or_else(|| media_types::OCI_MANIFEST.to_string())
}

fn document_kind(media_type: &str) -> Result<DocumentKind> {
    DocumentKind::from_media_type(media_type)
        .or_else(|| DocumentKind::from_media_type_loose(media_type))
        .ok_or_else(|| SyncError::UnsupportedMediaType(media_type.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_media_type_prefers_reported() {
        let body = br#"{"manifests":[]}"#;
        assert_eq!(
            document_media_type(media_types::DOCKER_MANIFEST_LIST, body),
            media_types::DOCKER_MANIFEST_LIST
        );
        assert_eq!(
            document_media_type("application/octet-stream", body),
            media_types::OCI_INDEX
        );
    }

    #[test]
    fn test_document_kind_rejects_config() {
        assert!(matches!(
            document_kind(media_types::OCI_CONFIG),
            Err(SyncError::UnsupportedMediaType(_))
        ));
        assert_eq!(document_kind(media_types::OCI_INDEX).unwrap(), DocumentKind::Index);
    }

    #[test]
    fn test_keep_first_failure_prefers_real_error() {
        let mut slot = None;
        keep_first_failure(&mut slot, SyncError::Cancelled("stop".to_string()));
        keep_first_failure(&mut slot, SyncError::Other("403".to_string()));
        keep_first_failure(&mut slot, SyncError::Other("later".to_string()));
        assert!(matches!(slot, Some(SyncError::Other(ref m)) if m == "403"));
    }
}
