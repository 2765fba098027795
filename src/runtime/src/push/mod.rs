//! Push engine: CAS to registry.
//!
//! Uploads every blob a manifest or index references before the document
//! itself is written, so no registry observer can ever see a document that
//! points at a missing blob.
//!
//! ```text
//! commit(request)
//!   ├── image:  layers (concurrent) → config → manifest
//!   └── index:  per child manifest, the image path (concurrent) → index
//! ```
//!
//! Blob uploads are deduplicated per `(registry, repository, digest)` for the
//! lifetime of the engine and run on a bounded [`WorkerPool`].

pub mod image;
pub mod policy;
pub mod tracker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, TryStreamExt};
use imgsync_core::config::PushConfig;
use imgsync_core::descriptor::{Descriptor, DocumentKind};
use imgsync_core::digest::Digest;
use imgsync_core::error::{Result, SyncError};
use imgsync_core::request::{PushRequest, Repository};
use tokio_util::sync::CancellationToken;

use crate::cache::SmallBlobCache;
use crate::cas::Cas;
use crate::oci::{BlobPut, ManifestRef, RegistryTransport};
use crate::pool::WorkerPool;

pub use image::{CasBlobs, CasImage, CasIndex};
pub use policy::{Fixed, SizeThreshold, TransferMode, TransferPolicy};
pub use tracker::{UploadKey, UploadTracker};

use tracker::{Claim, InFlightGuard};

/// Uploads manifest/index graphs from the CAS to registries.
pub struct PushEngine {
    blobs: CasBlobs,
    registry: Arc<dyn RegistryTransport>,
    pool: WorkerPool,
    tracker: Arc<UploadTracker>,
    policy: Arc<dyn TransferPolicy>,
}

impl PushEngine {
    /// Create an engine with its own worker pool and dedup state.
    pub fn new(
        cas: Arc<dyn Cas>,
        registry: Arc<dyn RegistryTransport>,
        cache: Arc<SmallBlobCache>,
        config: &PushConfig,
    ) -> Self {
        Self {
            blobs: CasBlobs::new(cas, cache),
            registry,
            pool: WorkerPool::with_queue_wait(
                config.workers,
                Duration::from_secs(config.queue_wait_secs),
            ),
            tracker: Arc::new(UploadTracker::new()),
            policy: Arc::new(SizeThreshold::new(config.stream_threshold)),
        }
    }

    /// Replace the stream-vs-cached decision.
    pub fn with_policy(mut self, policy: Arc<dyn TransferPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Upload dedup state, for inspection.
    pub fn tracker(&self) -> &Arc<UploadTracker> {
        &self.tracker
    }

    /// Push the graph rooted at `request.blobs[0]` to `request.destination`.
    pub async fn commit(&self, request: &PushRequest, cancel: &CancellationToken) -> Result<()> {
        request.validate()?;
        let root = &request.blobs[0];
        let destination = request.destination.repository();
        let tags = request.destination.all_tags();

        tracing::info!(
            destination = %destination,
            root = %root.digest,
            strategy = %request.strategy,
            blobs = request.blobs.len(),
            "Committing push"
        );

        let root_ref = match tags.first() {
            Some(tag) => ManifestRef::Tag(tag.clone()),
            None => ManifestRef::Digest(root.digest.clone()),
        };
        let raw = self.blobs.document(root).await?;

        match root.kind() {
            Some(DocumentKind::Manifest) => {
                let image = CasImage::from_raw(root, raw.clone())?;
                self.commit_image(&destination, &image, &root_ref, cancel)
                    .await?;
            }
            Some(DocumentKind::Index) => {
                let index = CasIndex::from_raw(root, raw.clone())?;
                self.commit_index(&destination, &index, &root_ref, cancel)
                    .await?;
            }
            None => return Err(SyncError::UnsupportedMediaType(root.media_type.clone())),
        }

        // Extra tags point at a root that is already fully present.
        for tag in tags.iter().skip(1) {
            check_cancelled(cancel)?;
            self.registry
                .put_manifest(
                    &destination,
                    &ManifestRef::Tag(tag.clone()),
                    &root.media_type,
                    raw.clone(),
                )
                .await?;
            tracing::debug!(destination = %destination, tag = %tag, "Tagged root document");
        }

        tracing::info!(destination = %destination, root = %root.digest, "Push committed");
        Ok(())
    }

    /// Read a push request stored in the CAS under `digest`, then commit it.
    pub async fn commit_from_cas(
        &self,
        digest: &Digest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let request_desc = Descriptor::new("application/json", digest.to_string(), digest.size());
        let data = self.blobs.document(&request_desc).await?;
        let request = PushRequest::from_slice(&data)?;
        self.commit(&request, cancel).await
    }

    /// Stop the worker pool. Jobs already running finish; queued jobs are dropped.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    async fn commit_image(
        &self,
        destination: &Repository,
        image: &CasImage,
        reference: &ManifestRef,
        cancel: &CancellationToken,
    ) -> Result<()> {
        futures::future::try_join_all(
            image
                .layers()
                .iter()
                .map(|layer| self.ensure_uploaded(destination, layer, cancel)),
        )
        .await?;
        self.ensure_uploaded(destination, image.config(), cancel)
            .await?;

        check_cancelled(cancel)?;
        self.registry
            .put_manifest(
                destination,
                reference,
                image.media_type(),
                image.raw_manifest().clone(),
            )
            .await?;

        tracing::debug!(
            destination = %destination,
            manifest = %image.descriptor().digest,
            layers = image.layers().len(),
            "Wrote manifest"
        );
        Ok(())
    }

    async fn commit_index(
        &self,
        destination: &Repository,
        index: &CasIndex,
        reference: &ManifestRef,
        cancel: &CancellationToken,
    ) -> Result<()> {
        // First failure cancels the siblings still running.
        let group = cancel.child_token();
        let children = index.manifests();

        stream::iter(children.iter().map(Ok::<_, SyncError>))
            .try_for_each_concurrent(self.pool.size(), |child| {
                let group = &group;
                async move {
                    let outcome = self.commit_child(destination, child, group).await;
                    if outcome.is_err() {
                        group.cancel();
                    }
                    outcome
                }
            })
            .await?;

        check_cancelled(cancel)?;
        self.registry
            .put_manifest(
                destination,
                reference,
                index.media_type(),
                index.raw_index().clone(),
            )
            .await?;

        tracing::debug!(
            destination = %destination,
            children = children.len(),
            "Wrote index"
        );
        Ok(())
    }

    async fn commit_child(
        &self,
        destination: &Repository,
        child: &Descriptor,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if child.kind() != Some(DocumentKind::Manifest) {
            return Err(SyncError::UnsupportedMediaType(format!(
                "index child {} has media type {}",
                child.digest, child.media_type
            )));
        }
        let image = CasImage::load(&self.blobs, child).await?;
        self.commit_image(
            destination,
            &image,
            &ManifestRef::Digest(child.digest.clone()),
            cancel,
        )
        .await
    }

    /// Make sure `blob` exists at `destination`, uploading it at most once
    /// per engine instance.
    async fn ensure_uploaded(
        &self,
        destination: &Repository,
        blob: &Descriptor,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let key = UploadKey::new(destination, blob.parsed_digest()?);

        loop {
            check_cancelled(cancel)?;
            match self.tracker.claim(&key) {
                Claim::Completed => {
                    tracing::debug!(key = %key, "Blob already uploaded");
                    return Ok(());
                }
                Claim::Wait(status) => {
                    tracing::debug!(key = %key, "Waiting for in-flight upload");
                    let shared = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Err(cancelled(&key)),
                        r = tracker::wait_for(&key, status) => r,
                    };
                    match shared {
                        // The owner gave up on its own account; try again.
                        Err(e) if e.is_cancellation() && !cancel.is_cancelled() => continue,
                        other => return other,
                    }
                }
                Claim::Owner(guard) => return self.upload(guard, blob, cancel).await,
            }
        }
    }

    async fn upload(
        &self,
        guard: InFlightGuard,
        blob: &Descriptor,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let key = guard.key().clone();
        let started = Arc::new(AtomicBool::new(false));
        // Also covers this future being dropped by a failing sibling.
        let _unstarted = Unstarted {
            tracker: Arc::clone(&self.tracker),
            key: key.clone(),
            id: guard.id(),
            started: Arc::clone(&started),
        };
        let job = UploadJob {
            guard,
            started,
            blob: blob.clone(),
            blobs: self.blobs.clone(),
            registry: Arc::clone(&self.registry),
            tracker: Arc::clone(&self.tracker),
            mode: self.policy.mode(blob),
        };

        // On failure the job (and its guard) is dropped, which clears the entry.
        let handle = self
            .pool
            .submit(cancel, job.run())
            .await
            .map_err(|e| SyncError::upload(&blob.digest, &key.destination(), e))?;

        handle.wait(cancel).await
    }
}

/// Releases an owner's in-flight entry when its job never reached a worker.
///
/// Whoever flips `started` first decides. A job a worker already began keeps
/// its entry until its guard resolves.
struct Unstarted {
    tracker: Arc<UploadTracker>,
    key: UploadKey,
    id: u64,
    started: Arc<AtomicBool>,
}

impl Drop for Unstarted {
    fn drop(&mut self) {
        if !self.started.swap(true, Ordering::AcqRel) {
            self.tracker.release(&self.key, self.id);
        }
    }
}

/// One blob upload, run on a pool worker.
struct UploadJob {
    guard: InFlightGuard,
    /// Set by whichever runs first: the worker, or an owner giving up.
    started: Arc<AtomicBool>,
    blob: Descriptor,
    blobs: CasBlobs,
    registry: Arc<dyn RegistryTransport>,
    tracker: Arc<UploadTracker>,
    mode: TransferMode,
}

impl UploadJob {
    async fn run(self) -> Result<()> {
        let key = self.guard.key().clone();
        if self.started.swap(true, Ordering::AcqRel) {
            // Dropping the guard tells any waiters.
            return Err(cancelled(&key));
        }
        if self.tracker.is_completed(&key) {
            self.guard.complete();
            return Ok(());
        }

        match self.transfer(&key).await {
            Ok(put) => {
                tracing::debug!(key = %key, mode = ?self.mode, outcome = ?put, "Uploaded blob");
                self.guard.complete();
                Ok(())
            }
            Err(e) => {
                let e = SyncError::upload(&self.blob.digest, &key.destination(), e);
                tracing::warn!(key = %key, error = %e, "Blob upload failed");
                self.guard.fail(&e);
                Err(e)
            }
        }
    }

    async fn transfer(&self, key: &UploadKey) -> Result<BlobPut> {
        let destination = Repository::new(&key.registry, &key.repository);
        let payload = self.blobs.payload(&self.blob, self.mode).await?;
        self.registry
            .put_blob(&destination, &key.digest, payload)
            .await
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(SyncError::Cancelled("push cancelled".to_string()));
    }
    Ok(())
}

fn cancelled(key: &UploadKey) -> SyncError {
    SyncError::Cancelled(format!("stopped waiting for upload of {}", key))
}
