//! Shared fixtures for the engine integration tests.
//!
//! [`FakeRegistry`] is an in-memory distribution API. Every call is recorded
//! with a start and finish number from one global sequence, so tests can
//! assert ordering, and concurrent blob transfers are counted so tests can
//! assert the worker bound.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use imgsync_core::descriptor::{media_types, Descriptor};
use imgsync_core::digest::Digest;
use imgsync_core::error::{Result, SyncError};
use imgsync_core::request::{PushRequest, PushStrategy, PushTarget, Repository};
use imgsync_runtime::cas::{BlobReader, Cas, DiskCas};
use imgsync_runtime::oci::{BlobPayload, BlobPut, FetchedManifest, ManifestRef, RegistryTransport};
use tokio::io::AsyncReadExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    GetManifest,
    GetBlob,
    PutBlob,
    PutManifest,
}

/// One recorded registry call.
#[derive(Debug, Clone)]
pub struct Call {
    pub op: Op,
    /// `registry/repository`
    pub repo: String,
    /// Digest or tag.
    pub target: String,
    pub started: u64,
    pub finished: u64,
    pub ok: bool,
}

#[derive(Default)]
struct State {
    blobs: HashMap<(String, String), Bytes>,
    manifests: HashMap<(String, String), (String, Bytes)>,
    calls: Vec<Call>,
}

/// In-memory registry with failure injection.
#[derive(Default)]
pub struct FakeRegistry {
    state: Mutex<State>,
    seq: AtomicU64,
    active: AtomicUsize,
    peak: AtomicUsize,
    delay_ms: AtomicU64,
    already_present: AtomicBool,
    down: Mutex<HashSet<String>>,
    tampered: Mutex<HashSet<String>>,
    corrupt_blobs: Mutex<HashSet<String>>,
    failing_uploads: Mutex<HashSet<String>>,
}

impl FakeRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Hold every blob transfer for `delay`.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Answer every blob upload with "already exists".
    pub fn report_already_present(&self) {
        self.already_present.store(true, Ordering::SeqCst);
    }

    /// Fail every call against `registry`.
    pub fn take_down(&self, registry: &str) {
        self.down.lock().unwrap().insert(registry.to_string());
    }

    /// Serve manifests from `registry` with altered bytes.
    pub fn tamper(&self, registry: &str) {
        self.tampered.lock().unwrap().insert(registry.to_string());
    }

    /// Serve blobs from `registry` with garbage bytes.
    pub fn corrupt_blobs_from(&self, registry: &str) {
        self.corrupt_blobs.lock().unwrap().insert(registry.to_string());
    }

    /// Fail uploads of `digest`.
    pub fn fail_upload_of(&self, digest: &str) {
        self.failing_uploads.lock().unwrap().insert(digest.to_string());
    }

    pub fn seed_blob(&self, repo: &Repository, data: &[u8]) -> Descriptor {
        let desc = Descriptor::for_bytes("application/octet-stream", data);
        self.state
            .lock()
            .unwrap()
            .blobs
            .insert((repo.to_string(), desc.digest.clone()), Bytes::copy_from_slice(data));
        desc
    }

    /// Store a manifest under its digest and, if given, a tag.
    pub fn seed_manifest(&self, repo: &Repository, tag: Option<&str>, media_type: &str, data: &Bytes) {
        let mut state = self.state.lock().unwrap();
        let digest = Digest::of(data).to_string();
        for reference in std::iter::once(digest).chain(tag.map(str::to_string)) {
            state.manifests.insert(
                (repo.to_string(), reference),
                (media_type.to_string(), data.clone()),
            );
        }
    }

    /// Make every blob and manifest of `image` available at `repo`.
    pub fn seed_image(&self, repo: &Repository, tag: Option<&str>, image: &TestImage) {
        for (_, data) in &image.blobs {
            self.seed_blob(repo, data);
        }
        self.seed_manifest(repo, tag, &image.manifest.media_type, &image.raw);
    }

    pub fn has_blob(&self, repo: &Repository, digest: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .blobs
            .contains_key(&(repo.to_string(), digest.to_string()))
    }

    pub fn manifest(&self, repo: &Repository, reference: &str) -> Option<Bytes> {
        self.state
            .lock()
            .unwrap()
            .manifests
            .get(&(repo.to_string(), reference.to_string()))
            .map(|(_, data)| data.clone())
    }

    pub fn calls(&self) -> Vec<Call> {
        let mut calls = self.state.lock().unwrap().calls.clone();
        calls.sort_by_key(|c| c.started);
        calls
    }

    pub fn calls_of(&self, op: Op) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.op == op).collect()
    }

    /// Most blob transfers seen in progress at once.
    pub fn peak_transfers(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    fn record(&self, op: Op, repo: &Repository, target: &str, started: u64, ok: bool) {
        let finished = self.next();
        self.state.lock().unwrap().calls.push(Call {
            op,
            repo: repo.to_string(),
            target: target.to_string(),
            started,
            finished,
            ok,
        });
    }

    fn check_up(&self, repo: &Repository) -> Result<()> {
        if self.down.lock().unwrap().contains(&repo.registry) {
            return Err(SyncError::Registry {
                registry: repo.registry.clone(),
                message: "connection refused".to_string(),
            });
        }
        Ok(())
    }

    async fn transfer<T>(&self, work: impl std::future::Future<Output = T>) -> T {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let out = work.await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        out
    }

    fn missing(repo: &Repository, what: &str) -> SyncError {
        SyncError::Registry {
            registry: repo.registry.clone(),
            message: format!("{} not found in {}", what, repo.repository),
        }
    }
}

#[async_trait]
impl RegistryTransport for FakeRegistry {
    async fn get_manifest(&self, repo: &Repository, reference: &ManifestRef) -> Result<FetchedManifest> {
        let started = self.next();
        let result = self.check_up(repo).and_then(|_| {
            let state = self.state.lock().unwrap();
            let (media_type, data) = state
                .manifests
                .get(&(repo.to_string(), reference.as_str().to_string()))
                .cloned()
                .ok_or_else(|| Self::missing(repo, reference.as_str()))?;
            let data = if self.tampered.lock().unwrap().contains(&repo.registry) {
                let mut altered = data.to_vec();
                altered.extend_from_slice(b"\n");
                Bytes::from(altered)
            } else {
                data
            };
            Ok(FetchedManifest { data, media_type })
        });
        self.record(Op::GetManifest, repo, reference.as_str(), started, result.is_ok());
        result
    }

    async fn get_blob(&self, repo: &Repository, digest: &Digest) -> Result<BlobReader> {
        let started = self.next();
        let result = self
            .transfer(async move {
                self.check_up(repo)?;
                let data = self
                    .state
                    .lock()
                    .unwrap()
                    .blobs
                    .get(&(repo.to_string(), digest.to_string()))
                    .cloned()
                    .ok_or_else(|| Self::missing(repo, &digest.to_string()))?;
                let data = if self.corrupt_blobs.lock().unwrap().contains(&repo.registry) {
                    Bytes::from_static(b"garbage")
                } else {
                    data
                };
                Ok::<BlobReader, SyncError>(Box::new(std::io::Cursor::new(data)))
            })
            .await;
        self.record(Op::GetBlob, repo, &digest.to_string(), started, result.is_ok());
        result
    }

    async fn put_blob(&self, repo: &Repository, digest: &Digest, payload: BlobPayload) -> Result<BlobPut> {
        let started = self.next();
        let result = self
            .transfer(async move {
                self.check_up(repo)?;
                if self.failing_uploads.lock().unwrap().contains(&digest.to_string()) {
                    return Err(SyncError::Registry {
                        registry: repo.registry.clone(),
                        message: "403 Forbidden".to_string(),
                    });
                }
                let data = match payload {
                    BlobPayload::Cached(data) => data,
                    BlobPayload::Streamed(mut reader) => {
                        let mut buf = Vec::new();
                        reader.read_to_end(&mut buf).await?;
                        Bytes::from(buf)
                    }
                };
                assert_eq!(&Digest::of(&data).to_string(), &digest.to_string());
                if self.already_present.load(Ordering::SeqCst) {
                    return Ok(BlobPut::AlreadyPresent);
                }
                self.state
                    .lock()
                    .unwrap()
                    .blobs
                    .insert((repo.to_string(), digest.to_string()), data);
                Ok(BlobPut::Uploaded)
            })
            .await;
        self.record(Op::PutBlob, repo, &digest.to_string(), started, result.is_ok());
        result
    }

    async fn put_manifest(
        &self,
        repo: &Repository,
        reference: &ManifestRef,
        media_type: &str,
        data: Bytes,
    ) -> Result<()> {
        let started = self.next();
        let result = self.check_up(repo).map(|_| {
            self.state.lock().unwrap().manifests.insert(
                (repo.to_string(), reference.as_str().to_string()),
                (media_type.to_string(), data),
            );
        });
        self.record(Op::PutManifest, repo, reference.as_str(), started, result.is_ok());
        result
    }
}

/// A single-platform image built in memory.
#[derive(Debug, Clone)]
pub struct TestImage {
    pub manifest: Descriptor,
    pub raw: Bytes,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    /// Config and layers with their bytes.
    pub blobs: Vec<(Descriptor, Bytes)>,
}

impl TestImage {
    /// `layer_count` layers whose content is derived from `name`.
    pub fn build(name: &str, layer_count: usize) -> Self {
        let config_data = Bytes::from(format!(r#"{{"architecture":"amd64","os":"linux","name":"{}"}}"#, name));
        let config = Descriptor::for_bytes(media_types::OCI_CONFIG, &config_data);

        let mut blobs = vec![(config.clone(), config_data)];
        let mut layers = Vec::new();
        for i in 0..layer_count {
            let data = Bytes::from(format!("{}-layer-{}", name, i).repeat(16));
            let layer = Descriptor::for_bytes(media_types::OCI_LAYER_GZIP, &data);
            layers.push(layer.clone());
            blobs.push((layer, data));
        }

        let raw = Bytes::from(
            serde_json::to_vec(&serde_json::json!({
                "schemaVersion": 2,
                "mediaType": media_types::OCI_MANIFEST,
                "config": config,
                "layers": layers,
            }))
            .unwrap(),
        );
        let manifest = Descriptor::for_bytes(media_types::OCI_MANIFEST, &raw);

        Self {
            manifest,
            raw,
            config,
            layers,
            blobs,
        }
    }

    pub fn digests(&self) -> Vec<String> {
        self.blobs.iter().map(|(d, _)| d.digest.clone()).collect()
    }
}

/// Index over `images`, returned as descriptor plus raw bytes.
pub fn build_index(images: &[&TestImage]) -> (Descriptor, Bytes) {
    let children: Vec<Descriptor> = images.iter().map(|i| i.manifest.clone()).collect();
    let raw = Bytes::from(
        serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": media_types::OCI_INDEX,
            "manifests": children,
        }))
        .unwrap(),
    );
    (Descriptor::for_bytes(media_types::OCI_INDEX, &raw), raw)
}

pub async fn store(cas: &DiskCas, data: &[u8]) {
    cas.write_small_with_digest(&Digest::of(data), data)
        .await
        .unwrap();
}

/// Put every blob of `image`, manifest included, into the CAS.
pub async fn seed_cas(cas: &DiskCas, image: &TestImage) {
    for (_, data) in &image.blobs {
        store(cas, data).await;
    }
    store(cas, &image.raw).await;
}

pub fn push_request(destination: &Repository, tags: &[&str], blobs: Vec<Descriptor>) -> PushRequest {
    PushRequest {
        strategy: PushStrategy::CasRegistry,
        destination: PushTarget {
            registry: destination.registry.clone(),
            repository: destination.repository.clone(),
            tag: None,
            tags: tags.iter().map(|t| t.to_string()).collect(),
        },
        blobs,
    }
}
