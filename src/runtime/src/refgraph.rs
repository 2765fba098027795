//! Building ref-graph facts for a set of images.
//!
//! Phase one resolves every top-level digest, phase two every child manifest
//! of the indexes found in phase one. Digests already present in the facts
//! from a previous run are never downloaded again.

use std::collections::BTreeMap;
use std::sync::Arc;

use imgsync_core::descriptor::DocumentKind;
use imgsync_core::digest;
use imgsync_core::error::{Result, SyncError};
use imgsync_core::refgraph::{Facts, ImageInfo, RefGraphEntry};
use imgsync_core::request::Repository;
use tokio_util::sync::CancellationToken;

use crate::oci::{ManifestRef, RegistryTransport};
use crate::pool::{JobHandle, WorkerPool};
use crate::pull::first_success;

/// Default number of concurrent manifest downloads.
pub const DEFAULT_REFGRAPH_WORKERS: usize = 10;

/// Resolves manifests and indexes into [`RefGraphEntry`] facts.
pub struct RefGraphSyncer {
    transport: Arc<dyn RegistryTransport>,
    workers: usize,
}

impl RefGraphSyncer {
    pub fn new(transport: Arc<dyn RegistryTransport>) -> Self {
        Self {
            transport,
            workers: DEFAULT_REFGRAPH_WORKERS,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Facts for every image in `images` and every child of those that are
    /// indexes. `cached` short-circuits digests seen before.
    pub async fn sync(
        &self,
        images: &BTreeMap<String, ImageInfo>,
        cached: &Facts,
        cancel: &CancellationToken,
    ) -> Result<Facts> {
        let pool = WorkerPool::new(self.workers);
        let result = self.sync_on(&pool, images, cached, cancel).await;
        pool.shutdown().await;
        result
    }

    async fn sync_on(
        &self,
        pool: &WorkerPool,
        images: &BTreeMap<String, ImageInfo>,
        cached: &Facts,
        cancel: &CancellationToken,
    ) -> Result<Facts> {
        let mut facts = Facts::new();

        // Phase one: top-level images.
        let mut jobs = Vec::new();
        for (digest, info) in images {
            digest::validate(digest)?;
            match cached.get(digest) {
                Some(entry) => facts.insert(digest.clone(), entry.clone()),
                None => {
                    let handle = self
                        .submit(pool, digest, info.candidate_sources(), cancel)
                        .await?;
                    jobs.push((digest.clone(), handle));
                }
            }
        }
        let fetched = jobs.len();
        for (digest, handle) in jobs {
            facts.insert(digest, handle.join().await?);
        }
        tracing::info!(images = images.len(), fetched, "Resolved top-level images");

        // Phase two: children of indexes, fetched from their parent's sources.
        let mut children: BTreeMap<String, Vec<Repository>> = BTreeMap::new();
        for (digest, entry) in facts.iter() {
            if entry.kind != DocumentKind::Index {
                continue;
            }
            let sources = images
                .get(digest)
                .map(ImageInfo::candidate_sources)
                .unwrap_or_default();
            for child in &entry.children {
                children
                    .entry(child.clone())
                    .or_default()
                    .extend(sources.iter().cloned());
            }
        }

        let mut jobs = Vec::new();
        for (child, mut sources) in children {
            if let Some(entry) = facts.get(&child).or_else(|| cached.get(&child)) {
                let entry = entry.clone();
                check_child(&child, &entry)?;
                facts.insert(child, entry);
                continue;
            }
            dedup_in_order(&mut sources);
            let handle = self.submit(pool, &child, sources, cancel).await?;
            jobs.push((child, handle));
        }
        let fetched = jobs.len();
        for (child, handle) in jobs {
            let entry = handle.join().await?;
            check_child(&child, &entry)?;
            facts.insert(child, entry);
        }
        tracing::info!(fetched, total = facts.len(), "Resolved index children");

        Ok(facts)
    }

    async fn submit(
        &self,
        pool: &WorkerPool,
        digest: &str,
        sources: Vec<Repository>,
        cancel: &CancellationToken,
    ) -> Result<JobHandle<RefGraphEntry>> {
        let job = fetch_entry(
            Arc::clone(&self.transport),
            sources,
            digest.to_string(),
            cancel.clone(),
        );
        pool.submit(cancel, job).await
    }
}

async fn fetch_entry(
    transport: Arc<dyn RegistryTransport>,
    sources: Vec<Repository>,
    digest: String,
    cancel: CancellationToken,
) -> Result<RefGraphEntry> {
    let what = format!("manifest {}", digest);
    let reference = ManifestRef::Digest(digest.clone());
    let (source, data) = first_success(&what, &sources, &cancel, |src| {
        let transport = &transport;
        let reference = &reference;
        let expected = &digest;
        async move {
            let fetched = transport.get_manifest(&src, reference).await?;
            digest::verify(expected, &fetched.data)?;
            Ok(fetched.data)
        }
    })
    .await?;

    let entry = RefGraphEntry::from_manifest_bytes(&data)?;
    tracing::debug!(digest = %digest, kind = %entry.kind, source = %source, "Fetched ref-graph entry");
    Ok(entry)
}

fn check_child(digest: &str, entry: &RefGraphEntry) -> Result<()> {
    if entry.kind != DocumentKind::Manifest {
        return Err(SyncError::UnsupportedMediaType(format!(
            "index child {} is a {}, expected a manifest",
            digest, entry.kind
        )));
    }
    Ok(())
}

fn dedup_in_order(sources: &mut Vec<Repository>) {
    let mut seen = std::collections::HashSet::new();
    sources.retain(|s| seen.insert(s.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_in_order() {
        let a = Repository::new("a.io", "app");
        let b = Repository::new("b.io", "app");
        let mut sources = vec![a.clone(), b.clone(), a.clone()];
        dedup_in_order(&mut sources);
        assert_eq!(sources, vec![a, b]);
    }

    #[test]
    fn test_check_child_rejects_index() {
        let entry = RefGraphEntry {
            kind: DocumentKind::Index,
            config: None,
            layers: Vec::new(),
            children: vec!["sha256:x".to_string()],
        };
        assert!(matches!(
            check_child("sha256:x", &entry),
            Err(SyncError::UnsupportedMediaType(_))
        ));
    }
}
