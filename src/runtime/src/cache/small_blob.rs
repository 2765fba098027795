//! In-memory cache of small, already-verified blobs.
//!
//! Keeps manifests, configs and other small documents around so repeated
//! reads within one engine instance do not go back to disk or network.

use std::collections::HashMap;

use bytes::Bytes;
use imgsync_core::digest::{self, Digest};
use imgsync_core::error::Result;
use parking_lot::RwLock;

use crate::cas::Cas;

/// Default upper bound for cached entries: 1 MiB.
pub const DEFAULT_SMALL_BLOB_LIMIT: u64 = 1024 * 1024;

/// Small-object cache keyed by content hash.
pub struct SmallBlobCache {
    limit: u64,
    entries: RwLock<HashMap<[u8; 32], Bytes>>,
}

impl SmallBlobCache {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Largest blob the cache will hold.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn get(&self, digest: &Digest) -> Option<Bytes> {
        self.entries.read().get(digest.hash()).cloned()
    }

    /// Cache `data` under `digest` if it is small enough. The caller must
    /// have verified the content.
    pub fn insert(&self, digest: &Digest, data: Bytes) -> bool {
        if data.len() as u64 > self.limit {
            return false;
        }
        self.entries.write().insert(*digest.hash(), data);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Return the cached bytes for `digest`, reading and verifying them from
    /// the CAS on a miss.
    pub async fn get_or_load(&self, cas: &dyn Cas, digest: &Digest) -> Result<Bytes> {
        if let Some(data) = self.get(digest) {
            return Ok(data);
        }

        let data = cas.read_blob(digest).await?;
        digest::verify(&digest.to_string(), &data)?;
        if self.insert(digest, data.clone()) {
            tracing::debug!(digest = %digest, size = data.len(), "Cached small blob");
        }
        Ok(data)
    }
}

impl Default for SmallBlobCache {
    fn default() -> Self {
        Self::new(DEFAULT_SMALL_BLOB_LIMIT)
    }
}
