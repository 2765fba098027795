//! Read-only views of CAS content for the push path.
//!
//! These hold no state of their own beyond parsed documents: every byte
//! comes from the CAS (through the small-object cache).

use std::sync::Arc;

use bytes::Bytes;
use imgsync_core::descriptor::{Descriptor, ImageIndex, ImageManifest};
use imgsync_core::error::Result;

use super::policy::TransferMode;
use crate::cache::SmallBlobCache;
use crate::cas::Cas;
use crate::oci::BlobPayload;

/// CAS accessors used by the push engine.
#[derive(Clone)]
pub struct CasBlobs {
    cas: Arc<dyn Cas>,
    cache: Arc<SmallBlobCache>,
}

impl CasBlobs {
    pub fn new(cas: Arc<dyn Cas>, cache: Arc<SmallBlobCache>) -> Self {
        Self { cas, cache }
    }

    /// Verified bytes of a small document (manifest, index, config).
    pub async fn document(&self, blob: &Descriptor) -> Result<Bytes> {
        let digest = blob.parsed_digest()?;
        self.cache.get_or_load(self.cas.as_ref(), &digest).await
    }

    /// Upload payload for `blob` in the given mode.
    pub async fn payload(&self, blob: &Descriptor, mode: TransferMode) -> Result<BlobPayload> {
        let digest = blob.parsed_digest()?;
        match mode {
            TransferMode::Stream => Ok(BlobPayload::Streamed(
                self.cas.reader_for_blob(&digest).await?,
            )),
            TransferMode::Cached => Ok(BlobPayload::Cached(
                self.cache.get_or_load(self.cas.as_ref(), &digest).await?,
            )),
        }
    }
}

/// An image manifest stored in the CAS.
#[derive(Debug, Clone)]
pub struct CasImage {
    descriptor: Descriptor,
    raw: Bytes,
    manifest: ImageManifest,
}

impl CasImage {
    pub async fn load(blobs: &CasBlobs, descriptor: &Descriptor) -> Result<Self> {
        let raw = blobs.document(descriptor).await?;
        Self::from_raw(descriptor, raw)
    }

    pub fn from_raw(descriptor: &Descriptor, raw: Bytes) -> Result<Self> {
        let manifest = ImageManifest::from_slice(&raw)?;
        Ok(Self {
            descriptor: descriptor.clone(),
            raw,
            manifest,
        })
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn media_type(&self) -> &str {
        &self.descriptor.media_type
    }

    pub fn raw_manifest(&self) -> &Bytes {
        &self.raw
    }

    pub fn config(&self) -> &Descriptor {
        &self.manifest.config
    }

    pub fn layers(&self) -> &[Descriptor] {
        &self.manifest.layers
    }
}

/// An image index stored in the CAS.
#[derive(Debug, Clone)]
pub struct CasIndex {
    descriptor: Descriptor,
    raw: Bytes,
    index: ImageIndex,
}

impl CasIndex {
    pub fn from_raw(descriptor: &Descriptor, raw: Bytes) -> Result<Self> {
        let index = ImageIndex::from_slice(&raw)?;
        Ok(Self {
            descriptor: descriptor.clone(),
            raw,
            index,
        })
    }

    pub fn media_type(&self) -> &str {
        &self.descriptor.media_type
    }

    pub fn raw_index(&self) -> &Bytes {
        &self.raw
    }

    pub fn manifests(&self) -> &[Descriptor] {
        &self.index.manifests
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cas::DiskCas;
    use imgsync_core::descriptor::media_types;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    async fn store(cas: &DiskCas, media_type: &str, data: &[u8]) -> Descriptor {
        let desc = Descriptor::for_bytes(media_type, data);
        cas.write_small_with_digest(&desc.parsed_digest().unwrap(), data)
            .await
            .unwrap();
        desc
    }

    #[tokio::test]
    async fn test_load_image_and_payloads() {
        let dir = TempDir::new().unwrap();
        let cas = DiskCas::open(dir.path()).unwrap();

        let config = store(&cas, media_types::OCI_CONFIG, b"{\"os\":\"linux\"}").await;
        let layer = store(&cas, media_types::OCI_LAYER_GZIP, b"layer-bytes").await;
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": media_types::OCI_MANIFEST,
            "config": config,
            "layers": [layer],
        });
        let manifest_desc = store(
            &cas,
            media_types::OCI_MANIFEST,
            &serde_json::to_vec(&manifest).unwrap(),
        )
        .await;

        let blobs = CasBlobs::new(Arc::new(cas), Arc::new(SmallBlobCache::default()));
        let image = CasImage::load(&blobs, &manifest_desc).await.unwrap();
        assert_eq!(image.config(), &config);
        assert_eq!(image.layers(), &[layer.clone()]);
        assert_eq!(image.media_type(), media_types::OCI_MANIFEST);

        match blobs.payload(&layer, TransferMode::Stream).await.unwrap() {
            BlobPayload::Streamed(mut reader) => {
                let mut data = Vec::new();
                reader.read_to_end(&mut data).await.unwrap();
                assert_eq!(data, b"layer-bytes");
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert!(matches!(
            blobs.payload(&layer, TransferMode::Cached).await.unwrap(),
            BlobPayload::Cached(ref b) if b.as_ref() == b"layer-bytes"
        ));
    }
}
