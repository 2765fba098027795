//! Descriptors, media types and the manifest/index documents they point at.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::digest::{self, Digest};
use crate::error::{Result, SyncError};

/// Well-known media types.
pub mod media_types {
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
    pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
    pub const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const DOCKER_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";
    pub const DOCKER_MANIFEST_V1: &str = "application/vnd.docker.distribution.manifest.v1+json";

    /// Media types accepted when fetching a manifest by tag or digest.
    pub const ACCEPTED_MANIFESTS: &[&str] =
        &[OCI_MANIFEST, OCI_INDEX, DOCKER_MANIFEST, DOCKER_MANIFEST_LIST];
}

/// What kind of root document a media type describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    /// A single-platform image manifest.
    Manifest,
    /// An image index / manifest list.
    Index,
}

impl DocumentKind {
    /// Classify a media type. Returns `None` for configs, layers and unknown types.
    pub fn from_media_type(media_type: &str) -> Option<Self> {
        match media_type {
            media_types::OCI_INDEX | media_types::DOCKER_MANIFEST_LIST => Some(Self::Index),
            media_types::OCI_MANIFEST | media_types::DOCKER_MANIFEST => Some(Self::Manifest),
            _ => None,
        }
    }

    /// Loose classification used for documents seen in the wild
    /// (`manifest.list`/`image.index` vs `manifest.v1`/`manifest.v2`).
    pub fn from_media_type_loose(media_type: &str) -> Option<Self> {
        if media_type.contains("manifest.list") || media_type.contains("image.index") {
            Some(Self::Index)
        } else if media_type.contains("manifest.v1") || media_type.contains("manifest.v2") {
            Some(Self::Manifest)
        } else {
            None
        }
    }
}

impl std::fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manifest => write!(f, "manifest"),
            Self::Index => write!(f, "index"),
        }
    }
}

/// Metadata record identifying a manifest, config or layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: impl Into<String>, size: i64) -> Self {
        Self {
            media_type: media_type.into(),
            digest: digest.into(),
            size,
            annotations: None,
        }
    }

    /// Describe an in-memory blob.
    pub fn for_bytes(media_type: impl Into<String>, data: &[u8]) -> Self {
        Self::new(media_type, Digest::of(data).to_string(), data.len() as i64)
    }

    /// Parsed digest (rejects non-canonical strings before any I/O).
    pub fn parsed_digest(&self) -> Result<Digest> {
        Digest::parse(&self.digest, self.size)
    }

    /// Root document kind, if this descriptor names a manifest or index.
    pub fn kind(&self) -> Option<DocumentKind> {
        DocumentKind::from_media_type(&self.media_type)
    }
}

/// Image manifest, reduced to the fields the engines need.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub media_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

impl ImageManifest {
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let manifest: Self = serde_json::from_slice(data)
            .map_err(|e| SyncError::InvalidDocument(format!("image manifest: {}", e)))?;
        digest::validate(&manifest.config.digest)?;
        for layer in &manifest.layers {
            digest::validate(&layer.digest)?;
        }
        Ok(manifest)
    }
}

/// Image index / manifest list, reduced to its child descriptors.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
}

impl ImageIndex {
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let index: Self = serde_json::from_slice(data)
            .map_err(|e| SyncError::InvalidDocument(format!("image index: {}", e)))?;
        for child in &index.manifests {
            digest::validate(&child.digest)?;
        }
        Ok(index)
    }
}

/// Media type of a raw manifest document.
///
/// Uses the `mediaType` field when present, otherwise infers it from the
/// document structure (`manifests` → OCI index, `config`+`layers` → OCI manifest,
/// `schemaVersion: 1` → Docker v1).
pub fn detect_media_type(data: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(data).ok()?;
    if let Some(mt) = value.get("mediaType").and_then(|v| v.as_str()) {
        return Some(mt.to_string());
    }
    if value.get("manifests").is_some() {
        return Some(media_types::OCI_INDEX.to_string());
    }
    if value.get("config").is_some() && value.get("layers").is_some() {
        return Some(media_types::OCI_MANIFEST.to_string());
    }
    if value.get("schemaVersion").and_then(|v| v.as_u64()) == Some(1) {
        return Some(media_types::DOCKER_MANIFEST_V1.to_string());
    }
    None
}
