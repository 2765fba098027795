//! OCI reference graph entries and the persisted facts cache.
//!
//! A [`RefGraphEntry`] records what a manifest or index points at. Entries are
//! persisted between runs as "facts" keyed `oci_ref_graph@<digest>`, so a
//! digest resolved once never has to be downloaded again to learn its shape.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::descriptor::{detect_media_type, DocumentKind};
use crate::error::{Result, SyncError};
use crate::request::{LayerHandling, Repository};

/// Key prefix of ref-graph facts.
pub const FACT_PREFIX: &str = "oci_ref_graph@";

/// A manifest or index in the reference graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefGraphEntry {
    pub kind: DocumentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub layers: Vec<String>,
    #[serde(default, rename = "manifests", skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
}

impl RefGraphEntry {
    /// Derive an entry from raw manifest bytes.
    pub fn from_manifest_bytes(data: &[u8]) -> Result<Self> {
        let media_type = detect_media_type(data).unwrap_or_default();
        let kind = DocumentKind::from_media_type_loose(&media_type).ok_or_else(|| {
            SyncError::UnsupportedMediaType(format!("unknown manifest kind '{}'", media_type))
        })?;

        let value: serde_json::Value = serde_json::from_slice(data)?;
        let digest_of = |v: &serde_json::Value| {
            v.get("digest")
                .and_then(|d| d.as_str())
                .map(str::to_string)
        };

        let mut entry = RefGraphEntry {
            kind,
            config: None,
            layers: Vec::new(),
            children: Vec::new(),
        };
        match kind {
            DocumentKind::Manifest => {
                entry.config = value.get("config").and_then(digest_of);
                if let Some(layers) = value.get("layers").and_then(|l| l.as_array()) {
                    entry.layers = layers.iter().filter_map(digest_of).collect();
                }
            }
            DocumentKind::Index => {
                if let Some(children) = value.get("manifests").and_then(|m| m.as_array()) {
                    entry.children = children.iter().filter_map(digest_of).collect();
                }
            }
        }
        Ok(entry)
    }
}

/// Ref-graph facts from a previous run, keyed by digest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Facts {
    entries: BTreeMap<String, RefGraphEntry>,
}

impl Facts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a facts file. A missing or empty file yields no facts; foreign
    /// keys and entries that do not parse are ignored.
    pub fn load(path: &Path) -> Result<Self> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(e.into()),
        };
        if data.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Self::new());
        }
        Self::from_slice(&data)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let raw: HashMap<String, serde_json::Value> = serde_json::from_slice(data)
            .map_err(|e| SyncError::InvalidDocument(format!("facts: {}", e)))?;
        let mut entries = BTreeMap::new();
        for (key, value) in raw {
            let Some(digest) = key.strip_prefix(FACT_PREFIX) else {
                continue;
            };
            match serde_json::from_value::<RefGraphEntry>(value) {
                Ok(entry) => {
                    entries.insert(digest.to_string(), entry);
                }
                Err(e) => {
                    tracing::debug!(digest, error = %e, "Ignoring unreadable ref-graph fact");
                }
            }
        }
        Ok(Self { entries })
    }

    pub fn get(&self, digest: &str) -> Option<&RefGraphEntry> {
        self.entries.get(digest)
    }

    pub fn insert(&mut self, digest: impl Into<String>, entry: RefGraphEntry) {
        self.entries.insert(digest.into(), entry);
    }

    pub fn contains(&self, digest: &str) -> bool {
        self.entries.contains_key(digest)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RefGraphEntry)> {
        self.entries.iter()
    }

    /// Pretty JSON with `oci_ref_graph@` keys.
    pub fn to_json(&self) -> Result<String> {
        let keyed: BTreeMap<String, &RefGraphEntry> = self
            .entries
            .iter()
            .map(|(digest, entry)| (format!("{}{}", FACT_PREFIX, digest), entry))
            .collect();
        Ok(serde_json::to_string_pretty(&keyed)?)
    }

    /// Write atomically (write tmp, rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, self.to_json()?)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

impl FromIterator<(String, RefGraphEntry)> for Facts {
    fn from_iter<I: IntoIterator<Item = (String, RefGraphEntry)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// An image to resolve, with the sources it can be fetched from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageInfo {
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub registries: Vec<String>,
    #[serde(default)]
    pub digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default)]
    pub layer_handling: LayerHandling,
    /// repository → registries
    #[serde(default)]
    pub sources: BTreeMap<String, Vec<String>>,
}

impl ImageInfo {
    /// Candidate sources in order: explicit `sources` first, then
    /// `repository` on each of `registries`.
    pub fn candidate_sources(&self) -> Vec<Repository> {
        let mut out = Vec::new();
        for (repository, registries) in &self.sources {
            for registry in registries {
                out.push(Repository::new(registry, repository));
            }
        }
        if !self.repository.is_empty() {
            for registry in &self.registries {
                let candidate = Repository::new(registry, &self.repository);
                if !out.contains(&candidate) {
                    out.push(candidate);
                }
            }
        }
        out
    }
}

/// Load an images document (`digest → ImageInfo`).
pub fn load_images(path: &Path) -> Result<BTreeMap<String, ImageInfo>> {
    let data = std::fs::read(path)?;
    serde_json::from_slice(&data).map_err(|e| SyncError::InvalidDocument(format!("images: {}", e)))
}
