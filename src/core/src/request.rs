//! Request documents consumed by the push and pull engines.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::descriptor::{Descriptor, DocumentKind};
use crate::digest::{self, SHA256_PREFIX};
use crate::error::{Result, SyncError};

/// Registry used when a pull names no source.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// How the blobs of a push were staged upstream.
///
/// Only logged by the engine; the CAS-to-registry sync is the same for all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushStrategy {
    #[default]
    Eager,
    Lazy,
    CasRegistry,
    Bes,
}

impl std::fmt::Display for PushStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Eager => write!(f, "eager"),
            Self::Lazy => write!(f, "lazy"),
            Self::CasRegistry => write!(f, "cas_registry"),
            Self::Bes => write!(f, "bes"),
        }
    }
}

/// A `(registry, repository)` pair: a push destination or a pull source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Repository {
    pub registry: String,
    pub repository: String,
}

impl Repository {
    pub fn new(registry: impl Into<String>, repository: impl Into<String>) -> Self {
        Self {
            registry: registry.into(),
            repository: repository.into(),
        }
    }

    /// Parse the `repository@registry` form used on the command line.
    pub fn parse_source(source: &str) -> Result<Self> {
        match source.split_once('@') {
            Some((repository, registry)) if !repository.is_empty() && !registry.is_empty() => {
                Ok(Self::new(registry, repository))
            }
            _ => Err(SyncError::Config(format!(
                "invalid source format '{}', expected repository@registry",
                source
            ))),
        }
    }
}

impl std::fmt::Display for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)
    }
}

/// Push destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushTarget {
    pub registry: String,
    pub repository: String,
    /// Single tag (older request files).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl PushTarget {
    pub fn repository(&self) -> Repository {
        Repository::new(&self.registry, &self.repository)
    }

    /// All tags in order, `tag` first, without duplicates.
    pub fn all_tags(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for tag in self.tag.iter().chain(self.tags.iter()) {
            if !tag.is_empty() && !out.contains(tag) {
                out.push(tag.clone());
            }
        }
        out
    }
}

/// Push request: upload `blobs` (root document first) to `destination`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    #[serde(default)]
    pub strategy: PushStrategy,
    #[serde(alias = "push_target")]
    pub destination: PushTarget,
    pub blobs: Vec<Descriptor>,
}

impl PushRequest {
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let request: Self = serde_json::from_slice(data)
            .map_err(|e| SyncError::InvalidDocument(format!("push request: {}", e)))?;
        request.validate()?;
        Ok(request)
    }

    /// Reject requests the engine could never complete, before any I/O.
    pub fn validate(&self) -> Result<()> {
        let root = self
            .blobs
            .first()
            .ok_or_else(|| SyncError::InvalidDocument("no blobs in push request".to_string()))?;
        if root.kind().is_none() {
            return Err(SyncError::UnsupportedMediaType(root.media_type.clone()));
        }
        for blob in &self.blobs {
            digest::validate(&blob.digest)?;
        }
        if self.destination.registry.is_empty() || self.destination.repository.is_empty() {
            return Err(SyncError::InvalidDocument(
                "push destination needs a registry and a repository".to_string(),
            ));
        }
        Ok(())
    }

    /// The root document (manifest or index).
    pub fn root(&self) -> Option<&Descriptor> {
        self.blobs.first()
    }

    pub fn root_kind(&self) -> Option<DocumentKind> {
        self.root().and_then(|d| d.kind())
    }

    /// Find the descriptor for `digest` among the request blobs.
    pub fn find(&self, digest: &str) -> Option<&Descriptor> {
        self.blobs.iter().find(|b| b.digest == digest)
    }
}

/// Whether layer bodies are fetched during a pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerHandling {
    /// Only manifests and configs; layers are fetched on demand later.
    #[default]
    Shallow,
    /// Every layer body is downloaded immediately.
    Eager,
}

impl FromStr for LayerHandling {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "shallow" => Ok(Self::Shallow),
            "eager" => Ok(Self::Eager),
            other => Err(SyncError::Config(format!(
                "unknown layer handling '{}' (supported: shallow, eager)",
                other
            ))),
        }
    }
}

impl std::fmt::Display for LayerHandling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shallow => write!(f, "shallow"),
            Self::Eager => write!(f, "eager"),
        }
    }
}

/// What a pull resolves: a pinned digest or a mutable tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullReference {
    Digest(String),
    Tag(String),
}

impl PullReference {
    /// `sha256:...` is a digest (validated), anything else is a tag.
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(SyncError::Config("empty pull reference".to_string()));
        }
        if reference.starts_with(SHA256_PREFIX) || reference.contains(':') {
            digest::validate(reference)?;
            return Ok(Self::Digest(reference.to_string()));
        }
        Ok(Self::Tag(reference.to_string()))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Digest(d) | Self::Tag(d) => d,
        }
    }
}

impl std::fmt::Display for PullReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Digest(d) => write!(f, "@{}", d),
            Self::Tag(t) => write!(f, ":{}", t),
        }
    }
}

fn default_concurrency() -> usize {
    10
}

/// Pull request document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    #[serde(default)]
    pub sources: Vec<Repository>,
    /// Tag or `sha256:` digest.
    pub reference: String,
    #[serde(default)]
    pub layer_handling: LayerHandling,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub airgapped: bool,
}

impl PullRequest {
    pub fn new(sources: Vec<Repository>, reference: impl Into<String>) -> Self {
        Self {
            sources,
            reference: reference.into(),
            layer_handling: LayerHandling::default(),
            concurrency: default_concurrency(),
            airgapped: false,
        }
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| SyncError::InvalidDocument(format!("pull request: {}", e)))
    }

    pub fn parsed_reference(&self) -> Result<PullReference> {
        PullReference::parse(&self.reference)
    }

    /// Effective concurrency (never zero).
    pub fn concurrency(&self) -> usize {
        self.concurrency.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::media_types;

    const D: &str = "sha256:3333333333333333333333333333333333333333333333333333333333333333";

    fn push_json(root_media_type: &str) -> String {
        format!(
            r#"{{
                "strategy": "cas_registry",
                "destination": {{"registry": "ghcr.io", "repository": "org/app", "tag": "v1", "tags": ["v1", "latest"]}},
                "blobs": [{{"mediaType": "{}", "digest": "{}", "size": 3}}]
            }}"#,
            root_media_type, D
        )
    }

    #[test]
    fn test_parse_push_request() {
        let req = PushRequest::from_slice(push_json(media_types::OCI_MANIFEST).as_bytes()).unwrap();
        assert_eq!(req.strategy, PushStrategy::CasRegistry);
        assert_eq!(req.root_kind(), Some(DocumentKind::Manifest));
        assert_eq!(req.destination.all_tags(), vec!["v1", "latest"]);
        assert_eq!(req.destination.repository().to_string(), "ghcr.io/org/app");
    }

    #[test]
    fn test_push_request_rejects_config_root() {
        let err = PushRequest::from_slice(push_json(media_types::OCI_CONFIG).as_bytes()).unwrap_err();
        assert!(matches!(err, SyncError::UnsupportedMediaType(_)));
    }

    #[test]
    fn test_push_request_rejects_empty_blobs() {
        let json = r#"{"destination": {"registry": "r", "repository": "x"}, "blobs": []}"#;
        assert!(matches!(
            PushRequest::from_slice(json.as_bytes()).unwrap_err(),
            SyncError::InvalidDocument(_)
        ));
    }

    #[test]
    fn test_push_target_legacy_alias() {
        let json = format!(
            r#"{{"push_target": {{"registry": "r.io", "repository": "x"}},
                "blobs": [{{"mediaType": "{}", "digest": "{}", "size": 3}}]}}"#,
            media_types::OCI_INDEX,
            D
        );
        let req = PushRequest::from_slice(json.as_bytes()).unwrap();
        assert_eq!(req.strategy, PushStrategy::Eager);
        assert!(req.destination.all_tags().is_empty());
    }

    #[test]
    fn test_pull_reference_parse() {
        assert_eq!(
            PullReference::parse("latest").unwrap(),
            PullReference::Tag("latest".to_string())
        );
        assert_eq!(
            PullReference::parse(D).unwrap(),
            PullReference::Digest(D.to_string())
        );
        assert!(matches!(
            PullReference::parse("sha512:abc").unwrap_err(),
            SyncError::UnsupportedDigestAlgorithm(_)
        ));
    }

    #[test]
    fn test_pull_request_defaults() {
        let req = PullRequest::from_slice(br#"{"reference": "latest"}"#).unwrap();
        assert_eq!(req.layer_handling, LayerHandling::Shallow);
        assert_eq!(req.concurrency, 10);
        assert!(!req.airgapped);
        assert!(req.sources.is_empty());
    }

    #[test]
    fn test_pull_request_camel_case() {
        let req = PullRequest::from_slice(
            br#"{"sources": [{"registry": "docker.io", "repository": "library/nginx"}],
                 "reference": "1.25", "layerHandling": "eager", "concurrency": 0, "airgapped": true}"#,
        )
        .unwrap();
        assert_eq!(req.layer_handling, LayerHandling::Eager);
        assert_eq!(req.concurrency(), 1);
        assert!(req.airgapped);
    }

    #[test]
    fn test_parse_source() {
        let src = Repository::parse_source("library/ubuntu@index.docker.io").unwrap();
        assert_eq!(src.registry, "index.docker.io");
        assert_eq!(src.repository, "library/ubuntu");
        assert!(Repository::parse_source("no-registry").is_err());
        assert!(Repository::parse_source("@reg").is_err());
    }

    #[test]
    fn test_layer_handling_from_str() {
        assert_eq!("eager".parse::<LayerHandling>().unwrap(), LayerHandling::Eager);
        assert!("lazy".parse::<LayerHandling>().is_err());
    }
}
