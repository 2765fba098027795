//! imgsync Core - Blob Identity and Request Types
//!
//! This module provides the data model shared by the push and pull engines:
//! digests, descriptors, manifest/index documents, request documents,
//! reference-graph facts, configuration and the error type.

pub mod config;
pub mod descriptor;
pub mod digest;
pub mod error;
pub mod refgraph;
pub mod request;

// Re-export commonly used types
pub use config::{PullConfig, PushConfig, SyncConfig};
pub use descriptor::{media_types, Descriptor, DocumentKind, ImageIndex, ImageManifest};
pub use digest::{Digest, DigestHasher};
pub use error::{Result, SyncError};
pub use refgraph::{Facts, ImageInfo, RefGraphEntry};
pub use request::{
    LayerHandling, PullReference, PullRequest, PushRequest, PushStrategy, PushTarget, Repository,
};

/// imgsync version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
