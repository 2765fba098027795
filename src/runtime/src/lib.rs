//! imgsync runtime: the push and pull engines.
//!
//! Moves content-addressed blobs between a local CAS and OCI registries.
//! [`PushEngine`] uploads manifest and index graphs with per-destination
//! dedup and blob-before-document ordering; [`PullEngine`] resolves
//! references against mirrored sources and materializes them locally.

#![allow(clippy::result_large_err)]

pub mod cache;
pub mod cas;
pub mod oci;
pub mod pool;
pub mod pull;
pub mod push;
pub mod refgraph;

// Re-export common types
pub use cache::SmallBlobCache;
pub use cas::{BlobReader, Cas, DiskCas};
pub use oci::{
    BlobPayload, BlobPut, CachedBlobTransport, CredentialStore, FetchedManifest, ImageName,
    ManifestRef, OciTransport, RegistryAuth, RegistryTransport,
};
pub use pool::{JobHandle, WorkerPool};
pub use pull::{PullEngine, PullOutcome};
pub use push::{PushEngine, SizeThreshold, TransferMode, TransferPolicy, UploadKey};
pub use refgraph::RefGraphSyncer;

/// imgsync runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
