//! Caching layers shared by the engines.
//!
//! - `SmallBlobCache`: verified manifests, configs and other small blobs kept in memory

pub mod small_blob;

pub use small_blob::{SmallBlobCache, DEFAULT_SMALL_BLOB_LIMIT};
