use thiserror::Error;

/// imgsync error types
#[derive(Error, Debug)]
pub enum SyncError {
    /// Fetched content does not hash to the digest it was requested by
    #[error("Integrity error: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    /// Every candidate source failed
    #[error("All {attempts} source(s) failed for {what}; last error from {last_source}: {last_error}")]
    SourcesExhausted {
        what: String,
        attempts: usize,
        last_source: String,
        last_error: String,
    },

    /// Digest uses an algorithm other than sha256
    #[error("Unsupported digest algorithm in '{0}' (only sha256 is supported)")]
    UnsupportedDigestAlgorithm(String),

    /// Digest string is not `sha256:<64 lowercase hex>`
    #[error("Invalid digest '{digest}': {reason}")]
    InvalidDigest { digest: String, reason: String },

    /// A blob could not be written to its destination
    #[error("Upload of {digest} to {destination} failed: {message}")]
    UploadFailure {
        digest: String,
        destination: String,
        message: String,
    },

    /// The operation was cancelled or its deadline expired
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// The bounded job queue had no free slot in time
    #[error("Work queue is full: {0}")]
    QueueFull(String),

    /// The worker pool was stopped before the job ran
    #[error("Worker pool is shut down")]
    PoolShutdown,

    /// Airgapped mode refused a request that would need the network
    #[error("Airgapped: {0}")]
    Airgapped(String),

    /// Container registry error
    #[error("Registry error: {registry} - {message}")]
    Registry { registry: String, message: String },

    /// Local content-addressable store error
    #[error("CAS error: {digest} - {message}")]
    Cas { digest: String, message: String },

    /// Root or child document has a media type the engines cannot dispatch
    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// A manifest, index or request document could not be interpreted
    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl SyncError {
    /// Whether this error reports cancellation rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, SyncError::Cancelled(_))
    }

    /// Wrap an upload error with its destination context.
    ///
    /// Cancellation and a full upload queue pass through unchanged so callers
    /// can still tell them apart.
    pub fn upload(digest: &str, destination: &str, err: SyncError) -> Self {
        match err {
            SyncError::Cancelled(_)
            | SyncError::QueueFull(_)
            | SyncError::UploadFailure { .. } => err,
            other => SyncError::UploadFailure {
                digest: digest.to_string(),
                destination: destination.to_string(),
                message: other.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for SyncError {
    fn from(err: serde_yaml::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

/// Result type alias for imgsync operations
pub type Result<T> = std::result::Result<T, SyncError>;
