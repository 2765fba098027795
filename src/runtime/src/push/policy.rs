//! How a blob's bytes reach the registry.

use imgsync_core::descriptor::Descriptor;

/// Where upload bytes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Stream straight from a CAS reader.
    Stream,
    /// Serve from the small-object cache.
    Cached,
}

/// Chooses a [`TransferMode`] per blob.
pub trait TransferPolicy: Send + Sync {
    fn mode(&self, blob: &Descriptor) -> TransferMode;
}

/// Streams blobs at or above `threshold` bytes, caches the rest.
#[derive(Debug, Clone, Copy)]
pub struct SizeThreshold {
    pub threshold: u64,
}

impl SizeThreshold {
    pub fn new(threshold: u64) -> Self {
        Self { threshold }
    }
}

impl Default for SizeThreshold {
    fn default() -> Self {
        Self::new(1024 * 1024)
    }
}

impl TransferPolicy for SizeThreshold {
    fn mode(&self, blob: &Descriptor) -> TransferMode {
        // Unknown (negative) sizes are treated as large.
        if blob.size < 0 || blob.size as u64 >= self.threshold {
            TransferMode::Stream
        } else {
            TransferMode::Cached
        }
    }
}

/// Always the same mode, whatever the size.
#[derive(Debug, Clone, Copy)]
pub struct Fixed(pub TransferMode);

impl TransferPolicy for Fixed {
    fn mode(&self, _blob: &Descriptor) -> TransferMode {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(size: i64) -> Descriptor {
        Descriptor::new("application/octet-stream", "sha256:x", size)
    }

    #[test]
    fn test_threshold_boundary() {
        let policy = SizeThreshold::new(100);
        assert_eq!(policy.mode(&blob(99)), TransferMode::Cached);
        assert_eq!(policy.mode(&blob(100)), TransferMode::Stream);
        assert_eq!(policy.mode(&blob(-1)), TransferMode::Stream);
    }

    #[test]
    fn test_default_is_one_mib() {
        let policy = SizeThreshold::default();
        assert_eq!(policy.mode(&blob(1024 * 1024 - 1)), TransferMode::Cached);
        assert_eq!(policy.mode(&blob(1024 * 1024)), TransferMode::Stream);
    }

    #[test]
    fn test_fixed() {
        assert_eq!(Fixed(TransferMode::Stream).mode(&blob(1)), TransferMode::Stream);
    }
}
