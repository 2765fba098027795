//! Content digests.
//!
//! A [`Digest`] is the identity of a blob: a SHA-256 hash plus the blob size.
//! The canonical text form is `sha256:<64 lowercase hex>`; anything else is
//! rejected here, before any I/O is attempted.

use std::fmt;

use sha2::{Digest as _, Sha256};

use crate::error::{Result, SyncError};

/// The only supported digest algorithm.
pub const SHA256: &str = "sha256";

/// Prefix of every canonical digest string.
pub const SHA256_PREFIX: &str = "sha256:";

const HEX_LEN: usize = 64;

/// SHA-256 content hash plus size. Two digests are equal iff both match.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest {
    hash: [u8; 32],
    size: i64,
}

impl Digest {
    /// Create a digest from raw hash bytes and a size.
    pub fn new(hash: [u8; 32], size: i64) -> Self {
        Self { hash, size }
    }

    /// Parse a canonical `sha256:<hex>` string, attaching the known blob size.
    pub fn parse(digest: &str, size: i64) -> Result<Self> {
        Ok(Self {
            hash: parse_hash(digest)?,
            size,
        })
    }

    /// Compute the digest of an in-memory buffer.
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = DigestHasher::new();
        hasher.update(data);
        hasher.finalize()
    }

    /// Raw hash bytes.
    pub fn hash(&self) -> &[u8; 32] {
        &self.hash
    }

    /// Blob size in bytes.
    pub fn size(&self) -> i64 {
        self.size
    }

    /// Lowercase hex of the hash, without the algorithm prefix.
    pub fn hex(&self) -> String {
        hex::encode(self.hash)
    }

    /// Algorithm name. Always `sha256`.
    pub fn algorithm(&self) -> &'static str {
        SHA256
    }

    /// Whether `other` names the same content, ignoring an unknown (negative) size.
    pub fn same_content(&self, other: &Digest) -> bool {
        self.hash == other.hash && (self.size < 0 || other.size < 0 || self.size == other.size)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", SHA256_PREFIX, self.hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({}:{}, {})", SHA256, &self.hex()[..12], self.size)
    }
}

/// Validate a canonical digest string and return its hash bytes.
pub fn parse_hash(digest: &str) -> Result<[u8; 32]> {
    let hex_part = match digest.split_once(':') {
        Some((SHA256, hex_part)) => hex_part,
        Some(_) => return Err(SyncError::UnsupportedDigestAlgorithm(digest.to_string())),
        None => {
            return Err(SyncError::InvalidDigest {
                digest: digest.to_string(),
                reason: "expected algorithm:hex".to_string(),
            })
        }
    };

    if hex_part.len() != HEX_LEN {
        return Err(SyncError::InvalidDigest {
            digest: digest.to_string(),
            reason: format!("expected {} hex characters, got {}", HEX_LEN, hex_part.len()),
        });
    }
    if !hex_part
        .bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return Err(SyncError::InvalidDigest {
            digest: digest.to_string(),
            reason: "hash must be lowercase hex".to_string(),
        });
    }

    let mut hash = [0u8; 32];
    hex::decode_to_slice(hex_part, &mut hash).map_err(|e| SyncError::InvalidDigest {
        digest: digest.to_string(),
        reason: e.to_string(),
    })?;
    Ok(hash)
}

/// Check that `digest` is canonical without keeping the parsed value.
pub fn validate(digest: &str) -> Result<()> {
    parse_hash(digest).map(|_| ())
}

/// Incremental SHA-256 hasher that also counts bytes.
pub struct DigestHasher {
    inner: Sha256,
    size: i64,
}

impl DigestHasher {
    pub fn new() -> Self {
        Self {
            inner: Sha256::new(),
            size: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.size += data.len() as i64;
    }

    pub fn finalize(self) -> Digest {
        Digest {
            hash: self.inner.finalize().into(),
            size: self.size,
        }
    }
}

impl Default for DigestHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Verify `data` hashes to `expected`, returning the computed digest.
pub fn verify(expected: &str, data: &[u8]) -> Result<Digest> {
    let wanted = Digest::parse(expected, data.len() as i64)?;
    let actual = Digest::of(data);
    if actual.hash != wanted.hash {
        return Err(SyncError::Integrity {
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(actual)
}
