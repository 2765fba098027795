//! Image name parsing for the command line.
//!
//! Turns `nginx:1.25`, `ghcr.io/org/app@sha256:...` and friends into a
//! pull source plus an optional tag or digest.

use imgsync_core::error::{Result, SyncError};
use imgsync_core::request::{PullReference, Repository, DEFAULT_REGISTRY};

/// A parsed image name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageName {
    /// Registry and repository.
    pub source: Repository,
    /// Tag or digest, if the name carried one.
    pub reference: Option<PullReference>,
}

impl ImageName {
    /// Parse an image name.
    ///
    /// - `nginx` → docker.io/library/nginx
    /// - `nginx:1.25` → docker.io/library/nginx, tag 1.25
    /// - `myuser/app` → docker.io/myuser/app
    /// - `localhost:5000/app:dev` → localhost:5000/app, tag dev
    /// - `ghcr.io/org/app@sha256:...` → ghcr.io/org/app, digest
    pub fn parse(name: &str) -> Result<Self> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SyncError::Config("empty image name".to_string()));
        }

        let (path, reference) = match name.rsplit_once('@') {
            Some((path, digest)) => (path, Some(PullReference::parse(digest)?)),
            None => match split_tag(name) {
                (path, Some(tag)) => (path, Some(PullReference::Tag(tag.to_string()))),
                (path, None) => (path, None),
            },
        };
        // A tag next to a digest is informational only.
        let path = match (reference.as_ref(), split_tag(path)) {
            (Some(PullReference::Digest(_)), (bare, Some(_))) => bare,
            _ => path,
        };

        Ok(Self {
            source: split_registry(path)?,
            reference,
        })
    }
}

impl std::fmt::Display for ImageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.reference {
            Some(r) => write!(f, "{}{}", self.source, r),
            None => write!(f, "{}", self.source),
        }
    }
}

/// Split `path:tag`, ignoring a colon that belongs to a `host:port` prefix.
fn split_tag(path: &str) -> (&str, Option<&str>) {
    let last_segment_start = path.rfind('/').map(|i| i + 1).unwrap_or(0);
    match path[last_segment_start..].rfind(':') {
        Some(i) => {
            let colon = last_segment_start + i;
            let tag = &path[colon + 1..];
            if last_segment_start == 0 && tag.chars().all(|c| c.is_ascii_digit()) {
                // Bare `host:port`
                (path, None)
            } else {
                (&path[..colon], Some(tag))
            }
        }
        None => (path, None),
    }
}

fn split_registry(path: &str) -> Result<Repository> {
    if let Some((first, rest)) = path.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            if rest.is_empty() {
                return Err(SyncError::Config(format!(
                    "empty repository in image name '{}'",
                    path
                )));
            }
            return Ok(Repository::new(first, rest));
        }
        return Ok(Repository::new(DEFAULT_REGISTRY, path));
    }
    Ok(Repository::new(DEFAULT_REGISTRY, format!("library/{}", path)))
}
