use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, SyncError};
use crate::request::LayerHandling;

/// 1 MiB
pub const MIB: u64 = 1024 * 1024;

/// imgsync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Root directory of the local content-addressable store
    pub cas_dir: PathBuf,

    /// Push engine settings
    pub push: PushConfig,

    /// Pull engine settings
    pub pull: PullConfig,

    /// Largest blob kept in the small-object cache
    pub small_cache_limit: u64,

    /// Registries reached over plain HTTP
    pub insecure_registries: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cas_dir: default_home().join("cas"),
            push: PushConfig::default(),
            pull: PullConfig::default(),
            small_cache_limit: MIB,
            insecure_registries: Vec::new(),
        }
    }
}

/// Push engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    /// Number of upload workers
    pub workers: usize,

    /// Blobs at or above this size are streamed from the CAS
    pub stream_threshold: u64,

    /// Longest wait for a free queue slot before failing with QueueFull
    pub queue_wait_secs: u64,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            stream_threshold: MIB,
            queue_wait_secs: 600,
        }
    }
}

/// Pull engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PullConfig {
    /// Default download concurrency
    pub concurrency: usize,

    /// Default layer handling
    pub layer_handling: LayerHandling,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            layer_handling: LayerHandling::Shallow,
        }
    }
}

impl SyncConfig {
    /// Load configuration from a YAML or JSON file (chosen by extension).
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;

        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&data)?,
            _ => serde_yaml::from_str(&data)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if given, otherwise defaults; then apply environment overrides.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let base = match path {
            Some(p) => Self::load(p)?,
            None => Self::default(),
        };
        let config = base.with_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `IMGSYNC_*` overrides read through `lookup`.
    pub fn with_env<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("IMGSYNC_CAS_DIR") {
            self.cas_dir = PathBuf::from(dir);
        }
        if let Some(v) = lookup("IMGSYNC_PUSH_WORKERS") {
            self.push.workers = parse_env("IMGSYNC_PUSH_WORKERS", &v)?;
        }
        if let Some(v) = lookup("IMGSYNC_STREAM_THRESHOLD") {
            self.push.stream_threshold = parse_env("IMGSYNC_STREAM_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("IMGSYNC_PULL_CONCURRENCY") {
            self.pull.concurrency = parse_env("IMGSYNC_PULL_CONCURRENCY", &v)?;
        }
        Ok(self)
    }

    /// Reject settings the engines cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.push.workers == 0 {
            return Err(SyncError::Config("push.workers must be at least 1".to_string()));
        }
        if self.pull.concurrency == 0 {
            return Err(SyncError::Config(
                "pull.concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| SyncError::Config(format!("{} has an invalid value '{}'", key, value)))
}

/// `~/.imgsync`, or `.imgsync` when no home directory is known.
pub fn default_home() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".imgsync"))
        .unwrap_or_else(|| PathBuf::from(".imgsync"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.push.workers, 4);
        assert_eq!(config.push.stream_threshold, MIB);
        assert_eq!(config.pull.concurrency, 10);
        assert_eq!(config.pull.layer_handling, LayerHandling::Shallow);
        assert!(config.cas_dir.ends_with("cas"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_yaml_partial() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("imgsync.yaml");
        std::fs::write(&path, "push:\n  workers: 8\npull:\n  layer_handling: eager\n").unwrap();

        let config = SyncConfig::load(&path).unwrap();
        assert_eq!(config.push.workers, 8);
        assert_eq!(config.push.stream_threshold, MIB);
        assert_eq!(config.pull.layer_handling, LayerHandling::Eager);
    }

    #[test]
    fn test_load_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("imgsync.json");
        std::fs::write(&path, r#"{"cas_dir": "/tmp/cas", "small_cache_limit": 42}"#).unwrap();

        let config = SyncConfig::load(&path).unwrap();
        assert_eq!(config.cas_dir, PathBuf::from("/tmp/cas"));
        assert_eq!(config.small_cache_limit, 42);
    }

    #[test]
    fn test_load_rejects_zero_workers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("imgsync.yaml");
        std::fs::write(&path, "push:\n  workers: 0\n").unwrap();
        assert!(matches!(
            SyncConfig::load(&path).unwrap_err(),
            SyncError::Config(_)
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("IMGSYNC_CAS_DIR", "/data/cas"),
            ("IMGSYNC_PUSH_WORKERS", "16"),
            ("IMGSYNC_PULL_CONCURRENCY", "3"),
        ]
        .into_iter()
        .collect();

        let config = SyncConfig::default()
            .with_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.cas_dir, PathBuf::from("/data/cas"));
        assert_eq!(config.push.workers, 16);
        assert_eq!(config.pull.concurrency, 3);
    }

    #[test]
    fn test_env_override_invalid() {
        let err = SyncConfig::default()
            .with_env(|k| (k == "IMGSYNC_PUSH_WORKERS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("IMGSYNC_PUSH_WORKERS"));
    }
}
