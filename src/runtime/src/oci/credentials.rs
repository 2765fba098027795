//! Registry credential file.
//!
//! Credentials live at `~/.imgsync/auth/credentials.json`, one entry per
//! registry host. Docker Hub aliases share a single entry. Writes go to a
//! temporary file that is then renamed over the original.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use imgsync_core::config::default_home;
use imgsync_core::error::{Result, SyncError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Credential {
    username: String,
    password: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialFile {
    #[serde(default)]
    registries: BTreeMap<String, Credential>,
}

/// Per-registry username/password store.
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// The store under the imgsync home directory.
    pub fn default_path() -> Self {
        Self::new(default_home().join("auth").join("credentials.json"))
    }

    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Save credentials for `registry`, replacing any previous entry.
    pub fn store(&self, registry: &str, username: &str, password: &str) -> Result<()> {
        let mut file = self.read()?;
        file.registries.insert(
            registry_key(registry),
            Credential {
                username: username.to_string(),
                password: password.to_string(),
            },
        );
        self.write(&file)
    }

    /// `(username, password)` for `registry`, if stored.
    pub fn get(&self, registry: &str) -> Result<Option<(String, String)>> {
        Ok(self
            .read()?
            .registries
            .remove(&registry_key(registry))
            .map(|c| (c.username, c.password)))
    }

    /// Forget `registry`. Returns whether an entry existed.
    pub fn remove(&self, registry: &str) -> Result<bool> {
        let mut file = self.read()?;
        if file.registries.remove(&registry_key(registry)).is_none() {
            return Ok(false);
        }
        self.write(&file)?;
        Ok(true)
    }

    /// Registries with stored credentials, sorted.
    pub fn list_registries(&self) -> Result<Vec<String>> {
        Ok(self.read()?.registries.into_keys().collect())
    }

    fn read(&self) -> Result<CredentialFile> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CredentialFile::default())
            }
            Err(e) => {
                return Err(SyncError::Config(format!(
                    "Failed to read credential store {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };
        serde_json::from_slice(&data).map_err(|e| {
            SyncError::Config(format!(
                "Failed to parse credential store {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    fn write(&self, file: &CredentialFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(file)?)?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            SyncError::Config(format!(
                "Failed to replace credential store {}: {}",
                self.path.display(),
                e
            ))
        })
    }
}

/// Lowercased host; every Docker Hub alias maps to `index.docker.io`.
fn registry_key(registry: &str) -> String {
    match registry.trim().to_lowercase().as_str() {
        "docker.io" | "registry-1.docker.io" | "index.docker.io" => "index.docker.io".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store(dir: &TempDir) -> CredentialStore {
        CredentialStore::new(dir.path().join("auth").join("credentials.json"))
    }

    #[test]
    fn test_store_and_get() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        store.store("ghcr.io", "user1", "pass1").unwrap();
        assert_eq!(
            store.get("ghcr.io").unwrap(),
            Some(("user1".to_string(), "pass1".to_string()))
        );
        assert_eq!(store.get("quay.io").unwrap(), None);
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        store.store("ghcr.io", "u", "p").unwrap();
        assert!(store.remove("ghcr.io").unwrap());
        assert!(!store.remove("ghcr.io").unwrap());
        assert_eq!(store.get("ghcr.io").unwrap(), None);
    }

    #[test]
    fn test_list_sorted() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        assert!(store.list_registries().unwrap().is_empty());

        store.store("quay.io", "u2", "p2").unwrap();
        store.store("GHCR.io", "u1", "p1").unwrap();
        assert_eq!(store.list_registries().unwrap(), vec!["ghcr.io", "quay.io"]);
    }

    #[test]
    fn test_docker_hub_aliases_share_entry() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        store.store("docker.io", "user", "pass").unwrap();
        for alias in ["index.docker.io", "registry-1.docker.io", " Docker.io "] {
            assert_eq!(
                store.get(alias).unwrap(),
                Some(("user".to_string(), "pass".to_string()))
            );
        }
    }

    #[test]
    fn test_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        test_store(&dir).store("ghcr.io", "user", "pass").unwrap();
        assert!(test_store(&dir).get("ghcr.io").unwrap().is_some());
        assert!(!dir.path().join("auth").join("credentials.tmp").exists());
    }

    #[test]
    fn test_corrupt_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        std::fs::create_dir_all(dir.path().join("auth")).unwrap();
        std::fs::write(store.path(), b"{not json").unwrap();
        assert!(matches!(
            store.get("ghcr.io").unwrap_err(),
            SyncError::Config(_)
        ));
    }
}
