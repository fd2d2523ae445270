//! Key/value JSON persistence under the node's data directory.
//!
//! Each key maps to `<data_dir>/<key>.json`. Writes go to a temporary file
//! next to the target which is then renamed over it, so a reader sees either
//! the old or the new document.

use peerswitch_types::error::{PeerSwitchError, PeerSwitchResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// Registered handoff targets.
pub const HOSTS_KEY: &str = "hosts";
/// Device addresses seen at the last handoff.
pub const LAST_KNOWN_ADDRESSES_KEY: &str = "peripherals.last-known-addresses";

/// JSON documents stored by key.
#[derive(Debug, Clone)]
pub struct JsonStore {
    dir: PathBuf,
}

impl JsonStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// Load the document under `key`, or `default` when it is missing or
    /// unreadable.
    pub async fn load_or_default<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        let path = self.path_for(key);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return default,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read stored document");
                return default;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Stored document is corrupt, using default");
                default
            }
        }
    }

    /// Persist `value` under `key`.
    pub async fn save<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> PeerSwitchResult<()> {
        let json = serde_json::to_vec_pretty(value)?;
        fs::create_dir_all(&self.dir).await.map_err(|e| {
            PeerSwitchError::Persistence(format!("create {} failed: {e}", self.dir.display()))
        })?;

        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &json).await.map_err(|e| {
            PeerSwitchError::Persistence(format!("write {} failed: {e}", tmp.display()))
        })?;
        fs::rename(&tmp, &path).await.map_err(|e| {
            PeerSwitchError::Persistence(format!(
                "rename {} -> {} failed: {e}",
                tmp.display(),
                path.display()
            ))
        })?;
        debug!(key, path = %path.display(), "Saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_key_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        let v: Vec<String> = store.load_or_default(LAST_KNOWN_ADDRESSES_KEY, Vec::new()).await;
        assert!(v.is_empty());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path().join("nested"));
        let addrs = vec!["aa-bb".to_string(), "cc-dd".to_string()];
        store.save(LAST_KNOWN_ADDRESSES_KEY, &addrs).await.unwrap();

        assert!(dir
            .path()
            .join("nested/peripherals.last-known-addresses.json")
            .exists());
        assert!(!dir
            .path()
            .join("nested/peripherals.last-known-addresses.json.tmp")
            .exists());
        let back: Vec<String> = store.load_or_default(LAST_KNOWN_ADDRESSES_KEY, Vec::new()).await;
        assert_eq!(back, addrs);
    }

    #[tokio::test]
    async fn test_corrupt_document_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hosts.json"), b"{not json").unwrap();
        let store = JsonStore::new(dir.path());
        let v: Vec<u32> = store.load_or_default(HOSTS_KEY, vec![7]).await;
        assert_eq!(v, vec![7]);
    }
}
