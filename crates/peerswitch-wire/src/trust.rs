//! Trust-on-first-use certificate store.
//!
//! The [`TrustStore`] remembers SHA-256 fingerprints of peer certificates.
//! The first certificate presented by an unknown peer is accepted and
//! recorded; later presentations of the same certificate are accepted from
//! memory. Acceptance checks membership in the whole fingerprint set, not a
//! per-peer binding.
//!
//! The map is reached both from rustls verifier callbacks (synchronous) and
//! from async callers, so it sits behind a plain mutex that is only held
//! around in-memory work. Disk writes run afterwards on a snapshot.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// File name of the persisted store inside the data directory.
pub const TRUST_STORE_FILE: &str = "trusted-peers.json";

/// Canonical fingerprint of a DER certificate: SHA-256, lower-hex bytes
/// joined by colons.
pub fn fingerprint(der: &[u8]) -> String {
    Sha256::digest(der)
        .iter()
        .map(|b| hex::encode([*b]))
        .collect::<Vec<_>>()
        .join(":")
}

struct TrustInner {
    path: PathBuf,
    /// Local record id -> fingerprint.
    records: Mutex<BTreeMap<String, String>>,
    /// Serialises disk writes so the newest snapshot always lands last.
    io_lock: Mutex<()>,
}

/// Shared handle to the fingerprint store. Cloning is cheap.
#[derive(Clone)]
pub struct TrustStore {
    inner: Arc<TrustInner>,
}

impl std::fmt::Debug for TrustStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustStore")
            .field("path", &self.inner.path)
            .field("records", &self.len())
            .finish()
    }
}

impl TrustStore {
    /// Open the store at `path`.
    ///
    /// A missing or unreadable file yields an empty store; this never fails.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<BTreeMap<String, String>>(&bytes) {
                Ok(map) => {
                    debug!(path = %path.display(), count = map.len(), "Loaded trust store");
                    map
                }
                Err(e) => {
                    warn!(error = %e, path = %path.display(), "Corrupt trust store, starting empty");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                warn!(error = %e, path = %path.display(), "Failed to read trust store, starting empty");
                BTreeMap::new()
            }
        };

        Self {
            inner: Arc::new(TrustInner {
                path,
                records: Mutex::new(records),
                io_lock: Mutex::new(()),
            }),
        }
    }

    /// Open `trusted-peers.json` inside `dir`.
    pub fn open_in(dir: &Path) -> Self {
        Self::open(dir.join(TRUST_STORE_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Verify a DER certificate, trusting it on first use.
    ///
    /// Returns `false` only for an empty certificate. A new fingerprint is
    /// recorded under a fresh local id and persisted in the background.
    pub fn verify_certificate(&self, der: &[u8]) -> bool {
        if der.is_empty() {
            warn!("Peer presented no certificate");
            return false;
        }
        let fp = fingerprint(der);

        {
            let mut records = self.inner.records.lock().unwrap_or_else(|e| e.into_inner());
            if records.values().any(|known| *known == fp) {
                return true;
            }
            records.insert(uuid::Uuid::new_v4().to_string(), fp.clone());
        }

        info!(fingerprint = %fp, "Trusting new peer certificate on first use");
        self.persist_in_background();
        true
    }

    /// Whether a fingerprint is already trusted.
    pub fn is_trusted(&self, fingerprint: &str) -> bool {
        let records = self.inner.records.lock().unwrap_or_else(|e| e.into_inner());
        records.values().any(|known| known == fingerprint)
    }

    /// Record a fingerprint under an explicit id (replaces any previous one).
    pub fn add_trusted(&self, id: impl Into<String>, fingerprint: impl Into<String>) {
        {
            let mut records = self.inner.records.lock().unwrap_or_else(|e| e.into_inner());
            records.insert(id.into(), fingerprint.into());
        }
        self.persist_in_background();
    }

    /// Forget a record. Returns the removed fingerprint.
    pub fn remove_trusted(&self, id: &str) -> Option<String> {
        let removed = {
            let mut records = self.inner.records.lock().unwrap_or_else(|e| e.into_inner());
            records.remove(id)
        };
        if removed.is_some() {
            self.persist_in_background();
        }
        removed
    }

    /// Snapshot of all `(id, fingerprint)` records, ordered by id.
    pub fn records(&self) -> Vec<(String, String)> {
        let records = self.inner.records.lock().unwrap_or_else(|e| e.into_inner());
        records.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the current snapshot to disk and wait for it.
    pub fn flush(&self) -> std::io::Result<()> {
        self.inner.write_snapshot()
    }

    fn persist_in_background(&self) {
        let inner = Arc::clone(&self.inner);
        let job = move || {
            if let Err(e) = inner.write_snapshot() {
                warn!(error = %e, path = %inner.path.display(), "Failed to persist trust store");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(job);
            }
            Err(_) => {
                std::thread::spawn(job);
            }
        }
    }
}

impl TrustInner {
    fn write_snapshot(&self) -> std::io::Result<()> {
        let _io = self.io_lock.lock().unwrap_or_else(|e| e.into_inner());
        // Snapshot taken under the io lock so the last writer sees the newest state.
        let snapshot = self
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let json = serde_json::to_vec_pretty(&snapshot).map_err(std::io::Error::other)?;
        write_atomic(&self.path, &json)
    }
}

/// Write `bytes` to a sibling temp file, then rename it over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_format() {
        let fp = fingerprint(b"certificate");
        let parts: Vec<&str> = fp.split(':').collect();
        assert_eq!(parts.len(), 32);
        assert!(parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())));
        assert_eq!(fp, fingerprint(b"certificate"));
        assert_ne!(fp, fingerprint(b"other"));
    }

    #[test]
    fn test_fingerprint_matches_known_digest() {
        // SHA-256 of the empty input.
        assert_eq!(
            fingerprint(b""),
            "e3:b0:c4:42:98:fc:1c:14:9a:fb:f4:c8:99:6f:b9:24:\
             27:ae:41:e4:64:9b:93:4c:a4:95:99:1b:78:52:b8:55"
        );
        let joined: String = fingerprint(b"").split(':').collect();
        assert_eq!(joined, hex::encode(Sha256::digest(b"")));
    }

    #[tokio::test]
    async fn test_tofu_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::open_in(dir.path());
        assert!(store.is_empty());

        assert!(store.verify_certificate(b"peer-cert"));
        assert_eq!(store.len(), 1);
        assert!(store.is_trusted(&fingerprint(b"peer-cert")));

        // Second presentation hits the known set, no new record.
        assert!(store.verify_certificate(b"peer-cert"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_empty_certificate_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::open_in(dir.path());
        assert!(!store.verify_certificate(b""));
        assert!(store.is_empty());
    }

    #[test]
    fn test_missing_and_corrupt_files_start_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = TrustStore::open(dir.path().join("nope.json"));
        assert!(missing.is_empty());

        let path = dir.path().join(TRUST_STORE_FILE);
        std::fs::write(&path, b"{not json").unwrap();
        let corrupt = TrustStore::open(&path);
        assert!(corrupt.is_empty());
    }

    #[test]
    fn test_flush_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::open_in(dir.path());
        store.add_trusted("record-1", "aa:bb");
        store.flush().unwrap();

        let reopened = TrustStore::open_in(dir.path());
        assert_eq!(
            reopened.records(),
            vec![("record-1".to_string(), "aa:bb".to_string())]
        );
        assert!(!dir.path().join("trusted-peers.json.tmp").exists());
    }

    #[test]
    fn test_remove_trusted() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::open_in(dir.path());
        store.add_trusted("a", "11:22");
        store.add_trusted("b", "33:44");
        assert_eq!(store.remove_trusted("a").as_deref(), Some("11:22"));
        assert!(store.remove_trusted("a").is_none());
        assert!(!store.is_trusted("11:22"));
        assert!(store.is_trusted("33:44"));
    }

    #[tokio::test]
    async fn test_background_persist_reaches_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::open_in(dir.path());
        store.verify_certificate(b"first-sight");

        let path = dir.path().join(TRUST_STORE_FILE);
        for _ in 0..50 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let reopened = TrustStore::open(&path);
        assert!(reopened.is_trusted(&fingerprint(b"first-sight")));
    }
}
