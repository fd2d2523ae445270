//! Registered hosts: the machines the user can hand devices off to.
//!
//! Hosts are persisted under the `hosts` key. Their online flag is never
//! stored; [`HostDirectory::refresh`] recomputes it from the live peer table.

use crate::store::{JsonStore, HOSTS_KEY};
use chrono::Utc;
use peerswitch_types::error::{PeerSwitchError, PeerSwitchResult};
use peerswitch_types::host::RegisteredHost;
use peerswitch_types::peer::PeerInfo;
use tracing::info;
use uuid::Uuid;

/// Persisted list of handoff targets.
pub struct HostDirectory {
    store: JsonStore,
    max_hosts: usize,
    /// Serializes read-modify-write cycles.
    lock: tokio::sync::Mutex<()>,
}

impl HostDirectory {
    pub fn new(store: JsonStore, max_hosts: usize) -> Self {
        Self {
            store,
            max_hosts,
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn list(&self) -> Vec<RegisteredHost> {
        self.store.load_or_default(HOSTS_KEY, Vec::new()).await
    }

    /// Find a host by label, host name, bound identifier or id.
    pub async fn find(&self, needle: &str) -> Option<RegisteredHost> {
        self.list().await.into_iter().find(|h| h.matches(needle))
    }

    /// Register a new host.
    pub async fn add(&self, label: &str, host_name: &str) -> PeerSwitchResult<RegisteredHost> {
        self.insert(RegisteredHost::new(label.trim(), host_name.trim()))
            .await
    }

    /// Register a discovered peer, binding its identifier when resolved.
    pub async fn add_from_peer(&self, peer: &PeerInfo) -> PeerSwitchResult<RegisteredHost> {
        let mut host = RegisteredHost::new(peer.host_name.trim(), peer.host_name.trim());
        if peer.host_id_resolved {
            host.peer_host_id = Some(peer.host_id.clone());
        }
        self.insert(host).await
    }

    async fn insert(&self, host: RegisteredHost) -> PeerSwitchResult<RegisteredHost> {
        if host.label.is_empty() {
            return Err(PeerSwitchError::Config("host label must not be empty".into()));
        }
        let _guard = self.lock.lock().await;
        let mut hosts = self.list().await;
        if hosts.iter().any(|h| h.label == host.label) {
            return Err(PeerSwitchError::Config(format!(
                "a host labelled '{}' is already registered",
                host.label
            )));
        }
        if hosts.len() >= self.max_hosts {
            return Err(PeerSwitchError::MaxHostsReached {
                max: self.max_hosts,
            });
        }
        hosts.push(host.clone());
        self.store.save(HOSTS_KEY, &hosts).await?;
        info!(label = %host.label, host_name = %host.host_name, "Host registered");
        Ok(host)
    }

    /// Remove the host matching `needle`.
    pub async fn remove(&self, needle: &str) -> PeerSwitchResult<RegisteredHost> {
        let _guard = self.lock.lock().await;
        let mut hosts = self.list().await;
        let index = hosts
            .iter()
            .position(|h| h.matches(needle))
            .ok_or_else(|| PeerSwitchError::HostNotFound(needle.to_string()))?;
        let removed = hosts.remove(index);
        self.store.save(HOSTS_KEY, &hosts).await?;
        info!(label = %removed.label, "Host removed");
        Ok(removed)
    }

    /// Bind a host to a stable peer identifier.
    pub async fn bind_peer(&self, id: Uuid, peer_host_id: &str) -> PeerSwitchResult<RegisteredHost> {
        let _guard = self.lock.lock().await;
        let mut hosts = self.list().await;
        let host = hosts
            .iter_mut()
            .find(|h| h.id == id)
            .ok_or_else(|| PeerSwitchError::HostNotFound(id.to_string()))?;
        host.peer_host_id = Some(peer_host_id.to_string());
        let bound = host.clone();
        self.store.save(HOSTS_KEY, &hosts).await?;
        Ok(bound)
    }

    /// Recompute online flags from the live peer table.
    ///
    /// A host is matched by its bound identifier first, then by host name.
    /// A host-name match on a resolved peer under a different identifier
    /// rebinds the host to that identifier. Changes are persisted.
    pub async fn refresh(&self, peers: &[PeerInfo]) -> PeerSwitchResult<Vec<RegisteredHost>> {
        let _guard = self.lock.lock().await;
        let mut hosts = self.list().await;
        let now = Utc::now();
        let mut changed = false;

        for host in hosts.iter_mut() {
            let by_id = host
                .peer_host_id
                .as_deref()
                .and_then(|id| peers.iter().find(|p| p.host_id_resolved && p.host_id == id));

            let matched = by_id.or_else(|| {
                let mut candidates: Vec<&PeerInfo> = peers
                    .iter()
                    .filter(|p| p.host_name.eq_ignore_ascii_case(&host.host_name))
                    .collect();
                candidates.sort_by_key(|p| !p.host_id_resolved);
                candidates.into_iter().next()
            });

            host.online = matched.is_some();
            let Some(peer) = matched else { continue };

            if peer.host_id_resolved && host.peer_host_id.as_deref() != Some(peer.host_id.as_str()) {
                info!(
                    label = %host.label,
                    old = ?host.peer_host_id,
                    new = %peer.host_id,
                    "Rebinding host to advertised identifier"
                );
                host.peer_host_id = Some(peer.host_id.clone());
            }
            host.last_seen = Some(now);
            changed = true;
        }

        if changed {
            self.store.save(HOSTS_KEY, &hosts).await?;
        }
        Ok(hosts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory(dir: &std::path::Path, max: usize) -> HostDirectory {
        HostDirectory::new(JsonStore::new(dir), max)
    }

    #[tokio::test]
    async fn test_add_list_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let hosts = directory(tmp.path(), 8);
        hosts.add("Desk", "desk-mac").await.unwrap();
        hosts.add("Laptop", "laptop").await.unwrap();
        assert_eq!(hosts.list().await.len(), 2);

        let removed = hosts.remove("desk").await.unwrap();
        assert_eq!(removed.label, "Desk");
        assert_eq!(hosts.list().await.len(), 1);
        assert!(matches!(
            hosts.remove("desk").await,
            Err(PeerSwitchError::HostNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_add_rejects_duplicates_empty_and_overflow() {
        let tmp = tempfile::tempdir().unwrap();
        let hosts = directory(tmp.path(), 2);
        hosts.add("Desk", "desk-mac").await.unwrap();
        assert!(matches!(
            hosts.add("Desk", "other").await,
            Err(PeerSwitchError::Config(_))
        ));
        assert!(matches!(
            hosts.add("   ", "other").await,
            Err(PeerSwitchError::Config(_))
        ));
        hosts.add("Laptop", "laptop").await.unwrap();
        assert!(matches!(
            hosts.add("Studio", "studio").await,
            Err(PeerSwitchError::MaxHostsReached { max: 2 })
        ));
    }

    #[tokio::test]
    async fn test_refresh_by_identifier() {
        let tmp = tempfile::tempdir().unwrap();
        let hosts = directory(tmp.path(), 8);
        let desk = hosts.add("Desk", "desk-mac").await.unwrap();
        hosts.bind_peer(desk.id, "HID-1").await.unwrap();

        // Advertised name changed but the identifier still matches.
        let refreshed = hosts
            .refresh(&[PeerInfo::resolved("HID-1", "renamed")])
            .await
            .unwrap();
        assert!(refreshed[0].online);
        assert!(refreshed[0].last_seen.is_some());

        let refreshed = hosts.refresh(&[]).await.unwrap();
        assert!(!refreshed[0].online);
    }

    #[tokio::test]
    async fn test_refresh_repairs_binding_on_hostname_match() {
        let tmp = tempfile::tempdir().unwrap();
        let hosts = directory(tmp.path(), 8);
        let desk = hosts.add("Desk", "desk-mac").await.unwrap();
        hosts.bind_peer(desk.id, "HID-OLD").await.unwrap();

        let refreshed = hosts
            .refresh(&[PeerInfo::resolved("HID-NEW", "Desk-Mac")])
            .await
            .unwrap();
        assert!(refreshed[0].online);
        assert_eq!(refreshed[0].peer_host_id.as_deref(), Some("HID-NEW"));

        // Persisted.
        let stored = hosts.find("Desk").await.unwrap();
        assert_eq!(stored.peer_host_id.as_deref(), Some("HID-NEW"));
        assert!(!stored.online);
    }

    #[tokio::test]
    async fn test_refresh_placeholder_does_not_bind() {
        let tmp = tempfile::tempdir().unwrap();
        let hosts = directory(tmp.path(), 8);
        hosts.add("Desk", "desk-mac").await.unwrap();

        let refreshed = hosts
            .refresh(&[PeerInfo::unresolved("desk-mac")])
            .await
            .unwrap();
        assert!(refreshed[0].online);
        assert!(refreshed[0].peer_host_id.is_none());
    }

    #[tokio::test]
    async fn test_add_from_peer_binds_resolved_identifier() {
        let tmp = tempfile::tempdir().unwrap();
        let hosts = directory(tmp.path(), 8);
        let host = hosts
            .add_from_peer(&PeerInfo::resolved("HID-7", "studio"))
            .await
            .unwrap();
        assert_eq!(host.label, "studio");
        assert_eq!(host.peer_host_id.as_deref(), Some("HID-7"));
    }
}
