//! PeerBrowser: turn service-record changes into peer events.
//!
//! Records usually arrive twice: first by name only, then resolved with
//! metadata. A record without a `hostId` still produces a peer, flagged
//! unresolved with a placeholder identifier, so that self-filtering and
//! deduplication by service name can act on it. A local cache keyed by
//! instance name keeps identities stable across repeats and lets removals
//! (which carry no metadata) report the last known identity.

use crate::discovery::{Advertisement, AdvertisementChange, ServiceDiscovery};
use crate::listener::{TXT_HOST_ID, TXT_HOST_NAME, TXT_VERSION};
use peerswitch_types::error::NetworkResult;
use peerswitch_types::peer::{PeerEndpoint, PeerEvent, PeerInfo, DEFAULT_PEER_VERSION};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

type PeerCache = Arc<Mutex<HashMap<String, PeerInfo>>>;

/// Discovers peers of one service type.
pub struct PeerBrowser {
    discovery: Arc<dyn ServiceDiscovery>,
    service_type: String,
    cache: PeerCache,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PeerBrowser {
    pub fn new(discovery: Arc<dyn ServiceDiscovery>, service_type: impl Into<String>) -> Self {
        Self {
            discovery,
            service_type: service_type.into(),
            cache: Arc::new(Mutex::new(HashMap::new())),
            task: Mutex::new(None),
        }
    }

    /// Start (or restart) browsing. The returned stream closes when browsing
    /// stops.
    pub fn start_browsing(&self) -> NetworkResult<mpsc::UnboundedReceiver<PeerEvent>> {
        self.stop_browsing();

        let mut changes = self.discovery.browse(&self.service_type)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let cache = Arc::clone(&self.cache);
        let task = tokio::spawn(async move {
            while let Some(change) = changes.recv().await {
                let event = apply_change(&cache, change);
                debug!(?event, "Discovery event");
                if tx.send(event).is_err() {
                    break;
                }
            }
        });
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        debug!(service_type = %self.service_type, "Browsing started");
        Ok(rx)
    }

    /// Cancel the scan and clear the local cache.
    pub fn stop_browsing(&self) {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            task.abort();
            if let Err(e) = self.discovery.stop_browse(&self.service_type) {
                debug!(error = %e, "stop_browse");
            }
        }
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Snapshot of peers currently visible.
    pub fn discovered_peers(&self) -> Vec<PeerInfo> {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

impl Drop for PeerBrowser {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }
}

fn apply_change(cache: &PeerCache, change: AdvertisementChange) -> PeerEvent {
    let mut cache = cache.lock().unwrap_or_else(|e| e.into_inner());
    match change {
        // A changed record is treated exactly like a new one.
        AdvertisementChange::Added(ad) | AdvertisementChange::Changed(ad) => {
            let peer = peer_from_advertisement(&ad, cache.get(&ad.instance));
            cache.insert(ad.instance.clone(), peer.clone());
            PeerEvent::Found(peer)
        }
        AdvertisementChange::Removed {
            instance,
            service_type,
        } => {
            let peer = cache.remove(&instance).unwrap_or_else(|| {
                let mut p = PeerInfo::unresolved(&instance);
                p.endpoint = Some(PeerEndpoint {
                    instance,
                    service_type,
                    addresses: Vec::new(),
                    port: 0,
                });
                p
            });
            PeerEvent::Lost(peer)
        }
    }
}

/// Build a [`PeerInfo`] from a record, reusing what is already known about
/// the same instance.
pub fn peer_from_advertisement(ad: &Advertisement, previous: Option<&PeerInfo>) -> PeerInfo {
    let advertised_id = ad.txt_value(TXT_HOST_ID).map(str::to_string);

    let (host_id, resolved) = match (&advertised_id, previous) {
        (Some(id), _) => (id.clone(), true),
        (None, Some(prev)) => (prev.host_id.clone(), prev.host_id_resolved),
        (None, None) => (Uuid::new_v4().to_string(), false),
    };

    let host_name = ad
        .txt_value(TXT_HOST_NAME)
        .map(str::to_string)
        .or_else(|| previous.filter(|p| p.host_id_resolved).map(|p| p.host_name.clone()))
        .unwrap_or_else(|| ad.instance.clone());

    let version = ad
        .txt_value(TXT_VERSION)
        .map(str::to_string)
        .or_else(|| previous.map(|p| p.version.clone()))
        .unwrap_or_else(|| DEFAULT_PEER_VERSION.to_string());

    let endpoint = if ad.port != 0 {
        Some(PeerEndpoint {
            instance: ad.instance.clone(),
            service_type: ad.service_type.clone(),
            addresses: ad.addresses.clone(),
            port: ad.port,
        })
    } else {
        previous.and_then(|p| p.endpoint.clone()).or_else(|| {
            Some(PeerEndpoint {
                instance: ad.instance.clone(),
                service_type: ad.service_type.clone(),
                addresses: Vec::new(),
                port: 0,
            })
        })
    };

    let id = previous
        .filter(|p| p.host_id == host_id)
        .map(|p| p.id)
        .unwrap_or_else(Uuid::new_v4);

    PeerInfo {
        id,
        service_name: Some(ad.instance.clone()),
        host_id,
        host_name,
        version,
        endpoint,
        host_id_resolved: resolved,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::MemoryDiscovery;

    const TY: &str = "_magicswitch._tcp.local.";

    fn resolved_ad(instance: &str, host_id: &str, host_name: &str) -> Advertisement {
        let mut ad = Advertisement::bare(instance, TY);
        ad.port = 4242;
        ad.addresses = vec!["192.168.1.20".parse().unwrap()];
        ad.txt.insert(TXT_HOST_ID.to_string(), host_id.to_string());
        ad.txt.insert(TXT_HOST_NAME.to_string(), host_name.to_string());
        ad.txt.insert(TXT_VERSION.to_string(), "1.0".to_string());
        ad
    }

    #[test]
    fn test_bare_record_is_unresolved() {
        let peer = peer_from_advertisement(&Advertisement::bare("desk", TY), None);
        assert!(!peer.host_id_resolved);
        assert_eq!(peer.service_name.as_deref(), Some("desk"));
        assert_eq!(peer.host_name, "desk");
        assert_eq!(peer.version, "1.0");
        assert_eq!(peer.endpoint.unwrap().to_string(), "desk._magicswitch._tcp.local.");
    }

    #[test]
    fn test_metadata_overrides_instance_name() {
        let peer = peer_from_advertisement(&resolved_ad("desk (2)", "HID-9", "Desk Mac"), None);
        assert!(peer.host_id_resolved);
        assert_eq!(peer.host_id, "HID-9");
        assert_eq!(peer.host_name, "Desk Mac");
        assert_eq!(peer.endpoint.unwrap().port, 4242);
    }

    #[test]
    fn test_bare_repeat_keeps_resolved_identity() {
        let first = peer_from_advertisement(&resolved_ad("desk", "HID-9", "Desk"), None);
        let again = peer_from_advertisement(&Advertisement::bare("desk", TY), Some(&first));
        assert_eq!(again.host_id, "HID-9");
        assert!(again.host_id_resolved);
        assert_eq!(again.id, first.id);
        assert_eq!(again.endpoint.unwrap().port, 4242);
    }

    #[tokio::test]
    async fn test_browse_found_and_lost() {
        let bus = MemoryDiscovery::new();
        let browser = PeerBrowser::new(Arc::new(bus.handle()), TY);
        let mut events = browser.start_browsing().unwrap();

        bus.inject(TY, AdvertisementChange::Added(Advertisement::bare("desk", TY)));
        bus.inject(TY, AdvertisementChange::Changed(resolved_ad("desk", "HID-1", "desk")));
        bus.inject(
            TY,
            AdvertisementChange::Removed {
                instance: "desk".to_string(),
                service_type: TY.to_string(),
            },
        );

        let PeerEvent::Found(bare) = events.recv().await.unwrap() else {
            panic!("expected found");
        };
        assert!(!bare.host_id_resolved);
        let PeerEvent::Found(full) = events.recv().await.unwrap() else {
            panic!("expected found");
        };
        assert_eq!(full.host_id, "HID-1");
        let PeerEvent::Lost(lost) = events.recv().await.unwrap() else {
            panic!("expected lost");
        };
        assert_eq!(lost.host_id, "HID-1");
        assert!(browser.discovered_peers().is_empty());
    }

    #[tokio::test]
    async fn test_stop_clears_cache_and_closes_stream() {
        let bus = MemoryDiscovery::new();
        let browser = PeerBrowser::new(Arc::new(bus.handle()), TY);
        let mut events = browser.start_browsing().unwrap();
        bus.inject(TY, AdvertisementChange::Changed(resolved_ad("desk", "HID-1", "desk")));
        events.recv().await.unwrap();
        assert_eq!(browser.discovered_peers().len(), 1);

        browser.stop_browsing();
        assert!(browser.discovered_peers().is_empty());
        assert!(events.recv().await.is_none());
    }
}
