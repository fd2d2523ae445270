//! Service advertisement backends.
//!
//! [`ServiceDiscovery`] is the seam between the listener/browser and the
//! network's DNS-SD implementation. [`MdnsDiscovery`] talks multicast DNS;
//! [`MemoryDiscovery`] is an in-process bus that lets several nodes in one
//! process find each other (tests, local demos).

use peerswitch_types::error::{NetworkError, NetworkResult};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A service record, as published or as observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Service instance name.
    pub instance: String,
    /// Fully-qualified service type, e.g. `_magicswitch._tcp.local.`.
    pub service_type: String,
    pub port: u16,
    /// Resolved addresses. Empty when publishing lets the backend choose.
    pub addresses: Vec<IpAddr>,
    /// Key/value metadata.
    pub txt: HashMap<String, String>,
}

impl Advertisement {
    /// A record known only by name, before it resolves.
    pub fn bare(instance: impl Into<String>, service_type: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            service_type: service_type.into(),
            port: 0,
            addresses: Vec::new(),
            txt: HashMap::new(),
        }
    }

    pub fn txt_value(&self, key: &str) -> Option<&str> {
        self.txt.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }
}

/// A change observed while browsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvertisementChange {
    /// A new instance appeared; metadata may not be known yet.
    Added(Advertisement),
    /// An instance resolved or updated its metadata.
    Changed(Advertisement),
    /// An instance went away.
    Removed { instance: String, service_type: String },
}

/// Publishes and observes service records.
pub trait ServiceDiscovery: Send + Sync + 'static {
    /// Publish (or republish) an advertisement.
    fn advertise(&self, ad: &Advertisement) -> NetworkResult<()>;

    /// Withdraw a previously published advertisement.
    fn withdraw(&self, instance: &str, service_type: &str) -> NetworkResult<()>;

    /// Start observing a service type. Starting again replaces the
    /// previous stream.
    fn browse(&self, service_type: &str)
        -> NetworkResult<mpsc::UnboundedReceiver<AdvertisementChange>>;

    /// Stop observing; the stream returned by `browse` closes.
    fn stop_browse(&self, service_type: &str) -> NetworkResult<()>;

    /// Release the backend. Nothing may be called afterwards.
    fn shutdown(&self) {}
}

// ---------------------------------------------------------------------------
// Multicast DNS
// ---------------------------------------------------------------------------

/// DNS-SD over multicast DNS, backed by `mdns-sd`.
pub struct MdnsDiscovery {
    daemon: mdns_sd::ServiceDaemon,
    browse_tasks: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
}

fn mdns_err(e: mdns_sd::Error) -> NetworkError {
    NetworkError::Discovery(e.to_string())
}

/// Strip `.<service_type>` from a fully-qualified instance name.
fn instance_of(fullname: &str, service_type: &str) -> String {
    fullname
        .strip_suffix(service_type)
        .map(|s| s.trim_end_matches('.'))
        .unwrap_or(fullname)
        .to_string()
}

/// mDNS host labels cannot carry spaces or dots.
fn host_label(instance: &str) -> String {
    let label: String = instance
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    if label.is_empty() {
        "peerswitch".to_string()
    } else {
        label
    }
}

impl MdnsDiscovery {
    pub fn new() -> NetworkResult<Self> {
        Ok(Self {
            daemon: mdns_sd::ServiceDaemon::new().map_err(mdns_err)?,
            browse_tasks: Mutex::new(HashMap::new()),
        })
    }

    fn translate(event: mdns_sd::ServiceEvent) -> Option<AdvertisementChange> {
        use mdns_sd::ServiceEvent;
        match event {
            ServiceEvent::ServiceFound(ty, fullname) => Some(AdvertisementChange::Added(
                Advertisement::bare(instance_of(&fullname, &ty), ty),
            )),
            ServiceEvent::ServiceResolved(info) => {
                let service_type = info.get_type().to_string();
                let txt = info
                    .get_properties()
                    .iter()
                    .map(|p| (p.key().to_string(), p.val_str().to_string()))
                    .collect();
                Some(AdvertisementChange::Changed(Advertisement {
                    instance: instance_of(info.get_fullname(), &service_type),
                    service_type,
                    port: info.get_port(),
                    addresses: info.get_addresses().iter().copied().collect(),
                    txt,
                }))
            }
            ServiceEvent::ServiceRemoved(ty, fullname) => Some(AdvertisementChange::Removed {
                instance: instance_of(&fullname, &ty),
                service_type: ty,
            }),
            _ => None,
        }
    }
}

impl ServiceDiscovery for MdnsDiscovery {
    fn advertise(&self, ad: &Advertisement) -> NetworkResult<()> {
        let host = format!("{}.local.", host_label(&ad.instance));
        let info = mdns_sd::ServiceInfo::new(
            &ad.service_type,
            &ad.instance,
            &host,
            "",
            ad.port,
            ad.txt.clone(),
        )
        .map_err(mdns_err)?
        .enable_addr_auto();
        self.daemon.register(info).map_err(mdns_err)
    }

    fn withdraw(&self, instance: &str, service_type: &str) -> NetworkResult<()> {
        let fullname = format!("{instance}.{service_type}");
        self.daemon.unregister(&fullname).map(|_| ()).map_err(mdns_err)
    }

    fn browse(
        &self,
        service_type: &str,
    ) -> NetworkResult<mpsc::UnboundedReceiver<AdvertisementChange>> {
        let events = self.daemon.browse(service_type).map_err(mdns_err)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            while let Ok(event) = events.recv_async().await {
                if let Some(change) = Self::translate(event) {
                    if tx.send(change).is_err() {
                        break;
                    }
                }
            }
        });
        let mut tasks = self.browse_tasks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = tasks.insert(service_type.to_string(), task) {
            old.abort();
        }
        Ok(rx)
    }

    fn stop_browse(&self, service_type: &str) -> NetworkResult<()> {
        let task = {
            let mut tasks = self.browse_tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.remove(service_type)
        };
        if let Some(task) = task {
            task.abort();
        }
        if let Err(e) = self.daemon.stop_browse(service_type) {
            warn!(error = %e, service_type, "Failed to stop mDNS browse");
        }
        Ok(())
    }

    /// Stop the responder thread.
    fn shutdown(&self) {
        if let Err(e) = self.daemon.shutdown() {
            debug!(error = %e, "mDNS daemon shutdown");
        }
    }
}

// ---------------------------------------------------------------------------
// In-process bus
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryBus {
    /// (service type, instance) -> record.
    records: HashMap<(String, String), Advertisement>,
    /// (handle id, service type) -> subscriber.
    subscribers: HashMap<(u64, String), mpsc::UnboundedSender<AdvertisementChange>>,
}

impl MemoryBus {
    fn publish(&mut self, service_type: &str, change: AdvertisementChange) {
        self.subscribers.retain(|(_, ty), tx| {
            if ty != service_type {
                return true;
            }
            tx.send(change.clone()).is_ok()
        });
    }
}

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// In-process service discovery.
///
/// Handles created with [`MemoryDiscovery::handle`] share one bus, so each
/// node in a process gets its own handle. Records announce themselves the
/// way mDNS does: first by name only, then with metadata.
#[derive(Clone)]
pub struct MemoryDiscovery {
    id: u64,
    bus: Arc<Mutex<MemoryBus>>,
}

impl Default for MemoryDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDiscovery {
    pub fn new() -> Self {
        Self {
            id: NEXT_HANDLE.fetch_add(1, Ordering::Relaxed),
            bus: Arc::new(Mutex::new(MemoryBus::default())),
        }
    }

    /// Another participant on the same bus.
    pub fn handle(&self) -> Self {
        Self {
            id: NEXT_HANDLE.fetch_add(1, Ordering::Relaxed),
            bus: Arc::clone(&self.bus),
        }
    }

    /// Inject a raw change, as if observed on the network.
    pub fn inject(&self, service_type: &str, change: AdvertisementChange) {
        let mut bus = self.bus.lock().unwrap_or_else(|e| e.into_inner());
        bus.publish(service_type, change);
    }
}

impl ServiceDiscovery for MemoryDiscovery {
    fn advertise(&self, ad: &Advertisement) -> NetworkResult<()> {
        let mut ad = ad.clone();
        if ad.addresses.is_empty() {
            ad.addresses.push(IpAddr::V4(Ipv4Addr::LOCALHOST));
        }
        let mut bus = self.bus.lock().unwrap_or_else(|e| e.into_inner());
        bus.publish(
            &ad.service_type,
            AdvertisementChange::Added(Advertisement::bare(&ad.instance, &ad.service_type)),
        );
        bus.publish(&ad.service_type, AdvertisementChange::Changed(ad.clone()));
        bus.records
            .insert((ad.service_type.clone(), ad.instance.clone()), ad);
        Ok(())
    }

    fn withdraw(&self, instance: &str, service_type: &str) -> NetworkResult<()> {
        let mut bus = self.bus.lock().unwrap_or_else(|e| e.into_inner());
        if bus
            .records
            .remove(&(service_type.to_string(), instance.to_string()))
            .is_some()
        {
            bus.publish(
                service_type,
                AdvertisementChange::Removed {
                    instance: instance.to_string(),
                    service_type: service_type.to_string(),
                },
            );
        }
        Ok(())
    }

    fn browse(
        &self,
        service_type: &str,
    ) -> NetworkResult<mpsc::UnboundedReceiver<AdvertisementChange>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut bus = self.bus.lock().unwrap_or_else(|e| e.into_inner());
        for ((ty, _), ad) in bus.records.iter() {
            if ty == service_type {
                let _ = tx.send(AdvertisementChange::Added(Advertisement::bare(
                    &ad.instance,
                    &ad.service_type,
                )));
                let _ = tx.send(AdvertisementChange::Changed(ad.clone()));
            }
        }
        bus.subscribers
            .insert((self.id, service_type.to_string()), tx);
        Ok(rx)
    }

    fn stop_browse(&self, service_type: &str) -> NetworkResult<()> {
        let mut bus = self.bus.lock().unwrap_or_else(|e| e.into_inner());
        bus.subscribers.remove(&(self.id, service_type.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TY: &str = "_magicswitch._tcp.local.";

    fn ad(instance: &str) -> Advertisement {
        let mut txt = HashMap::new();
        txt.insert("hostId".to_string(), format!("{instance}-id"));
        Advertisement {
            instance: instance.to_string(),
            service_type: TY.to_string(),
            port: 4000,
            addresses: Vec::new(),
            txt,
        }
    }

    #[test]
    fn test_instance_of() {
        assert_eq!(instance_of("desk._magicswitch._tcp.local.", TY), "desk");
        assert_eq!(instance_of("desk", TY), "desk");
        assert_eq!(host_label("My Desk.mac"), "My-Desk-mac");
    }

    #[tokio::test]
    async fn test_memory_bus_delivers_between_handles() {
        let a = MemoryDiscovery::new();
        let b = a.handle();
        let mut rx = b.browse(TY).unwrap();

        a.advertise(&ad("desk")).unwrap();
        match rx.recv().await.unwrap() {
            AdvertisementChange::Added(bare) => {
                assert_eq!(bare.instance, "desk");
                assert!(bare.txt.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
        match rx.recv().await.unwrap() {
            AdvertisementChange::Changed(full) => {
                assert_eq!(full.txt_value("hostId"), Some("desk-id"));
                assert_eq!(full.addresses, vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);
            }
            other => panic!("unexpected {other:?}"),
        }

        a.withdraw("desk", TY).unwrap();
        assert!(matches!(
            rx.recv().await.unwrap(),
            AdvertisementChange::Removed { .. }
        ));
    }

    #[tokio::test]
    async fn test_memory_browse_replays_and_stop_closes() {
        let a = MemoryDiscovery::new();
        a.advertise(&ad("desk")).unwrap();

        let b = a.handle();
        let mut rx = b.browse(TY).unwrap();
        assert!(matches!(rx.recv().await, Some(AdvertisementChange::Added(_))));
        assert!(matches!(rx.recv().await, Some(AdvertisementChange::Changed(_))));

        b.stop_browse(TY).unwrap();
        assert!(rx.recv().await.is_none());
    }
}
