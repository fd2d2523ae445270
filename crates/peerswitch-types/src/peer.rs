//! Discovered peers and self-identification.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use uuid::Uuid;

/// Protocol version advertised when a record carries none.
pub const DEFAULT_PEER_VERSION: &str = "1.0";

/// Where a discovered peer can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEndpoint {
    /// Advertised service instance name.
    pub instance: String,
    /// Fully-qualified service type, e.g. `_magicswitch._tcp.local.`.
    pub service_type: String,
    /// Resolved addresses (may be empty until the record resolves).
    pub addresses: Vec<IpAddr>,
    /// Resolved port (0 until the record resolves).
    pub port: u16,
}

impl PeerEndpoint {
    /// Socket addresses to try, IPv4 first.
    pub fn socket_addrs(&self) -> Vec<SocketAddr> {
        let mut addrs: Vec<SocketAddr> = self
            .addresses
            .iter()
            .map(|ip| SocketAddr::new(*ip, self.port))
            .collect();
        addrs.sort_by_key(|a| !a.is_ipv4());
        addrs
    }

    /// True once the record carries at least one address and a port.
    pub fn is_resolved(&self) -> bool {
        self.port != 0 && !self.addresses.is_empty()
    }
}

impl std::fmt::Display for PeerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.instance, self.service_type)
    }
}

/// A peer seen through service discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Local correlation id, generated on discovery.
    pub id: Uuid,
    /// Advertised service instance name.
    pub service_name: Option<String>,
    /// Stable peer identifier. A random placeholder when
    /// `host_id_resolved` is false.
    pub host_id: String,
    /// Display host name.
    pub host_name: String,
    /// Protocol version string.
    pub version: String,
    /// Network endpoint, if known.
    pub endpoint: Option<PeerEndpoint>,
    /// Whether `host_id` came from the advertisement metadata.
    pub host_id_resolved: bool,
}

impl PeerInfo {
    /// A peer whose identifier is authoritative.
    pub fn resolved(host_id: impl Into<String>, host_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            service_name: None,
            host_id: host_id.into(),
            host_name: host_name.into(),
            version: DEFAULT_PEER_VERSION.to_string(),
            endpoint: None,
            host_id_resolved: true,
        }
    }

    /// A peer known only by its advertised name; the identifier is a fresh
    /// placeholder that can never collide with a real one.
    pub fn unresolved(service_name: impl Into<String>) -> Self {
        let service_name = service_name.into();
        Self {
            id: Uuid::new_v4(),
            host_name: service_name.clone(),
            service_name: Some(service_name),
            host_id: Uuid::new_v4().to_string(),
            version: DEFAULT_PEER_VERSION.to_string(),
            endpoint: None,
            host_id_resolved: false,
        }
    }

    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: PeerEndpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Whether two records may describe the same peer by identifier.
    ///
    /// Placeholders only ever equal themselves.
    pub fn same_host_id(&self, other: &PeerInfo) -> bool {
        if self.host_id_resolved != other.host_id_resolved {
            return false;
        }
        self.host_id == other.host_id
    }
}

/// Discovery event emitted by the browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Found(PeerInfo),
    Lost(PeerInfo),
}

impl PeerEvent {
    pub fn peer(&self) -> &PeerInfo {
        match self {
            PeerEvent::Found(p) | PeerEvent::Lost(p) => p,
        }
    }
}

/// What this node knows about itself, used to drop its own advertisement.
#[derive(Debug, Clone, Default)]
pub struct SelfIdentity {
    /// This node's stable identifier.
    pub host_id: Option<String>,
    /// This node's display name.
    pub host_name: Option<String>,
    /// The instance name this node advertises under.
    pub service_name: Option<String>,
    /// The operating-system host name.
    pub local_host_name: Option<String>,
}

impl SelfIdentity {
    /// Decide whether `peer` is this node's own advertisement.
    ///
    /// Checks run from most to least specific: identifier equality, then a
    /// resolved-but-different identifier short-circuits to "not self", then
    /// service-name, display-name and OS-hostname prefix matches.
    pub fn is_self(&self, peer: &PeerInfo) -> bool {
        if let Some(my_id) = &self.host_id {
            if &peer.host_id == my_id {
                return true;
            }
            if peer.host_id_resolved {
                return false;
            }
        }
        if let (Some(own), Some(svc)) = (&self.service_name, &peer.service_name) {
            if !own.is_empty() && svc.starts_with(own.as_str()) {
                return true;
            }
        }
        if let Some(name) = &self.host_name {
            if !name.is_empty() && peer.host_name.starts_with(name.as_str()) {
                return true;
            }
        }
        if let Some(local) = &self.local_host_name {
            if !local.is_empty() && peer.host_name.starts_with(local.as_str()) {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn me() -> SelfIdentity {
        SelfIdentity {
            host_id: Some("HOST-A".to_string()),
            host_name: Some("studio".to_string()),
            service_name: Some("studio".to_string()),
            local_host_name: Some("studio.local".to_string()),
        }
    }

    #[test]
    fn test_self_by_identifier_wins_over_names() {
        let peer = PeerInfo::resolved("HOST-A", "completely-different")
            .with_service_name("other-service");
        assert!(me().is_self(&peer));
    }

    #[test]
    fn test_resolved_different_identifier_is_not_self() {
        // Same name prefix, but a resolved foreign identifier.
        let peer = PeerInfo::resolved("HOST-B", "studio").with_service_name("studio (2)");
        assert!(!me().is_self(&peer));
    }

    #[test]
    fn test_unresolved_falls_back_to_names() {
        let peer = PeerInfo::unresolved("studio (2)");
        assert!(me().is_self(&peer));

        let other = PeerInfo::unresolved("laptop");
        assert!(!me().is_self(&other));
    }

    #[test]
    fn test_unresolved_local_hostname_prefix() {
        let id = SelfIdentity {
            host_id: Some("HOST-A".to_string()),
            host_name: None,
            service_name: None,
            local_host_name: Some("mini".to_string()),
        };
        let mut peer = PeerInfo::unresolved("x");
        peer.host_name = "mini.lan".to_string();
        assert!(id.is_self(&peer));
    }

    #[test]
    fn test_placeholder_never_equals_resolved() {
        let a = PeerInfo::unresolved("desk");
        let mut b = PeerInfo::resolved(a.host_id.clone(), "desk");
        assert!(!a.same_host_id(&b));
        b.host_id_resolved = false;
        assert!(a.same_host_id(&b));
    }

    #[test]
    fn test_endpoint_display_and_addrs() {
        let ep = PeerEndpoint {
            instance: "desk".to_string(),
            service_type: "_magicswitch._tcp.local.".to_string(),
            addresses: vec!["fe80::1".parse().unwrap(), "192.168.1.4".parse().unwrap()],
            port: 5000,
        };
        assert_eq!(ep.to_string(), "desk._magicswitch._tcp.local.");
        let addrs = ep.socket_addrs();
        assert!(addrs[0].is_ipv4());
        assert!(ep.is_resolved());
    }
}
