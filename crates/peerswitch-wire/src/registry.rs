//! Peer table: the discovered peers this node can hand off to.
//!
//! The [`PeerTable`] is keyed by stable host identifier. Because a record may
//! first appear without metadata (placeholder identifier) and later resolve,
//! insertion evicts any entry that shares the service name under a different
//! identifier, and removal sweeps by both identifier and service name.

use chrono::{DateTime, Utc};
use peerswitch_types::peer::PeerInfo;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A discovered peer plus bookkeeping.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub info: PeerInfo,
    /// When the peer was last reported found.
    pub last_seen: DateTime<Utc>,
}

/// Thread-safe table of discovered peers. Cloning shares the table.
#[derive(Debug, Clone, Default)]
pub struct PeerTable {
    peers: Arc<RwLock<HashMap<String, PeerEntry>>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a found peer.
    ///
    /// Entries with the same service name but another identifier are stale
    /// (their metadata arrived later) and are evicted. Returns them.
    pub fn insert_found(&self, info: PeerInfo) -> Vec<PeerInfo> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        let mut evicted = Vec::new();
        if let Some(service) = info.service_name.as_deref() {
            let stale: Vec<String> = peers
                .iter()
                .filter(|(id, e)| {
                    *id != &info.host_id && e.info.service_name.as_deref() == Some(service)
                })
                .map(|(id, _)| id.clone())
                .collect();
            for id in stale {
                if let Some(e) = peers.remove(&id) {
                    evicted.push(e.info);
                }
            }
        }
        peers.insert(
            info.host_id.clone(),
            PeerEntry {
                info,
                last_seen: Utc::now(),
            },
        );
        evicted
    }

    /// Remove a lost peer and anything advertised under its service name.
    pub fn remove_lost(&self, info: &PeerInfo) -> Vec<PeerInfo> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        let mut removed = Vec::new();
        if let Some(e) = peers.remove(&info.host_id) {
            removed.push(e.info);
        }
        if let Some(service) = info.service_name.as_deref() {
            peers.retain(|_, e| {
                if e.info.service_name.as_deref() == Some(service) {
                    removed.push(e.info.clone());
                    false
                } else {
                    true
                }
            });
        }
        removed
    }

    /// Look up a peer by stable identifier.
    pub fn get(&self, host_id: &str) -> Option<PeerInfo> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.get(host_id).map(|e| e.info.clone())
    }

    /// Find a peer by display host name (case-insensitive), preferring
    /// resolved identifiers.
    pub fn find_by_host_name(&self, host_name: &str) -> Option<PeerInfo> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        let mut matches: Vec<&PeerEntry> = peers
            .values()
            .filter(|e| e.info.host_name.eq_ignore_ascii_case(host_name))
            .collect();
        matches.sort_by_key(|e| (!e.info.host_id_resolved, std::cmp::Reverse(e.last_seen)));
        matches.first().map(|e| e.info.clone())
    }

    /// Snapshot of all peers.
    pub fn all(&self) -> Vec<PeerInfo> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.values().map(|e| e.info.clone()).collect()
    }

    /// Snapshot including bookkeeping.
    pub fn entries(&self) -> Vec<PeerEntry> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.peers.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
