//! NetworkCoordinator: links, discovered peers and inbound dispatch.
//!
//! The coordinator ties the listener, the browser and the individual
//! [`PeerConnection`]s together. It keeps a registry of live links and an
//! index from peer host identifier to link, routes every inbound message
//! to the registered [`CommandHandler`], and keeps links warm with periodic
//! `HEALTH_CHECK` keep-alives.

use crate::browser::PeerBrowser;
use crate::connection::{InboundMessage, PeerConnection, DEFAULT_CONNECT_TIMEOUT};
use crate::discovery::ServiceDiscovery;
use crate::listener::{AcceptedStream, PeerListener};
use crate::registry::PeerTable;
use crate::tls::TlsSettings;
use async_trait::async_trait;
use peerswitch_types::config::{NodeConfig, DEFAULT_SERVICE_TYPE};
use peerswitch_types::error::{NetworkError, NetworkResult};
use peerswitch_types::message::{DeviceCommand, DeviceMessage};
use peerswitch_types::peer::{PeerEvent, PeerInfo, SelfIdentity};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Receives every inbound message that is not a keep-alive acknowledgement.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    /// Handle one message. A returned reply is sent back on the same link.
    async fn handle_command(
        &self,
        connection_id: Uuid,
        message: DeviceMessage,
    ) -> Option<DeviceMessage>;
}

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub host_id: String,
    pub host_name: String,
    pub service_type: String,
    pub listen_addr: SocketAddr,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// OS host name, used only to recognise our own advertisement.
    pub local_host_name: Option<String>,
}

impl CoordinatorConfig {
    pub fn from_node_config(config: &NodeConfig, host_id: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
            host_name: config.host_name.clone(),
            service_type: config.service_type.clone(),
            listen_addr: config.listen_addr,
            connect_timeout: config.connect_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            local_host_name: peerswitch_types::config::system_host_name(),
        }
    }

    fn self_identity(&self) -> SelfIdentity {
        SelfIdentity {
            host_id: Some(self.host_id.clone()),
            host_name: Some(self.host_name.clone()),
            service_name: Some(self.host_name.clone()),
            local_host_name: self.local_host_name.clone(),
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            host_id: Uuid::new_v4().to_string(),
            host_name: "peerswitch-node".to_string(),
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            heartbeat_interval: Duration::from_secs(30),
            local_host_name: None,
        }
    }
}

/// Live links plus the host index. Locked only around memory.
#[derive(Default)]
struct Links {
    connections: HashMap<Uuid, Arc<PeerConnection>>,
    by_host: HashMap<String, Uuid>,
}

impl Links {
    fn remove(&mut self, id: &Uuid) -> Option<Arc<PeerConnection>> {
        self.by_host.retain(|_, conn| conn != id);
        self.connections.remove(id)
    }

    /// Forget the link indexed under `host_id`, returning it if still held.
    fn remove_host(&mut self, host_id: &str) -> Option<Arc<PeerConnection>> {
        let id = self.by_host.remove(host_id)?;
        self.remove(&id)
    }
}

/// Owns the node's links and discovered peers.
pub struct NetworkCoordinator {
    config: CoordinatorConfig,
    identity: SelfIdentity,
    tls: Option<TlsSettings>,
    listener: PeerListener,
    browser: PeerBrowser,
    peers: PeerTable,
    links: Mutex<Links>,
    handler: OnceLock<Arc<dyn CommandHandler>>,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<InboundMessage>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Serializes auto-connects so two sends to one peer open one link.
    connect_lock: tokio::sync::Mutex<()>,
}

impl NetworkCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        discovery: Arc<dyn ServiceDiscovery>,
        tls: Option<TlsSettings>,
    ) -> Arc<Self> {
        let listener = PeerListener::new(
            Arc::clone(&discovery),
            config.service_type.clone(),
            config.listen_addr,
            tls.clone(),
        )
        .with_handshake_timeout(config.connect_timeout);
        let browser = PeerBrowser::new(discovery, config.service_type.clone());
        Arc::new(Self {
            identity: config.self_identity(),
            config,
            tls,
            listener,
            browser,
            peers: PeerTable::new(),
            links: Mutex::new(Links::default()),
            handler: OnceLock::new(),
            inbound_tx: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            connect_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// This node's stable identifier.
    pub fn host_id(&self) -> &str {
        &self.config.host_id
    }

    pub fn host_name(&self) -> &str {
        &self.config.host_name
    }

    /// Register the handler for inbound messages. Only the first call wins.
    pub fn set_command_handler(&self, handler: Arc<dyn CommandHandler>) -> bool {
        if self.handler.set(handler).is_err() {
            warn!("Command handler already registered, ignoring");
            return false;
        }
        true
    }

    // ---- Lifecycle ----

    /// Start listening, browsing and the background tasks.
    ///
    /// Returns the bound listen address. Calling `start` again restarts.
    pub async fn start(self: &Arc<Self>) -> NetworkResult<SocketAddr> {
        self.stop().await;

        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<InboundMessage>();
        let (accepted_tx, mut accepted_rx) = mpsc::unbounded_channel::<AcceptedStream>();
        *self.inbound_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(inbound_tx);

        let local_addr = self
            .listener
            .start_listening(&self.config.host_name, &self.config.host_id, accepted_tx)
            .await?;
        let mut events = match self.browser.start_browsing() {
            Ok(events) => events,
            Err(e) => {
                self.listener.stop_listening();
                return Err(e);
            }
        };

        let mut tasks = Vec::with_capacity(4);

        let this = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                this.handle_peer_event(event);
            }
        }));

        let this = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            while let Some(accepted) = accepted_rx.recv().await {
                this.register_accepted(accepted).await;
            }
        }));

        let this = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            while let Some(inbound) = inbound_rx.recv().await {
                this.dispatch(inbound);
            }
        }));

        let this = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            this.heartbeat_loop().await;
        }));

        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(tasks);

        info!(
            host = %self.config.host_name,
            host_id = %self.config.host_id,
            addr = %local_addr,
            tls = self.tls.is_some(),
            "Network coordinator started"
        );
        Ok(local_addr)
    }

    /// Cancel background work, close every link and forget every peer.
    pub async fn stop(&self) {
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        let was_running = !tasks.is_empty();
        for task in tasks {
            task.abort();
        }

        let connections: Vec<Arc<PeerConnection>> = {
            let mut links = self.links.lock().unwrap_or_else(|e| e.into_inner());
            links.by_host.clear();
            links.connections.drain().map(|(_, c)| c).collect()
        };
        for conn in connections {
            conn.stop().await;
        }

        self.peers.clear();
        self.browser.stop_browsing();
        self.listener.stop_listening();
        self.inbound_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if was_running {
            info!("Network coordinator stopped");
        }
    }

    // ---- Discovery ----

    /// Apply one discovery event to the peer table.
    pub fn handle_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::Found(peer) => {
                if self.identity.is_self(&peer) {
                    debug!(peer = %peer.host_name, "Ignoring own advertisement");
                    return;
                }
                let host_id = peer.host_id.clone();
                let host_name = peer.host_name.clone();
                let resolved = peer.host_id_resolved;
                let evicted = self.peers.insert_found(peer);
                if !evicted.is_empty() {
                    let mut links = self.links.lock().unwrap_or_else(|e| e.into_inner());
                    for stale in &evicted {
                        links.by_host.remove(&stale.host_id);
                    }
                }
                info!(peer = %host_name, host_id = %host_id, resolved, "Peer found");
            }
            PeerEvent::Lost(peer) => {
                let removed = self.peers.remove_lost(&peer);
                let dropped: Vec<Arc<PeerConnection>> = {
                    let mut links = self.links.lock().unwrap_or_else(|e| e.into_inner());
                    removed
                        .iter()
                        .filter_map(|p| links.remove_host(&p.host_id))
                        .collect()
                };
                for p in &removed {
                    info!(peer = %p.host_name, host_id = %p.host_id, "Peer lost");
                }
                for conn in dropped {
                    debug!(connection = %conn.id(), "Closing link to lost peer");
                    tokio::spawn(async move { conn.stop().await });
                }
            }
        }
    }

    pub fn discovered_peers(&self) -> Vec<PeerInfo> {
        self.peers.all()
    }

    pub fn peer(&self, host_id: &str) -> Option<PeerInfo> {
        self.peers.get(host_id)
    }

    pub fn find_peer_by_host_name(&self, host_name: &str) -> Option<PeerInfo> {
        self.peers.find_by_host_name(host_name)
    }

    // ---- Links ----

    pub fn is_peer_connected(&self, host_id: &str) -> bool {
        self.live_connection(host_id).is_some()
    }

    pub fn connection_count(&self) -> usize {
        self.links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .connections
            .len()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    fn connection(&self, id: &Uuid) -> Option<Arc<PeerConnection>> {
        self.links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .connections
            .get(id)
            .cloned()
    }

    fn live_connection(&self, host_id: &str) -> Option<Arc<PeerConnection>> {
        let links = self.links.lock().unwrap_or_else(|e| e.into_inner());
        links
            .by_host
            .get(host_id)
            .and_then(|id| links.connections.get(id))
            .filter(|c| c.is_connected())
            .cloned()
    }

    fn inbound_sender(&self) -> NetworkResult<mpsc::UnboundedSender<InboundMessage>> {
        self.inbound_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(NetworkError::NotConnected)
    }

    async fn register_accepted(&self, accepted: AcceptedStream) {
        let inbound = match self.inbound_sender() {
            Ok(tx) => tx,
            Err(_) => return,
        };
        let conn = PeerConnection::accepted(accepted.remote.to_string(), accepted.stream, inbound);
        let id = conn.id();
        self.links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .connections
            .insert(id, Arc::clone(&conn));

        if let Err(e) = conn.start().await {
            warn!(remote = %accepted.remote, error = %e, "Inbound link failed to start");
            self.links.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
            return;
        }
        info!(connection = %id, remote = %accepted.remote, "Inbound link established");
    }

    /// Open (or reuse) a link to a discovered peer.
    pub async fn connect_to_peer(&self, peer: &PeerInfo) -> NetworkResult<Arc<PeerConnection>> {
        let _guard = self.connect_lock.lock().await;
        if let Some(conn) = self.live_connection(&peer.host_id) {
            return Ok(conn);
        }

        let addrs = peer
            .endpoint
            .as_ref()
            .map(|e| e.socket_addrs())
            .unwrap_or_default();
        if addrs.is_empty() {
            return Err(NetworkError::PeerUnreachable(format!(
                "{} has no resolved address",
                peer.host_name
            )));
        }

        let conn = PeerConnection::outbound(
            peer.host_name.clone(),
            addrs,
            self.tls.clone(),
            self.inbound_sender()?,
            self.config.connect_timeout,
        );
        let id = conn.id();
        {
            let mut links = self.links.lock().unwrap_or_else(|e| e.into_inner());
            links.connections.insert(id, Arc::clone(&conn));
            if let Some(old) = links.by_host.insert(peer.host_id.clone(), id) {
                links.connections.remove(&old);
            }
        }

        if let Err(e) = conn.start().await {
            self.links.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
            warn!(peer = %peer.host_name, error = %e, "Connect failed");
            return Err(e);
        }
        info!(peer = %peer.host_name, connection = %id, "Connected to peer");
        Ok(conn)
    }

    // ---- Sending ----

    /// Send on a specific link.
    pub async fn send(&self, connection_id: Uuid, msg: &DeviceMessage) -> NetworkResult<()> {
        let conn = self
            .connection(&connection_id)
            .ok_or(NetworkError::NotConnected)?;
        conn.send(msg).await
    }

    /// Send on the existing link to `host_id`. Never dials.
    pub async fn send_to_host(&self, host_id: &str, msg: &DeviceMessage) -> NetworkResult<()> {
        let conn = self
            .live_connection(host_id)
            .ok_or(NetworkError::NotConnected)?;
        conn.send(msg).await
    }

    /// Send to a discovered peer, connecting first if needed.
    pub async fn send_to_peer(&self, host_id: &str, msg: &DeviceMessage) -> NetworkResult<()> {
        let conn = self.link_to_peer(host_id).await?;
        conn.send(msg).await
    }

    /// Send to a discovered peer and wait for its next response command.
    pub async fn send_and_wait_to_peer(
        &self,
        host_id: &str,
        msg: &DeviceMessage,
        timeout: Duration,
    ) -> NetworkResult<DeviceMessage> {
        let conn = self.link_to_peer(host_id).await?;
        conn.send_and_wait(msg, timeout).await
    }

    async fn link_to_peer(&self, host_id: &str) -> NetworkResult<Arc<PeerConnection>> {
        if let Some(conn) = self.live_connection(host_id) {
            return Ok(conn);
        }
        let peer = self
            .peers
            .get(host_id)
            .ok_or_else(|| NetworkError::PeerNotFound(host_id.to_string()))?;
        self.connect_to_peer(&peer).await
    }

    // ---- Inbound ----

    fn dispatch(self: &Arc<Self>, inbound: InboundMessage) {
        let InboundMessage {
            connection_id,
            message,
        } = inbound;

        if message.command == DeviceCommand::OpSuccess {
            if let Some(conn) = self.connection(&connection_id) {
                if conn.take_keepalive_ack() {
                    debug!(connection = %connection_id, "Keep-alive acknowledged");
                    return;
                }
            }
        }

        let Some(handler) = self.handler.get().cloned() else {
            debug!(command = %message.command, "No command handler, dropping");
            return;
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Some(reply) = handler.handle_command(connection_id, message).await {
                if let Err(e) = this.send(connection_id, &reply).await {
                    warn!(connection = %connection_id, error = %e, "Failed to send reply");
                }
            }
        });
    }

    // ---- Keep-alive ----

    async fn heartbeat_loop(&self) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.heartbeat_tick().await;
        }
    }

    /// Send one keep-alive on every live link and prune dead ones.
    ///
    /// Each write gets the connect timeout. A link whose peer stopped
    /// reading is dropped instead of holding up the others.
    async fn heartbeat_tick(&self) {
        let connections: Vec<Arc<PeerConnection>> = self
            .links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .connections
            .values()
            .cloned()
            .collect();

        let write_timeout = self.config.connect_timeout;
        let mut dead = Vec::new();
        let mut sends = JoinSet::new();
        for conn in connections {
            if conn.is_connected() {
                sends.spawn(async move {
                    let sent = tokio::time::timeout(write_timeout, conn.send_keepalive()).await;
                    (conn, sent)
                });
            } else if conn.state().is_terminal() {
                dead.push(conn.id());
            }
        }

        let mut stalled = Vec::new();
        while let Some(joined) = sends.join_next().await {
            let Ok((conn, sent)) = joined else {
                continue;
            };
            match sent {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(connection = %conn.id(), error = %e, "Keep-alive failed");
                }
                Err(_) => {
                    warn!(
                        connection = %conn.id(),
                        remote = %conn.remote(),
                        timeout_ms = write_timeout.as_millis() as u64,
                        "Keep-alive write stalled, dropping link"
                    );
                    dead.push(conn.id());
                    stalled.push(conn);
                }
            }
        }

        if !dead.is_empty() {
            let mut links = self.links.lock().unwrap_or_else(|e| e.into_inner());
            for id in &dead {
                links.remove(id);
            }
            debug!(pruned = dead.len(), "Pruned dead links");
        }

        for conn in stalled {
            if tokio::time::timeout(write_timeout, conn.stop()).await.is_err() {
                debug!(connection = %conn.id(), "Stalled link did not shut down cleanly");
            }
        }
    }
}
