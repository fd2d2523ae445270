//! PeerListener: advertise this node and accept inbound links.
//!
//! The listener binds a TCP socket (by default on an OS-assigned port),
//! publishes a service record carrying the protocol version, host
//! identifier and display name, and forwards every accepted stream to the
//! coordinator. Streams are handed over before any read loop runs; the
//! coordinator registers them and then starts them.
//!
//! With TLS enabled each handshake runs in its own task, bounded by the
//! handshake timeout and owned by the accept loop, so stopping the listener
//! also drops any half-open handshake.

use crate::connection::{BoxedStream, DEFAULT_CONNECT_TIMEOUT};
use crate::discovery::{Advertisement, ServiceDiscovery};
use crate::message::PROTOCOL_VERSION;
use crate::tls::TlsSettings;
use peerswitch_types::error::NetworkResult;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// TXT key for the protocol version.
pub const TXT_VERSION: &str = "version";
/// TXT key for the stable host identifier.
pub const TXT_HOST_ID: &str = "hostId";
/// TXT key for the display host name.
pub const TXT_HOST_NAME: &str = "hostName";

/// A stream accepted by the listener, not yet wrapped in a link.
pub struct AcceptedStream {
    pub stream: BoxedStream,
    pub remote: SocketAddr,
}

impl std::fmt::Debug for AcceptedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceptedStream")
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

struct Active {
    task: JoinHandle<()>,
    local_addr: SocketAddr,
    instance: String,
}

/// Advertises the node and accepts inbound links.
pub struct PeerListener {
    discovery: Arc<dyn ServiceDiscovery>,
    service_type: String,
    listen_addr: SocketAddr,
    tls: Option<TlsSettings>,
    handshake_timeout: Duration,
    active: Mutex<Option<Active>>,
}

impl PeerListener {
    pub fn new(
        discovery: Arc<dyn ServiceDiscovery>,
        service_type: impl Into<String>,
        listen_addr: SocketAddr,
        tls: Option<TlsSettings>,
    ) -> Self {
        Self {
            discovery,
            service_type: service_type.into(),
            listen_addr,
            tls,
            handshake_timeout: DEFAULT_CONNECT_TIMEOUT,
            active: Mutex::new(None),
        }
    }

    /// Time an inbound TLS client gets to finish its handshake.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Bind, advertise and start accepting.
    ///
    /// Any previous listener is stopped first. Returns the bound address.
    pub async fn start_listening(
        &self,
        host_name: &str,
        host_id: &str,
        accepted: mpsc::UnboundedSender<AcceptedStream>,
    ) -> NetworkResult<SocketAddr> {
        self.stop_listening();

        let listener = TcpListener::bind(self.listen_addr).await?;
        let local_addr = listener.local_addr()?;

        let mut txt = HashMap::new();
        txt.insert(TXT_VERSION.to_string(), PROTOCOL_VERSION.to_string());
        txt.insert(TXT_HOST_ID.to_string(), host_id.to_string());
        txt.insert(TXT_HOST_NAME.to_string(), host_name.to_string());
        let ad = Advertisement {
            instance: host_name.to_string(),
            service_type: self.service_type.clone(),
            port: local_addr.port(),
            addresses: Vec::new(),
            txt,
        };
        self.discovery.advertise(&ad)?;

        info!(
            "Listening on {} as '{}' (host_id={})",
            local_addr, host_name, host_id
        );

        let tls = self.tls.clone();
        let task = tokio::spawn(accept_loop(listener, tls, self.handshake_timeout, accepted));

        let previous = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(Active {
                task,
                local_addr,
                instance: host_name.to_string(),
            });
        if let Some(prev) = previous {
            // Lost a race with a concurrent start.
            prev.task.abort();
        }
        Ok(local_addr)
    }

    /// Stop accepting and withdraw the advertisement.
    pub fn stop_listening(&self) {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(active) = active {
            active.task.abort();
            if let Err(e) = self.discovery.withdraw(&active.instance, &self.service_type) {
                warn!(error = %e, "Failed to withdraw advertisement");
            }
            debug!("Stopped listening on {}", active.local_addr);
        }
    }

    /// Bound address while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|a| a.local_addr)
    }
}

impl Drop for PeerListener {
    fn drop(&mut self) {
        self.stop_listening();
    }
}

async fn accept_loop(
    listener: TcpListener,
    tls: Option<TlsSettings>,
    handshake_timeout: Duration,
    accepted: mpsc::UnboundedSender<AcceptedStream>,
) {
    // Dropped with this task, which aborts every pending handshake.
    let mut handshakes = JoinSet::new();
    loop {
        while handshakes.try_join_next().is_some() {}
        match listener.accept().await {
            Ok((tcp, remote)) => {
                debug!("Accepted connection from {}", remote);
                let _ = tcp.set_nodelay(true);
                match &tls {
                    None => {
                        if accepted
                            .send(AcceptedStream {
                                stream: Box::new(tcp),
                                remote,
                            })
                            .is_err()
                        {
                            return;
                        }
                    }
                    Some(tls) => {
                        // Handshake off the accept path so a slow peer cannot stall it.
                        handshakes.spawn(tls_handshake(
                            tls.clone(),
                            tcp,
                            remote,
                            handshake_timeout,
                            accepted.clone(),
                        ));
                    }
                }
            }
            Err(e) => {
                error!("Accept error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn tls_handshake(
    tls: TlsSettings,
    tcp: TcpStream,
    remote: SocketAddr,
    timeout: Duration,
    accepted: mpsc::UnboundedSender<AcceptedStream>,
) {
    match tokio::time::timeout(timeout, tls.acceptor().accept(tcp)).await {
        Ok(Ok(stream)) => {
            let _ = accepted.send(AcceptedStream {
                stream: Box::new(stream),
                remote,
            });
        }
        Ok(Err(e)) => warn!("TLS handshake with {} failed: {}", remote, e),
        Err(_) => warn!(
            "TLS handshake with {} not finished within {:?}, closing",
            remote, timeout
        ),
    }
}
