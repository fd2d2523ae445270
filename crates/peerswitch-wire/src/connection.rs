//! PeerConnection: one framed link to a single peer.
//!
//! A link is either dialled ([`PeerConnection::outbound`]) or wraps a stream
//! the listener already accepted ([`PeerConnection::accepted`]). After
//! [`start`](PeerConnection::start) a read loop splits the byte stream into
//! lines, decodes them, and delivers each message either to the one pending
//! correlated waiter (see [`send_and_wait`](PeerConnection::send_and_wait))
//! or to the inbound channel owned by the coordinator.
//!
//! Only one correlated wait may be outstanding per link. Callers serialise
//! their request/response exchanges; the link does not pipeline.

use crate::message::{decode_line, encode_message, LineBuffer};
use crate::tls::TlsSettings;
use peerswitch_types::error::{NetworkError, NetworkResult};
use peerswitch_types::message::{DeviceCommand, DeviceMessage};
use peerswitch_types::state::ConnectionState;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default time allowed for a link to come up.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Read chunk size.
const READ_CHUNK: usize = 8 * 1024;

/// Any bidirectional byte stream a link can run over (TCP, TLS, in-memory).
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> PeerStream for T {}

pub type BoxedStream = Box<dyn PeerStream>;

/// A message received on a link with no correlated waiter.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub connection_id: Uuid,
    pub message: DeviceMessage,
}

/// How the link gets its stream.
enum Transport {
    Outbound {
        addrs: Vec<SocketAddr>,
        tls: Option<TlsSettings>,
    },
    Accepted(BoxedStream),
}

/// One bidirectional link to a peer.
pub struct PeerConnection {
    id: Uuid,
    remote: String,
    /// Consumed by `start`.
    transport: Mutex<Option<Transport>>,
    state: watch::Sender<ConnectionState>,
    writer: tokio::sync::Mutex<Option<WriteHalf<BoxedStream>>>,
    pending: Mutex<Option<oneshot::Sender<DeviceMessage>>>,
    inbound: mpsc::UnboundedSender<InboundMessage>,
    read_task: Mutex<Option<JoinHandle<()>>>,
    connect_timeout: Duration,
    /// Keep-alives sent whose `OP_SUCCESS` has not come back yet.
    keepalives_outstanding: AtomicU32,
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl PeerConnection {
    fn new(
        remote: String,
        transport: Transport,
        inbound: mpsc::UnboundedSender<InboundMessage>,
        connect_timeout: Duration,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Arc::new(Self {
            id: Uuid::new_v4(),
            remote,
            transport: Mutex::new(Some(transport)),
            state,
            writer: tokio::sync::Mutex::new(None),
            pending: Mutex::new(None),
            inbound,
            read_task: Mutex::new(None),
            connect_timeout,
            keepalives_outstanding: AtomicU32::new(0),
        })
    }

    /// A link that dials `addrs` in order on `start`.
    pub fn outbound(
        remote: impl Into<String>,
        addrs: Vec<SocketAddr>,
        tls: Option<TlsSettings>,
        inbound: mpsc::UnboundedSender<InboundMessage>,
        connect_timeout: Duration,
    ) -> Arc<Self> {
        Self::new(
            remote.into(),
            Transport::Outbound { addrs, tls },
            inbound,
            connect_timeout,
        )
    }

    /// A link over a stream that is already established.
    pub fn accepted(
        remote: impl Into<String>,
        stream: BoxedStream,
        inbound: mpsc::UnboundedSender<InboundMessage>,
    ) -> Arc<Self> {
        Self::new(
            remote.into(),
            Transport::Accepted(stream),
            inbound,
            DEFAULT_CONNECT_TIMEOUT,
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Human-readable remote description.
    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Observe state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            // Disconnected is terminal.
            if *current == ConnectionState::Disconnected || *current == next {
                return false;
            }
            debug!(connection = %self.id, from = %current, to = %next, "Connection state");
            *current = next;
            true
        });
    }

    /// Bring the link up and start the read loop.
    ///
    /// Fails with `ConnectionTimeout` if the link is not up within the
    /// connect timeout, or `PeerUnreachable` if the transport fails.
    pub async fn start(self: &Arc<Self>) -> NetworkResult<()> {
        let transport = {
            let mut slot = self.transport.lock().unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        let Some(transport) = transport else {
            return match self.state() {
                ConnectionState::Connected => Ok(()),
                _ => Err(NetworkError::ConnectionClosed),
            };
        };

        self.set_state(ConnectionState::Connecting);

        let stream = match tokio::time::timeout(self.connect_timeout, self.establish(transport)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.set_state(ConnectionState::Failed(e.to_string()));
                return Err(e);
            }
            Err(_) => {
                self.set_state(ConnectionState::Failed("connect timeout".to_string()));
                return Err(NetworkError::ConnectionTimeout {
                    peer: self.remote.clone(),
                    seconds: self.connect_timeout.as_secs(),
                });
            }
        };

        let (reader, writer) = tokio::io::split(stream);
        *self.writer.lock().await = Some(writer);
        self.set_state(ConnectionState::Connected);
        if !self.is_connected() {
            // Stopped while connecting.
            return Err(NetworkError::ConnectionClosed);
        }

        let this = Arc::clone(self);
        let task = tokio::spawn(async move { this.read_loop(reader).await });
        *self.read_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);

        info!(connection = %self.id, remote = %self.remote, "Peer link established");
        Ok(())
    }

    async fn establish(&self, transport: Transport) -> NetworkResult<BoxedStream> {
        match transport {
            Transport::Accepted(stream) => Ok(stream),
            Transport::Outbound { addrs, tls } => {
                let mut last_err = None;
                for addr in &addrs {
                    match TcpStream::connect(addr).await {
                        Ok(tcp) => {
                            let _ = tcp.set_nodelay(true);
                            return match &tls {
                                Some(tls) => {
                                    let stream = tls
                                        .connector()
                                        .connect(TlsSettings::server_name()?, tcp)
                                        .await
                                        .map_err(|e| NetworkError::Tls(e.to_string()))?;
                                    Ok(Box::new(stream) as BoxedStream)
                                }
                                None => Ok(Box::new(tcp) as BoxedStream),
                            };
                        }
                        Err(e) => {
                            debug!(%addr, error = %e, "Dial failed");
                            last_err = Some(e);
                        }
                    }
                }
                let reason = last_err
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no address".to_string());
                Err(NetworkError::PeerUnreachable(format!(
                    "{}: {reason}",
                    self.remote
                )))
            }
        }
    }

    async fn read_loop(self: Arc<Self>, mut reader: ReadHalf<BoxedStream>) {
        let mut chunk = vec![0u8; READ_CHUNK];
        let mut lines = LineBuffer::new();
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => {
                    debug!(connection = %self.id, "Peer closed the link");
                    break;
                }
                Ok(n) => {
                    for line in lines.push(&chunk[..n]) {
                        if let Some(msg) = decode_line(&line) {
                            self.deliver(msg);
                        }
                    }
                }
                Err(e) => {
                    debug!(connection = %self.id, error = %e, "Read failed");
                    break;
                }
            }
        }
        // Wake any waiter with a closed channel.
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.set_state(ConnectionState::Disconnected);
    }

    /// Route one decoded message.
    ///
    /// Response commands satisfy the pending waiter when there is one;
    /// everything else goes to the inbound channel.
    fn deliver(&self, msg: DeviceMessage) {
        let msg = if msg.command.is_response() {
            let waiter = self.pending.lock().unwrap_or_else(|e| e.into_inner()).take();
            match waiter {
                Some(tx) => match tx.send(msg) {
                    Ok(()) => return,
                    // Waiter gave up already.
                    Err(msg) => msg,
                },
                None => msg,
            }
        } else {
            msg
        };

        if self
            .inbound
            .send(InboundMessage {
                connection_id: self.id,
                message: msg,
            })
            .is_err()
        {
            debug!(connection = %self.id, "Inbound channel closed, dropping message");
        }
    }

    /// Send one message. Rejected unless the link is connected.
    pub async fn send(&self, msg: &DeviceMessage) -> NetworkResult<()> {
        if !self.is_connected() {
            return Err(NetworkError::NotConnected);
        }
        let bytes = encode_message(msg);
        let mut writer = self.writer.lock().await;
        let w = writer.as_mut().ok_or(NetworkError::NotConnected)?;
        let result = async {
            w.write_all(&bytes).await?;
            w.flush().await
        }
        .await;
        if let Err(e) = result {
            warn!(connection = %self.id, error = %e, "Write failed");
            return Err(NetworkError::Io(e));
        }
        debug!(connection = %self.id, command = %msg.command, "Sent");
        Ok(())
    }

    /// Send `msg` and wait up to `timeout` for the next response command.
    ///
    /// The waiter is armed before the write so a fast reply cannot be lost.
    pub async fn send_and_wait(
        &self,
        msg: &DeviceMessage,
        timeout: Duration,
    ) -> NetworkResult<DeviceMessage> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            if pending.replace(tx).is_some() {
                warn!(connection = %self.id, "Replacing an outstanding correlated wait");
            }
        }

        if let Err(e) = self.send(msg).await {
            self.pending.lock().unwrap_or_else(|e| e.into_inner()).take();
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(NetworkError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().unwrap_or_else(|e| e.into_inner()).take();
                Err(NetworkError::ResponseTimeout {
                    seconds: timeout.as_secs(),
                })
            }
        }
    }

    /// Close the link. Terminal: a stopped link never reconnects.
    pub async fn stop(&self) {
        if let Some(task) = self.read_task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.transport.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.set_state(ConnectionState::Disconnected);
    }

    // ---- Keep-alive bookkeeping ----

    /// Send a keep-alive and count it as outstanding.
    pub async fn send_keepalive(&self) -> NetworkResult<()> {
        self.keepalives_outstanding.fetch_add(1, Ordering::SeqCst);
        let result = self.send(&DeviceMessage::new(DeviceCommand::HealthCheck)).await;
        if result.is_err() {
            self.take_keepalive_ack();
        }
        result
    }

    /// Consume one outstanding keep-alive. Returns false if none was owed.
    pub fn take_keepalive_ack(&self) -> bool {
        self.keepalives_outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};

    fn duplex_link() -> (
        Arc<PeerConnection>,
        DuplexStream,
        mpsc::UnboundedReceiver<InboundMessage>,
    ) {
        let (ours, theirs) = tokio::io::duplex(4096);
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = PeerConnection::accepted("test-peer", Box::new(ours), tx);
        (conn, theirs, rx)
    }

    #[tokio::test]
    async fn test_send_rejected_before_start() {
        let (conn, _theirs, _rx) = duplex_link();
        assert_eq!(conn.state(), ConnectionState::Idle);
        let err = conn
            .send(&DeviceMessage::new(DeviceCommand::HealthCheck))
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::NotConnected));
    }

    #[tokio::test]
    async fn test_inbound_requests_reach_channel() {
        let (conn, mut theirs, mut rx) = duplex_link();
        conn.start().await.unwrap();
        assert!(conn.is_connected());

        theirs
            .write_all(b"HEALTH_CHECK\nBOGUS\nCONNECT_ALL:aa,bb\n")
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.connection_id, conn.id());
        assert_eq!(first.message.command, DeviceCommand::HealthCheck);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.message.command, DeviceCommand::ConnectAll);
        assert_eq!(second.message.addresses(), vec!["aa", "bb"]);
    }

    #[tokio::test]
    async fn test_send_writes_line() {
        let (conn, theirs, _rx) = duplex_link();
        conn.start().await.unwrap();
        conn.send(&DeviceMessage::with_payload(DeviceCommand::Notification, "hi"))
            .await
            .unwrap();
        let mut reader = BufReader::new(theirs);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "NOTIFICATION:hi\n");
    }

    #[tokio::test]
    async fn test_send_and_wait_gets_reply() {
        let (conn, theirs, mut rx) = duplex_link();
        conn.start().await.unwrap();

        let peer = tokio::spawn(async move {
            let (r, mut w) = tokio::io::split(theirs);
            let mut reader = BufReader::new(r);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            assert_eq!(line, "HEALTH_CHECK\n");
            // A request arriving first must not satisfy the wait.
            w.write_all(b"HEALTH_CHECK\nOP_SUCCESS\n").await.unwrap();
            w
        });

        let reply = conn
            .send_and_wait(
                &DeviceMessage::new(DeviceCommand::HealthCheck),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(reply.command, DeviceCommand::OpSuccess);
        let inbound = rx.recv().await.unwrap();
        assert_eq!(inbound.message.command, DeviceCommand::HealthCheck);
        let _w = peer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_and_wait_times_out_on_silent_peer() {
        let (conn, _theirs, _rx) = duplex_link();
        conn.start().await.unwrap();

        let started = tokio::time::Instant::now();
        let err = conn
            .send_and_wait(
                &DeviceMessage::new(DeviceCommand::HealthCheck),
                Duration::from_secs(15),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::ResponseTimeout { seconds: 15 }));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(15));
        assert!(waited < Duration::from_secs(16));
    }

    #[tokio::test]
    async fn test_eof_disconnects_and_fails_waiter() {
        let (conn, theirs, _rx) = duplex_link();
        conn.start().await.unwrap();
        let mut states = conn.subscribe_state();

        let wait = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                conn.send_and_wait(
                    &DeviceMessage::new(DeviceCommand::UnregisterAll),
                    Duration::from_secs(30),
                )
                .await
            })
        };
        // Let the request go out, then hang up.
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(theirs);

        let result = wait.await.unwrap();
        assert!(matches!(result, Err(NetworkError::ConnectionClosed)));
        states
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_terminal() {
        let (conn, _theirs, _rx) = duplex_link();
        conn.start().await.unwrap();
        conn.stop().await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.start().await.is_err());
        assert!(conn
            .send(&DeviceMessage::new(DeviceCommand::HealthCheck))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_outbound_unreachable() {
        // Bind then drop to get a port nobody listens on.
        let addr = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap()
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = PeerConnection::outbound("nobody", vec![addr], None, tx, DEFAULT_CONNECT_TIMEOUT);
        let err = conn.start().await.unwrap_err();
        assert!(matches!(err, NetworkError::PeerUnreachable(_)));
        assert!(matches!(conn.state(), ConnectionState::Failed(_)));
    }

    #[tokio::test]
    async fn test_outbound_tcp_roundtrip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (r, mut w) = stream.into_split();
            let mut reader = BufReader::new(r);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            w.write_all(b"OP_FAILED\n").await.unwrap();
            line
        });

        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = PeerConnection::outbound("local", vec![addr], None, tx, DEFAULT_CONNECT_TIMEOUT);
        conn.start().await.unwrap();
        let reply = conn
            .send_and_wait(
                &DeviceMessage::with_addresses(DeviceCommand::ConnectAll, &["aa"]),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(reply.command, DeviceCommand::OpFailed);
        assert_eq!(server.await.unwrap(), "CONNECT_ALL:aa\n");
    }

    #[test]
    fn test_keepalive_accounting() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = PeerConnection::outbound("x", vec![], None, tx, DEFAULT_CONNECT_TIMEOUT);
        assert!(!conn.take_keepalive_ack());
        conn.keepalives_outstanding.store(2, Ordering::SeqCst);
        assert!(conn.take_keepalive_ack());
        assert!(conn.take_keepalive_ack());
        assert!(!conn.take_keepalive_ack());
    }
}
