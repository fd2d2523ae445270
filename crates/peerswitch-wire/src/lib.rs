//! PeerSwitch wire layer: peer discovery, links and coordination.
//!
//! Nodes announce themselves over DNS-SD, discover siblings, and exchange
//! newline-framed commands over TCP (optionally TLS 1.3 with
//! trust-on-first-use).
//!
//! ## Architecture
//!
//! - **message**: line codec for the command vocabulary
//! - **TrustStore**: persisted certificate fingerprints for TOFU
//! - **PeerConnection**: one framed link with correlated request/response
//! - **PeerListener** / **PeerBrowser**: advertise and discover over a
//!   [`ServiceDiscovery`] backend
//! - **PeerTable**: discovered peers, deduplicated by service name
//! - **NetworkCoordinator**: owns links and the peer table, routes inbound
//!   commands to a [`CommandHandler`], and sends keep-alives

pub mod browser;
pub mod connection;
pub mod coordinator;
pub mod discovery;
pub mod listener;
pub mod message;
pub mod registry;
pub mod tls;
pub mod trust;

pub use browser::PeerBrowser;
pub use connection::{InboundMessage, PeerConnection};
pub use coordinator::{CommandHandler, CoordinatorConfig, NetworkCoordinator};
pub use discovery::{Advertisement, AdvertisementChange, MdnsDiscovery, MemoryDiscovery, ServiceDiscovery};
pub use listener::PeerListener;
pub use registry::PeerTable;
pub use tls::{TlsIdentity, TlsSettings};
pub use trust::TrustStore;
