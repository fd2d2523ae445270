//! PeerSwitch kernel: handoff orchestration and node assembly.
//!
//! The kernel drives a [`DeviceController`](device::DeviceController) and the
//! wire layer's [`NetworkCoordinator`](peerswitch_wire::NetworkCoordinator):
//! it runs handoffs, serves the peer side of them, keeps registered hosts and
//! remembered device addresses on disk, and boots a complete node.

pub mod battery;
pub mod config;
pub mod device;
pub mod error;
pub mod handoff;
pub mod hosts;
pub mod node;
pub mod notify;
pub mod retry;
pub mod store;

pub use node::SwitchNode;
