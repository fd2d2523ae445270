//! Shared error types for PeerSwitch.
//!
//! Errors are layered: [`DeviceError`] for the device controller,
//! [`NetworkError`] for peer links and discovery, [`HandoffError`] for the
//! handoff state machine, and [`PeerSwitchError`] at the top for
//! configuration, persistence and host management.

use thiserror::Error;

/// Failures reported by the device controller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The radio is switched off.
    #[error("Bluetooth is disabled")]
    BluetoothDisabled,

    /// No paired device has this address.
    #[error("Device not found: {address}")]
    NotFound { address: String },

    /// Registering (pairing) the device locally failed.
    #[error("Pairing failed ({address}): {reason}")]
    PairFailed { address: String, reason: String },

    /// Unregistering the device locally failed.
    #[error("Unpairing failed ({address}): {reason}")]
    UnpairFailed { address: String, reason: String },

    #[error("Connect failed ({address}): {reason}")]
    ConnectFailed { address: String, reason: String },

    #[error("Disconnect failed ({address}): {reason}")]
    DisconnectFailed { address: String, reason: String },

    /// The device is paired but not reachable over the air.
    #[error("Device out of range: {address}")]
    OutOfRange { address: String },

    /// The controller backend itself is missing or broken.
    #[error("Device controller unavailable: {0}")]
    ControllerUnavailable(String),
}

impl DeviceError {
    /// A remedy to show the user, where one exists.
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            DeviceError::BluetoothDisabled => Some("Turn Bluetooth on in system settings"),
            DeviceError::NotFound { .. } | DeviceError::OutOfRange { .. } => {
                Some("Ensure the device is nearby and powered on")
            }
            DeviceError::PairFailed { .. } | DeviceError::ConnectFailed { .. } => {
                Some("Power-cycle the device and try again")
            }
            DeviceError::ControllerUnavailable(_) => {
                Some("Install blueutil or set blueutil_path in config.toml")
            }
            _ => None,
        }
    }
}

/// Failures of peer links, discovery and transport.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// No discovered peer matches the requested identifier.
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// The peer is known but a link could not be established.
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    /// The link did not reach the connected state in time.
    #[error("Connection to {peer} timed out after {seconds}s")]
    ConnectionTimeout { peer: String, seconds: u64 },

    /// A send was attempted on a link that is not connected.
    #[error("Connection is not established")]
    NotConnected,

    /// The remote side closed the link.
    #[error("Connection closed")]
    ConnectionClosed,

    /// No correlated reply arrived in time.
    #[error("No response within {seconds}s")]
    ResponseTimeout { seconds: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    /// The service-discovery backend failed.
    #[error("Discovery error: {0}")]
    Discovery(String),
}

impl NetworkError {
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            NetworkError::PeerNotFound(_) | NetworkError::PeerUnreachable(_) => {
                Some("Make sure the other machine is running PeerSwitch on the same network")
            }
            NetworkError::ConnectionTimeout { .. } | NetworkError::ResponseTimeout { .. } => {
                Some("Check the network connection and try again")
            }
            NetworkError::Tls(_) => {
                Some("Remove the stale fingerprint with `peerswitch trust forget` and reconnect")
            }
            _ => None,
        }
    }
}

/// Failures that end a handoff attempt. None of these are retried.
#[derive(Error, Debug)]
pub enum HandoffError {
    /// Another handoff is already running on this node.
    #[error("A handoff is already in progress")]
    Busy,

    #[error("No paired devices found")]
    NoDevices,

    /// Some devices are connected here and some are not.
    #[error("Only some devices are connected; refusing to hand off")]
    PartialConnection,

    /// The target peer did not answer in time.
    #[error("Handoff timed out after {seconds}s waiting for the peer")]
    ResponseTimeout { seconds: u64 },

    /// The target peer answered with something other than success.
    #[error("Peer rejected the handoff: {0}")]
    RemoteRejected(String),

    /// Some devices moved and some did not.
    #[error("Handoff partially failed. Succeeded: {}, failed: {}", .succeeded.join(", "), .failed.join(", "))]
    PartialFailure {
        succeeded: Vec<String>,
        failed: Vec<String>,
    },

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Network(#[from] NetworkError),
}

impl HandoffError {
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            HandoffError::Busy => Some("Wait for the current handoff to finish"),
            HandoffError::NoDevices => Some("Pair a keyboard or trackpad first"),
            HandoffError::PartialConnection => {
                Some("Bring all devices to the same connection state and retry")
            }
            HandoffError::ResponseTimeout { .. } => {
                Some("Check the network connection and try again")
            }
            HandoffError::Device(e) => e.recovery_suggestion(),
            HandoffError::Network(e) => e.recovery_suggestion(),
            _ => None,
        }
    }
}

/// Top-level error type.
#[derive(Error, Debug)]
pub enum PeerSwitchError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Reading or writing persisted state failed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The host directory is full.
    #[error("Maximum number of registered hosts reached ({max})")]
    MaxHostsReached { max: usize },

    #[error("Host not found: {0}")]
    HostNotFound(String),

    #[error(transparent)]
    Handoff(#[from] HandoffError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl PeerSwitchError {
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            PeerSwitchError::MaxHostsReached { .. } => {
                Some("Remove a host with `peerswitch hosts remove` first")
            }
            PeerSwitchError::HostNotFound(_) => Some("List hosts with `peerswitch hosts list`"),
            PeerSwitchError::Handoff(e) => e.recovery_suggestion(),
            PeerSwitchError::Network(e) => e.recovery_suggestion(),
            PeerSwitchError::Device(e) => e.recovery_suggestion(),
            _ => None,
        }
    }
}

/// Alias for results at the network layer.
pub type NetworkResult<T> = Result<T, NetworkError>;

/// Alias for results of a handoff.
pub type HandoffResult<T> = Result<T, HandoffError>;

/// Alias for Result with PeerSwitchError.
pub type PeerSwitchResult<T> = Result<T, PeerSwitchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_error_display() {
        let e = DeviceError::PairFailed {
            address: "aa".to_string(),
            reason: "boom".to_string(),
        };
        assert_eq!(e.to_string(), "Pairing failed (aa): boom");
        assert!(e.recovery_suggestion().is_some());
    }

    #[test]
    fn test_transparent_wrapping() {
        let e: HandoffError = NetworkError::PeerNotFound("desk".to_string()).into();
        assert_eq!(e.to_string(), "Peer not found: desk");
        assert!(e.recovery_suggestion().is_some());

        let top: PeerSwitchError = e.into();
        assert_eq!(top.to_string(), "Peer not found: desk");
    }

    #[test]
    fn test_partial_failure_display() {
        let e = HandoffError::PartialFailure {
            succeeded: vec!["a".to_string()],
            failed: vec!["b".to_string(), "c".to_string()],
        };
        assert_eq!(
            e.to_string(),
            "Handoff partially failed. Succeeded: a, failed: b, c"
        );
    }
}
