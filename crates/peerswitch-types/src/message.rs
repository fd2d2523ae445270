//! Peer command vocabulary.
//!
//! Peers exchange single-line commands drawn from a closed set. The framing
//! itself lives in `peerswitch-wire`; this module only names the commands.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// A command understood by every peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceCommand {
    /// Keep-alive probe; answered with `OP_SUCCESS`.
    HealthCheck,
    /// Ask the receiver to release every device it holds.
    UnregisterAll,
    /// Ask the receiver to acquire the listed devices.
    ConnectAll,
    /// Positive response to the last request.
    OpSuccess,
    /// Negative response to the last request.
    OpFailed,
    /// Free-form notification to surface to the user.
    Notification,
    /// Reserved.
    SyncPeripherals,
    /// Reserved.
    PeripheralData,
}

impl DeviceCommand {
    /// Every command, in wire-table order.
    pub const ALL: [DeviceCommand; 8] = [
        DeviceCommand::HealthCheck,
        DeviceCommand::UnregisterAll,
        DeviceCommand::ConnectAll,
        DeviceCommand::OpSuccess,
        DeviceCommand::OpFailed,
        DeviceCommand::Notification,
        DeviceCommand::SyncPeripherals,
        DeviceCommand::PeripheralData,
    ];

    /// The on-wire tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceCommand::HealthCheck => "HEALTH_CHECK",
            DeviceCommand::UnregisterAll => "UNREGISTER_ALL",
            DeviceCommand::ConnectAll => "CONNECT_ALL",
            DeviceCommand::OpSuccess => "OP_SUCCESS",
            DeviceCommand::OpFailed => "OP_FAILED",
            DeviceCommand::Notification => "NOTIFICATION",
            DeviceCommand::SyncPeripherals => "SYNC_PERIPHERALS",
            DeviceCommand::PeripheralData => "PERIPHERAL_DATA",
        }
    }

    /// True for `OP_SUCCESS` / `OP_FAILED`.
    pub fn is_response(&self) -> bool {
        matches!(self, DeviceCommand::OpSuccess | DeviceCommand::OpFailed)
    }
}

impl std::fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a tag is not part of the vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCommand(pub String);

impl std::fmt::Display for UnknownCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown command: {}", self.0)
    }
}

impl std::error::Error for UnknownCommand {}

impl FromStr for DeviceCommand {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceCommand::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| UnknownCommand(s.to_string()))
    }
}

/// A command plus its optional payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMessage {
    pub command: DeviceCommand,
    pub payload: Option<String>,
}

impl DeviceMessage {
    /// A message without payload.
    pub fn new(command: DeviceCommand) -> Self {
        Self {
            command,
            payload: None,
        }
    }

    /// A message carrying a text payload.
    pub fn with_payload(command: DeviceCommand, payload: impl Into<String>) -> Self {
        Self {
            command,
            payload: Some(payload.into()),
        }
    }

    /// A message carrying a comma-joined address list.
    ///
    /// An empty list produces a message without payload.
    pub fn with_addresses<S: AsRef<str>>(command: DeviceCommand, addresses: &[S]) -> Self {
        if addresses.is_empty() {
            return Self::new(command);
        }
        let joined = addresses
            .iter()
            .map(|a| a.as_ref())
            .collect::<Vec<_>>()
            .join(",");
        Self::with_payload(command, joined)
    }

    /// Split the payload as a comma-joined address list.
    pub fn addresses(&self) -> Vec<String> {
        self.payload
            .as_deref()
            .map(|p| {
                p.split(',')
                    .map(str::trim)
                    .filter(|a| !a.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_tags_roundtrip() {
        for cmd in DeviceCommand::ALL {
            assert_eq!(cmd.as_str().parse::<DeviceCommand>().unwrap(), cmd);
        }
        assert!("PING".parse::<DeviceCommand>().is_err());
        assert!("health_check".parse::<DeviceCommand>().is_err());
    }

    #[test]
    fn test_addresses() {
        let msg = DeviceMessage::with_addresses(DeviceCommand::ConnectAll, &["a", "b"]);
        assert_eq!(msg.payload.as_deref(), Some("a,b"));
        assert_eq!(msg.addresses(), vec!["a", "b"]);

        let empty = DeviceMessage::with_addresses::<&str>(DeviceCommand::ConnectAll, &[]);
        assert!(empty.payload.is_none());
        assert!(empty.addresses().is_empty());
    }

    #[test]
    fn test_is_response() {
        assert!(DeviceCommand::OpSuccess.is_response());
        assert!(DeviceCommand::OpFailed.is_response());
        assert!(!DeviceCommand::HealthCheck.is_response());
    }
}
