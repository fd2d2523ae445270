//! Wireless input device snapshots.
//!
//! A [`Device`] is an immutable value describing one paired peripheral at the
//! moment it was enumerated. Snapshots are never cached: every discovery call
//! produces a fresh list.

use serde::{Deserialize, Serialize};

/// Kind of input peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Keyboard,
    PointingDevice,
}

impl DeviceKind {
    /// Guess the kind from a device display name.
    ///
    /// Anything that does not look like a keyboard is treated as a pointing
    /// device (trackpad or mouse).
    pub fn from_name(name: &str) -> Self {
        if name.to_lowercase().contains("keyboard") {
            DeviceKind::Keyboard
        } else {
            DeviceKind::PointingDevice
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::Keyboard => write!(f, "keyboard"),
            DeviceKind::PointingDevice => write!(f, "pointing-device"),
        }
    }
}

/// Link status of a single device as reported by the device controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Connecting,
    Disconnecting,
    Disconnected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Disconnecting => "disconnecting",
            ConnectionStatus::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// A paired wireless input device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Stable hardware address, e.g. `aa-bb-cc-dd-ee-ff`.
    pub address: String,
    /// Display name.
    pub name: String,
    /// Keyboard or pointing device.
    pub kind: DeviceKind,
    /// Link status at snapshot time.
    pub status: ConnectionStatus,
    /// Battery percentage (0-100), if the device reports one.
    pub battery_level: Option<u8>,
}

impl Device {
    /// Snapshot for a device known only by its address.
    pub fn from_address(address: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            name: format!("Device-{address}"),
            address,
            kind: DeviceKind::Keyboard,
            status: ConnectionStatus::Disconnected,
            battery_level: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

/// Aggregate link status across a set of devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateStatus {
    /// Every device is connected to this node.
    AllConnected,
    /// No device is connected to this node.
    AllDisconnected,
    /// Some devices are connected and some are not.
    Partial,
}

impl AggregateStatus {
    /// Fold per-device connectivity into an aggregate.
    ///
    /// An empty set counts as all-disconnected.
    pub fn from_flags(flags: &[bool]) -> Self {
        let connected = flags.iter().filter(|c| **c).count();
        if connected == 0 {
            AggregateStatus::AllDisconnected
        } else if connected == flags.len() {
            AggregateStatus::AllConnected
        } else {
            AggregateStatus::Partial
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_status() {
        assert_eq!(
            AggregateStatus::from_flags(&[true, true]),
            AggregateStatus::AllConnected
        );
        assert_eq!(
            AggregateStatus::from_flags(&[false, false]),
            AggregateStatus::AllDisconnected
        );
        assert_eq!(
            AggregateStatus::from_flags(&[true, false]),
            AggregateStatus::Partial
        );
        assert_eq!(
            AggregateStatus::from_flags(&[]),
            AggregateStatus::AllDisconnected
        );
    }

    #[test]
    fn test_kind_from_name() {
        assert_eq!(DeviceKind::from_name("Magic Keyboard"), DeviceKind::Keyboard);
        assert_eq!(
            DeviceKind::from_name("Magic Trackpad"),
            DeviceKind::PointingDevice
        );
    }

    #[test]
    fn test_device_serde() {
        let d = Device {
            address: "aa-bb-cc-dd-ee-ff".to_string(),
            name: "Magic Keyboard".to_string(),
            kind: DeviceKind::Keyboard,
            status: ConnectionStatus::Connected,
            battery_level: Some(80),
        };
        let json = serde_json::to_string(&d).unwrap();
        assert!(json.contains("\"keyboard\""));
        let back: Device = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }
}
