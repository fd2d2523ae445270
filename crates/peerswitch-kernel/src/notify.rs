//! User notifications.
//!
//! Notifications are fire-and-forget: the handoff never waits on them and a
//! failing notifier cannot fail a handoff.

use peerswitch_types::device::Device;
use peerswitch_types::error::HandoffError;
use peerswitch_types::host::RegisteredHost;
use std::sync::Mutex;
use tracing::{info, warn};

/// Sink for user-facing notifications.
pub trait Notifier: Send + Sync + 'static {
    fn switch_succeeded(&self, devices: &[Device], target: &RegisteredHost);

    fn switch_failed(&self, error: &HandoffError);

    /// Devices are in mixed states so nothing was moved.
    fn partial_connection(&self);

    /// A peer sent a `NOTIFICATION` command.
    fn remote_notification(&self, message: &str);

    fn low_battery(&self, _device: &Device, _level: u8) {}
}

/// Writes notifications to the log.
#[derive(Debug, Clone)]
pub struct TracingNotifier {
    enabled: bool,
}

impl TracingNotifier {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl Default for TracingNotifier {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Notifier for TracingNotifier {
    fn switch_succeeded(&self, devices: &[Device], target: &RegisteredHost) {
        if !self.enabled {
            return;
        }
        let names: Vec<&str> = devices.iter().map(|d| d.name.as_str()).collect();
        info!(target_host = %target.label, "Switched {} to {}", names.join(", "), target.label);
    }

    fn switch_failed(&self, error: &HandoffError) {
        if !self.enabled {
            return;
        }
        match error.recovery_suggestion() {
            Some(hint) => warn!("Switch failed: {error} ({hint})"),
            None => warn!("Switch failed: {error}"),
        }
    }

    fn partial_connection(&self) {
        if self.enabled {
            warn!("Cannot switch: only some devices are connected. Bring all devices to the same state and retry.");
        }
    }

    fn remote_notification(&self, message: &str) {
        if self.enabled {
            info!(message, "Notification from peer");
        }
    }

    fn low_battery(&self, device: &Device, level: u8) {
        if self.enabled {
            warn!(device = %device.name, level, "Battery low");
        }
    }
}

/// One recorded notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Succeeded { target: String, devices: usize },
    Failed(String),
    PartialConnection,
    Remote(String),
    LowBattery { device: String, level: u8 },
}

/// Keeps every notification in memory. Useful for embedding and tests.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn push(&self, n: Notification) {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).push(n);
    }
}

impl Notifier for RecordingNotifier {
    fn switch_succeeded(&self, devices: &[Device], target: &RegisteredHost) {
        self.push(Notification::Succeeded {
            target: target.label.clone(),
            devices: devices.len(),
        });
    }

    fn switch_failed(&self, error: &HandoffError) {
        self.push(Notification::Failed(error.to_string()));
    }

    fn partial_connection(&self) {
        self.push(Notification::PartialConnection);
    }

    fn remote_notification(&self, message: &str) {
        self.push(Notification::Remote(message.to_string()));
    }

    fn low_battery(&self, device: &Device, level: u8) {
        self.push(Notification::LowBattery {
            device: device.name.clone(),
            level,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_notifier_keeps_order() {
        let n = RecordingNotifier::new();
        n.partial_connection();
        n.switch_failed(&HandoffError::NoDevices);
        n.remote_notification("hello");
        assert_eq!(
            n.notifications(),
            vec![
                Notification::PartialConnection,
                Notification::Failed("No paired devices found".to_string()),
                Notification::Remote("hello".to_string()),
            ]
        );
    }

    #[test]
    fn test_disabled_tracing_notifier_is_silent() {
        // Only checks that nothing panics with notifications off.
        let n = TracingNotifier::new(false);
        n.partial_connection();
        n.switch_failed(&HandoffError::Busy);
    }
}
