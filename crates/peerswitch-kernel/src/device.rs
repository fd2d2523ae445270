//! Device controller capability.
//!
//! The kernel never touches the radio directly. It drives a
//! [`DeviceController`], which owns how devices are registered, unregistered,
//! connected and disconnected on this machine.

use async_trait::async_trait;
use peerswitch_types::device::{AggregateStatus, Device};
use peerswitch_types::error::DeviceError;
use std::time::Duration;
use tracing::{debug, warn};

/// Local control over paired wireless input devices.
#[async_trait]
pub trait DeviceController: Send + Sync + 'static {
    /// Fresh snapshot of every paired input device.
    async fn discover_paired_devices(&self) -> Result<Vec<Device>, DeviceError>;

    /// Detach the device from this machine so another one can take it.
    async fn release(&self, device: &Device) -> Result<(), DeviceError>;

    /// Register and connect the device on this machine.
    async fn acquire(&self, device: &Device) -> Result<(), DeviceError>;

    async fn connect(&self, device: &Device) -> Result<(), DeviceError>;

    async fn disconnect(&self, device: &Device) -> Result<(), DeviceError>;

    async fn is_connected(&self, device: &Device) -> bool;

    async fn battery_level(&self, device: &Device) -> Option<u8>;

    /// Aggregate live connectivity across `devices`.
    async fn connection_status(&self, devices: &[Device]) -> AggregateStatus {
        let mut flags = Vec::with_capacity(devices.len());
        for device in devices {
            flags.push(self.is_connected(device).await);
        }
        AggregateStatus::from_flags(&flags)
    }

    /// Poll until no device in `devices` is connected.
    ///
    /// Returns false if some device is still connected after `max_attempts`
    /// checks spaced by `interval`.
    async fn poll_for_disconnection(
        &self,
        devices: &[Device],
        max_attempts: u32,
        interval: Duration,
    ) -> bool {
        for attempt in 1..=max_attempts.max(1) {
            let mut all_disconnected = true;
            for device in devices {
                if self.is_connected(device).await {
                    all_disconnected = false;
                    break;
                }
            }
            if all_disconnected {
                debug!(attempt, "All devices disconnected");
                return true;
            }
            tokio::time::sleep(interval).await;
        }
        warn!("Polling for disconnection timed out");
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerswitch_types::device::{ConnectionStatus, DeviceKind};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Devices in `connected` report connected; each check counts.
    struct StaticDevices {
        connected: Mutex<HashSet<String>>,
        checks: AtomicU32,
        disconnect_after: u32,
    }

    #[async_trait]
    impl DeviceController for StaticDevices {
        async fn discover_paired_devices(&self) -> Result<Vec<Device>, DeviceError> {
            Ok(Vec::new())
        }
        async fn release(&self, _d: &Device) -> Result<(), DeviceError> {
            Ok(())
        }
        async fn acquire(&self, _d: &Device) -> Result<(), DeviceError> {
            Ok(())
        }
        async fn connect(&self, _d: &Device) -> Result<(), DeviceError> {
            Ok(())
        }
        async fn disconnect(&self, _d: &Device) -> Result<(), DeviceError> {
            Ok(())
        }
        async fn is_connected(&self, d: &Device) -> bool {
            let n = self.checks.fetch_add(1, Ordering::SeqCst);
            if n >= self.disconnect_after {
                return false;
            }
            self.connected.lock().unwrap().contains(&d.address)
        }
        async fn battery_level(&self, _d: &Device) -> Option<u8> {
            None
        }
    }

    fn device(address: &str) -> Device {
        Device {
            address: address.to_string(),
            name: "Magic Keyboard".to_string(),
            kind: DeviceKind::Keyboard,
            status: ConnectionStatus::Connected,
            battery_level: Some(80),
        }
    }

    fn controller(connected: &[&str], disconnect_after: u32) -> StaticDevices {
        StaticDevices {
            connected: Mutex::new(connected.iter().map(|s| s.to_string()).collect()),
            checks: AtomicU32::new(0),
            disconnect_after,
        }
    }

    #[tokio::test]
    async fn test_connection_status() {
        let devices = vec![device("a"), device("b")];
        let c = controller(&["a"], u32::MAX);
        assert_eq!(c.connection_status(&devices).await, AggregateStatus::Partial);
        let c = controller(&["a", "b"], u32::MAX);
        assert_eq!(c.connection_status(&devices).await, AggregateStatus::AllConnected);
        let c = controller(&[], u32::MAX);
        assert_eq!(c.connection_status(&devices).await, AggregateStatus::AllDisconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_succeeds_once_devices_drop() {
        let devices = vec![device("a")];
        let c = controller(&["a"], 2);
        assert!(
            c.poll_for_disconnection(&devices, 5, Duration::from_millis(500))
                .await
        );
        assert_eq!(c.checks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_gives_up() {
        let devices = vec![device("a")];
        let c = controller(&["a"], u32::MAX);
        let start = tokio::time::Instant::now();
        assert!(
            !c.poll_for_disconnection(&devices, 5, Duration::from_millis(500))
                .await
        );
        assert_eq!(c.checks.load(Ordering::SeqCst), 5);
        assert!(start.elapsed() >= Duration::from_millis(2_500));
    }
}
