//! Periodic battery checks with low-battery notifications.
//!
//! A device is reported once when it drops to or below the threshold and is
//! not reported again until its level rises back above it.

use crate::device::DeviceController;
use crate::notify::Notifier;
use peerswitch_types::device::Device;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct BatteryMonitor {
    devices: Arc<dyn DeviceController>,
    notifier: Arc<dyn Notifier>,
    threshold: u8,
    notified: Mutex<HashSet<String>>,
}

impl BatteryMonitor {
    pub fn new(
        devices: Arc<dyn DeviceController>,
        notifier: Arc<dyn Notifier>,
        threshold: u8,
    ) -> Self {
        Self {
            devices,
            notifier,
            threshold,
            notified: Mutex::new(HashSet::new()),
        }
    }

    /// Query each device once. Returns the devices newly reported as low.
    pub async fn check(&self, devices: &[Device]) -> Vec<String> {
        let mut reported = Vec::new();
        for device in devices {
            let Some(level) = self.devices.battery_level(device).await else {
                continue;
            };
            debug!(address = %device.address, level, "Battery level");

            let newly_low = {
                let mut notified = self.notified.lock().unwrap_or_else(|e| e.into_inner());
                if level <= self.threshold {
                    notified.insert(device.address.clone())
                } else {
                    notified.remove(&device.address);
                    false
                }
            };
            if newly_low {
                warn!(address = %device.address, level, "Low battery");
                self.notifier.low_battery(device, level);
                reported.push(device.address.clone());
            }
        }
        reported
    }

    /// Re-discover and check devices every `interval` until the task is aborted.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        info!(threshold = self.threshold, interval_secs = interval.as_secs(), "Battery monitoring started");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match self.devices.discover_paired_devices().await {
                    Ok(devices) => {
                        self.check(&devices).await;
                    }
                    Err(e) => debug!(error = %e, "Battery check skipped"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{Notification, RecordingNotifier};
    use async_trait::async_trait;
    use peerswitch_types::error::DeviceError;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Levels(Mutex<HashMap<String, u8>>);

    impl Levels {
        fn set(&self, address: &str, level: u8) {
            self.0.lock().unwrap().insert(address.to_string(), level);
        }
    }

    #[async_trait]
    impl DeviceController for Levels {
        async fn discover_paired_devices(&self) -> Result<Vec<Device>, DeviceError> {
            Ok(self.0.lock().unwrap().keys().map(Device::from_address).collect())
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
        async fn is_connected(&self, _d: &Device) -> bool {
            true
        }
        async fn battery_level(&self, d: &Device) -> Option<u8> {
            self.0.lock().unwrap().get(&d.address).copied()
        }
    }

    #[tokio::test]
    async fn test_low_battery_reported_once_until_recharged() {
        let levels = Arc::new(Levels::default());
        let notifier = Arc::new(RecordingNotifier::new());
        let monitor = BatteryMonitor::new(levels.clone(), notifier.clone(), 20);
        let devices = vec![Device::from_address("aa"), Device::from_address("bb")];

        levels.set("aa", 15);
        levels.set("bb", 80);
        assert_eq!(monitor.check(&devices).await, vec!["aa".to_string()]);
        assert!(monitor.check(&devices).await.is_empty());

        levels.set("aa", 60);
        assert!(monitor.check(&devices).await.is_empty());
        levels.set("aa", 20);
        assert_eq!(monitor.check(&devices).await, vec!["aa".to_string()]);

        let lows = notifier
            .notifications()
            .into_iter()
            .filter(|n| matches!(n, Notification::LowBattery { .. }))
            .count();
        assert_eq!(lows, 2);
    }

    #[tokio::test]
    async fn test_devices_without_level_are_skipped() {
        let levels = Arc::new(Levels::default());
        let notifier = Arc::new(RecordingNotifier::new());
        let monitor = BatteryMonitor::new(levels, notifier.clone(), 20);
        assert!(monitor.check(&[Device::from_address("zz")]).await.is_empty());
        assert!(notifier.notifications().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_monitor_checks_on_interval() {
        let levels = Arc::new(Levels::default());
        levels.set("aa", 5);
        let notifier = Arc::new(RecordingNotifier::new());
        let monitor = Arc::new(BatteryMonitor::new(levels, notifier.clone(), 20));

        let handle = monitor.spawn(Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(notifier.notifications().is_empty());
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(notifier.notifications().len(), 1);
        handle.abort();
    }
}
