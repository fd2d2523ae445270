//! Device controller backed by the `blueutil` command-line tool.
//!
//! Release unpairs the device so that another machine can pair it; acquire
//! pairs and connects. Only keyboards, mice and trackpads are reported.

use async_trait::async_trait;
use peerswitch_kernel::device::DeviceController;
use peerswitch_types::device::{ConnectionStatus, Device, DeviceKind};
use peerswitch_types::error::DeviceError;
use serde::Deserialize;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info};

const INPUT_DEVICE_HINTS: &[&str] = &["keyboard", "mouse", "trackpad"];

/// One entry of `blueutil --paired --format json`.
#[derive(Debug, Deserialize)]
struct PairedEntry {
    address: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    connected: bool,
}

/// Parse `blueutil --paired --format json` output into input devices.
pub fn parse_paired(json: &str) -> Result<Vec<Device>, DeviceError> {
    let entries: Vec<PairedEntry> = serde_json::from_str(json)
        .map_err(|e| DeviceError::ControllerUnavailable(format!("unexpected blueutil output: {e}")))?;

    Ok(entries
        .into_iter()
        .filter_map(|entry| {
            let name = entry.name.unwrap_or_default();
            let lower = name.to_lowercase();
            if !INPUT_DEVICE_HINTS.iter().any(|hint| lower.contains(hint)) {
                return None;
            }
            Some(Device {
                address: entry.address,
                kind: DeviceKind::from_name(&name),
                status: if entry.connected {
                    ConnectionStatus::Connected
                } else {
                    ConnectionStatus::Disconnected
                },
                name,
                battery_level: None,
            })
        })
        .collect())
}

pub struct BlueutilController {
    binary: PathBuf,
}

impl BlueutilController {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn execute(&self, args: &[&str]) -> Result<String, String> {
        debug!(binary = %self.binary.display(), ?args, "Executing blueutil");
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| format!("failed to launch {}: {e}", self.binary.display()))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() { stdout.trim().to_string() } else { stderr };
        Err(format!("exit {}: {message}", output.status.code().unwrap_or(-1)))
    }
}

#[async_trait]
impl DeviceController for BlueutilController {
    async fn discover_paired_devices(&self) -> Result<Vec<Device>, DeviceError> {
        let json = self
            .execute(&["--paired", "--format", "json"])
            .await
            .map_err(DeviceError::ControllerUnavailable)?;
        parse_paired(&json)
    }

    async fn release(&self, device: &Device) -> Result<(), DeviceError> {
        info!(address = %device.address, "Unpairing device via blueutil");
        self.execute(&["--unpair", &device.address])
            .await
            .map_err(|reason| DeviceError::UnpairFailed {
                address: device.address.clone(),
                reason,
            })?;
        Ok(())
    }

    async fn acquire(&self, device: &Device) -> Result<(), DeviceError> {
        info!(address = %device.address, "Pairing device via blueutil");
        self.execute(&["--pair", &device.address])
            .await
            .map_err(|reason| DeviceError::PairFailed {
                address: device.address.clone(),
                reason,
            })?;
        self.connect(device).await
    }

    async fn connect(&self, device: &Device) -> Result<(), DeviceError> {
        self.execute(&["--connect", &device.address])
            .await
            .map_err(|reason| DeviceError::ConnectFailed {
                address: device.address.clone(),
                reason,
            })?;
        Ok(())
    }

    async fn disconnect(&self, device: &Device) -> Result<(), DeviceError> {
        self.execute(&["--disconnect", &device.address])
            .await
            .map_err(|reason| DeviceError::DisconnectFailed {
                address: device.address.clone(),
                reason,
            })?;
        Ok(())
    }

    async fn is_connected(&self, device: &Device) -> bool {
        match self.execute(&["--is-connected", &device.address]).await {
            Ok(out) => out.trim() == "1",
            Err(e) => {
                debug!(address = %device.address, error = %e, "Connection query failed");
                false
            }
        }
    }

    // blueutil does not expose battery levels.
    async fn battery_level(&self, _device: &Device) -> Option<u8> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAIRED: &str = r#"[
        {"address": "aa-bb-cc-dd-ee-01", "name": "Magic Keyboard", "connected": true, "paired": true},
        {"address": "aa-bb-cc-dd-ee-02", "name": "Magic Trackpad", "connected": false, "paired": true},
        {"address": "aa-bb-cc-dd-ee-03", "name": "AirPods Pro", "connected": true, "paired": true},
        {"address": "aa-bb-cc-dd-ee-04", "paired": true}
    ]"#;

    #[test]
    fn parse_keeps_input_devices_only() {
        let devices = parse_paired(PAIRED).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].kind, DeviceKind::Keyboard);
        assert!(devices[0].is_connected());
        assert_eq!(devices[1].kind, DeviceKind::PointingDevice);
        assert_eq!(devices[1].status, ConnectionStatus::Disconnected);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(
            parse_paired("Bluetooth is off"),
            Err(DeviceError::ControllerUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let controller = BlueutilController::new("/nonexistent/blueutil");
        assert!(matches!(
            controller.discover_paired_devices().await,
            Err(DeviceError::ControllerUnavailable(_))
        ));
        assert!(!controller.is_connected(&Device::from_address("aa")).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn drives_a_blueutil_compatible_binary() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("blueutil");
        std::fs::write(
            &script,
            "#!/bin/sh\n\
             case \"$1\" in\n\
               --is-connected) echo 1 ;;\n\
               --unpair) echo 'unpair refused' >&2; exit 1 ;;\n\
               *) exit 0 ;;\n\
             esac\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let controller = BlueutilController::new(&script);
        let device = Device::from_address("aa-bb");
        assert!(controller.is_connected(&device).await);
        controller.acquire(&device).await.unwrap();
        match controller.release(&device).await {
            Err(DeviceError::UnpairFailed { reason, .. }) => assert!(reason.contains("unpair refused")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
