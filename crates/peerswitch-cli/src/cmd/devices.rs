//! Paired device listing.

use super::{device_controller, runtime};
use crate::table::{Align, Table};
use crate::ui;
use peerswitch_kernel::device::DeviceController;
use peerswitch_types::config::NodeConfig;
use peerswitch_types::device::Device;

/// Battery column text, flagging levels at or under `threshold`.
fn battery_cell(level: Option<u8>, threshold: u8) -> String {
    match level {
        Some(level) if level <= threshold => format!("{level}% (low)"),
        Some(level) => format!("{level}%"),
        None => "-".to_string(),
    }
}

pub fn cmd_devices(config: &NodeConfig, json: bool) {
    let controller = device_controller(config);
    let devices: Vec<Device> = match runtime().block_on(async {
        let mut devices = controller.discover_paired_devices().await?;
        for device in devices.iter_mut() {
            if device.battery_level.is_none() {
                device.battery_level = controller.battery_level(device).await;
            }
        }
        Ok::<_, peerswitch_types::error::DeviceError>(devices)
    }) {
        Ok(devices) => devices,
        Err(e) => {
            match e.recovery_suggestion() {
                Some(fix) => ui::error_with_fix(&e.to_string(), fix),
                None => ui::error(&e.to_string()),
            }
            std::process::exit(1);
        }
    };

    if json {
        match serde_json::to_string_pretty(&devices) {
            Ok(out) => println!("{out}"),
            Err(e) => {
                ui::error(&format!("Failed to encode devices: {e}"));
                std::process::exit(1);
            }
        }
        return;
    }
    if devices.is_empty() {
        ui::hint("No paired keyboards, mice or trackpads found.");
        return;
    }

    let mut table = Table::new(&["Name", "Address", "Kind", "Status", "Battery"]).align(4, Align::Right);
    for device in &devices {
        table.add_row(&[
            device.name.clone(),
            device.address.clone(),
            device.kind.to_string(),
            device.status.to_string(),
            battery_cell(device.battery_level, config.low_battery_threshold),
        ]);
    }
    table.print();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn battery_cell_flags_low_levels() {
        assert_eq!(battery_cell(Some(20), 20), "20% (low)");
        assert_eq!(battery_cell(Some(21), 20), "21%");
        assert_eq!(battery_cell(None, 20), "-");
    }
}
