//! Registered host commands: list, add, remove.

use super::{fail, runtime};
use crate::table::Table;
use crate::ui;
use peerswitch_kernel::hosts::HostDirectory;
use peerswitch_kernel::store::JsonStore;
use peerswitch_types::config::NodeConfig;
use peerswitch_types::host::RegisteredHost;

fn directory(config: &NodeConfig) -> HostDirectory {
    HostDirectory::new(JsonStore::new(&config.data_dir), config.max_hosts)
}

/// Last-seen column text.
pub(crate) fn last_seen(host: &RegisteredHost) -> String {
    host.last_seen
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "never".to_string())
}

pub fn cmd_hosts_list(config: &NodeConfig, json: bool) {
    let hosts = runtime().block_on(directory(config).list());
    if json {
        match serde_json::to_string_pretty(&hosts) {
            Ok(out) => println!("{out}"),
            Err(e) => {
                ui::error(&format!("Failed to encode hosts: {e}"));
                std::process::exit(1);
            }
        }
        return;
    }
    if hosts.is_empty() {
        ui::hint("No hosts registered. Add one with `peerswitch hosts add <label> <host-name>`.");
        return;
    }
    let mut table = Table::new(&["Label", "Host name", "Peer id", "Last seen"]);
    for host in &hosts {
        table.add_row(&[
            host.label.clone(),
            host.host_name.clone(),
            host.peer_host_id.clone().unwrap_or_else(|| "-".to_string()),
            last_seen(host),
        ]);
    }
    table.print();
}

pub fn cmd_hosts_add(config: &NodeConfig, label: &str, host_name: &str) {
    match runtime().block_on(directory(config).add(label, host_name)) {
        Ok(host) => ui::success(&format!("Registered '{}' ({})", host.label, host.host_name)),
        Err(e) => fail(&e),
    }
}

pub fn cmd_hosts_remove(config: &NodeConfig, needle: &str) {
    match runtime().block_on(directory(config).remove(needle)) {
        Ok(host) => ui::success(&format!("Removed '{}'", host.label)),
        Err(e) => fail(&e),
    }
}
