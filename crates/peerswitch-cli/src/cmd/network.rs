//! Commands that bring a node onto the network: run, switch, peers, ping.

use super::{boot_node, fail, fail_kernel, runtime};
use crate::table::Table;
use crate::ui;
use peerswitch_kernel::SwitchNode;
use peerswitch_types::config::NodeConfig;
use peerswitch_types::error::{NetworkError, PeerSwitchError};
use peerswitch_types::message::{DeviceCommand, DeviceMessage};
use peerswitch_types::peer::PeerInfo;
use std::time::Duration;
use tracing::info;

fn print_identity(node: &SwitchNode) {
    ui::section("PeerSwitch node");
    ui::kv("Host", &node.config().host_name);
    ui::kv("Host id", node.host_id());
    ui::kv("Listening", &node.local_addr().to_string());
    if node.trust().is_some() {
        ui::kv_ok("TLS", "on (trust on first use)");
    } else {
        ui::kv_warn("TLS", "off");
    }
}

pub fn cmd_run(config: NodeConfig) {
    runtime().block_on(async {
        let node = boot_node(config).await;
        print_identity(&node);
        node.start_battery_monitor();
        ui::hint("Serving handoff requests. Press Ctrl+C to stop.");

        if let Err(e) = tokio::signal::ctrl_c().await {
            ui::error(&format!("Failed to listen for Ctrl+C: {e}"));
        }
        info!("Shutdown requested");
        node.shutdown().await;
    });
}

pub fn cmd_switch(config: NodeConfig, host: &str, wait: u64) {
    runtime().block_on(async {
        let node = boot_node(config).await;
        let result = node.switch_to(host, Duration::from_secs(wait)).await;
        node.shutdown().await;
        match result {
            Ok(()) => ui::success(&format!("Switched devices with '{host}'")),
            Err(e) => fail_kernel(&e),
        }
    });
}

pub fn cmd_peers(config: NodeConfig, secs: u64, json: bool) {
    let peers = runtime().block_on(async {
        let node = boot_node(config).await;
        tokio::time::sleep(Duration::from_secs(secs)).await;
        let mut peers = node.coordinator().discovered_peers();
        node.shutdown().await;
        peers.sort_by(|a, b| a.host_name.cmp(&b.host_name));
        peers
    });

    if json {
        match serde_json::to_string_pretty(&peers) {
            Ok(out) => println!("{out}"),
            Err(e) => {
                ui::error(&format!("Failed to encode peers: {e}"));
                std::process::exit(1);
            }
        }
        return;
    }
    if peers.is_empty() {
        ui::hint("No peers found. Is PeerSwitch running on the other machine?");
        return;
    }
    let mut table = Table::new(&["Host name", "Host id", "Version", "Endpoint"]);
    for peer in &peers {
        table.add_row(&[
            peer.host_name.clone(),
            peer_id_cell(peer),
            peer.version.clone(),
            endpoint_cell(peer),
        ]);
    }
    table.print();
}

fn peer_id_cell(peer: &PeerInfo) -> String {
    if peer.host_id_resolved {
        peer.host_id.clone()
    } else {
        "(unresolved)".to_string()
    }
}

fn endpoint_cell(peer: &PeerInfo) -> String {
    peer.endpoint
        .as_ref()
        .and_then(|e| e.socket_addrs().first().map(|a| a.to_string()))
        .unwrap_or_else(|| "-".to_string())
}

pub fn cmd_ping(config: NodeConfig, host: &str, wait: u64) {
    runtime().block_on(async {
        let node = boot_node(config).await;
        let result = ping(&node, host, Duration::from_secs(wait)).await;
        node.shutdown().await;
        match result {
            Ok(reply) if reply.command == DeviceCommand::OpSuccess => {
                ui::success(&format!("'{host}' is healthy"))
            }
            Ok(reply) => {
                ui::error(&format!("'{host}' answered {}", reply.command));
                std::process::exit(1);
            }
            Err(e) => fail(&e),
        }
    });
}

async fn ping(
    node: &SwitchNode,
    needle: &str,
    wait: Duration,
) -> Result<DeviceMessage, PeerSwitchError> {
    let host = node.wait_for_host(needle, wait).await.map_err(|e| match e {
        peerswitch_kernel::error::KernelError::PeerSwitch(e) => e,
        other => PeerSwitchError::Config(other.to_string()),
    })?;
    let coordinator = node.coordinator();
    let peer = host
        .peer_host_id
        .as_deref()
        .and_then(|id| coordinator.peer(id))
        .or_else(|| coordinator.find_peer_by_host_name(&host.host_name))
        .ok_or_else(|| NetworkError::PeerNotFound(host.label.clone()))?;

    let reply = coordinator
        .send_and_wait_to_peer(
            &peer.host_id,
            &DeviceMessage::new(DeviceCommand::HealthCheck),
            node.config().response_timeout(),
        )
        .await?;
    Ok(reply)
}
