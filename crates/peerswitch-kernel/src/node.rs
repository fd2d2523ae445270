//! SwitchNode: one running PeerSwitch instance.
//!
//! Boot wires the trust store, TLS, the discovery backend, the network
//! coordinator and the handoff orchestrator together, registers the
//! orchestrator as the command handler and starts the coordinator.

use crate::battery::BatteryMonitor;
use crate::config::resolve_host_id;
use crate::device::DeviceController;
use crate::error::{KernelError, KernelResult};
use crate::handoff::{HandoffOrchestrator, HandoffSettings};
use crate::hosts::HostDirectory;
use crate::notify::Notifier;
use crate::store::JsonStore;
use peerswitch_types::config::NodeConfig;
use peerswitch_types::error::PeerSwitchError;
use peerswitch_types::host::RegisteredHost;
use peerswitch_wire::{
    CoordinatorConfig, MdnsDiscovery, NetworkCoordinator, ServiceDiscovery, TlsIdentity,
    TlsSettings, TrustStore,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

/// A booted node.
pub struct SwitchNode {
    config: NodeConfig,
    host_id: String,
    local_addr: SocketAddr,
    discovery: Arc<dyn ServiceDiscovery>,
    coordinator: Arc<NetworkCoordinator>,
    orchestrator: Arc<HandoffOrchestrator>,
    hosts: HostDirectory,
    trust: Option<TrustStore>,
    battery: Arc<BatteryMonitor>,
    battery_task: Mutex<Option<JoinHandle<()>>>,
}

impl SwitchNode {
    /// Boot with multicast DNS discovery.
    pub async fn boot(
        config: NodeConfig,
        devices: Arc<dyn DeviceController>,
        notifier: Arc<dyn Notifier>,
    ) -> KernelResult<Self> {
        let discovery = MdnsDiscovery::new()
            .map_err(|e| KernelError::BootFailed(format!("mDNS unavailable: {e}")))?;
        Self::boot_with_discovery(config, Arc::new(discovery), devices, notifier).await
    }

    /// Boot over an explicit discovery backend.
    pub async fn boot_with_discovery(
        config: NodeConfig,
        discovery: Arc<dyn ServiceDiscovery>,
        devices: Arc<dyn DeviceController>,
        notifier: Arc<dyn Notifier>,
    ) -> KernelResult<Self> {
        std::fs::create_dir_all(&config.data_dir).map_err(PeerSwitchError::from)?;
        let host_id = resolve_host_id(&config)?;
        info!(host = %config.host_name, host_id = %host_id, "Booting PeerSwitch node");

        let (tls, trust) = if config.use_tls {
            let identity = TlsIdentity::load_or_generate(&config.data_dir, &config.host_name)?;
            let trust = TrustStore::open_in(&config.data_dir);
            info!(fingerprint = %identity.fingerprint(), trusted = trust.len(), "TLS enabled");
            (Some(TlsSettings::new(&identity, trust.clone())?), Some(trust))
        } else {
            warn!("TLS disabled; peer links are plain TCP");
            (None, None)
        };

        let coordinator = NetworkCoordinator::new(
            CoordinatorConfig::from_node_config(&config, host_id.clone()),
            Arc::clone(&discovery),
            tls,
        );

        let store = JsonStore::new(&config.data_dir);
        let battery = Arc::new(BatteryMonitor::new(
            Arc::clone(&devices),
            Arc::clone(&notifier),
            config.low_battery_threshold,
        ));
        let orchestrator = Arc::new(HandoffOrchestrator::new(
            devices,
            coordinator.clone(),
            store.clone(),
            notifier,
            HandoffSettings::from(&config),
        ));
        coordinator.set_command_handler(orchestrator.clone());

        let local_addr = coordinator.start().await?;
        let hosts = HostDirectory::new(store, config.max_hosts);

        Ok(Self {
            config,
            host_id,
            local_addr,
            discovery,
            coordinator,
            orchestrator,
            hosts,
            trust,
            battery,
            battery_task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn coordinator(&self) -> &Arc<NetworkCoordinator> {
        &self.coordinator
    }

    pub fn orchestrator(&self) -> &Arc<HandoffOrchestrator> {
        &self.orchestrator
    }

    pub fn hosts(&self) -> &HostDirectory {
        &self.hosts
    }

    /// Trust store, when TLS is on.
    pub fn trust(&self) -> Option<&TrustStore> {
        self.trust.as_ref()
    }

    /// Registered hosts with online flags from the live peer table.
    pub async fn refresh_hosts(&self) -> KernelResult<Vec<RegisteredHost>> {
        Ok(self
            .hosts
            .refresh(&self.coordinator.discovered_peers())
            .await?)
    }

    /// Wait until the registered host matching `needle` is online.
    pub async fn wait_for_host(
        &self,
        needle: &str,
        timeout: Duration,
    ) -> KernelResult<RegisteredHost> {
        let deadline = Instant::now() + timeout;
        loop {
            let hosts = self.refresh_hosts().await?;
            let host = hosts
                .into_iter()
                .find(|h| h.matches(needle))
                .ok_or_else(|| PeerSwitchError::HostNotFound(needle.to_string()))?;
            if host.online || Instant::now() >= deadline {
                return Ok(host);
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    /// Hand every device off to the registered host matching `needle`.
    pub async fn switch_to(&self, needle: &str, discovery_timeout: Duration) -> KernelResult<()> {
        let host = self.wait_for_host(needle, discovery_timeout).await?;
        if !host.online {
            warn!(host = %host.label, "Host not seen on the network yet, trying anyway");
        }
        self.orchestrator.switch_all_devices(&host).await?;
        Ok(())
    }

    /// Start periodic battery checks. No-op when disabled in the config or
    /// already running.
    pub fn start_battery_monitor(&self) -> bool {
        let Some(interval) = self.config.battery_check_interval() else {
            return false;
        };
        let mut task = self.battery_task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return false;
        }
        *task = Some(Arc::clone(&self.battery).spawn(interval));
        true
    }

    /// Stop networking and flush persisted trust.
    pub async fn shutdown(&self) {
        let battery_task = self
            .battery_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = battery_task {
            task.abort();
        }
        self.coordinator.stop().await;
        if let Some(trust) = &self.trust {
            if let Err(e) = trust.flush() {
                warn!(error = %e, "Failed to flush trust store");
            }
        }
        self.discovery.shutdown();
        info!("PeerSwitch node stopped");
    }
}
