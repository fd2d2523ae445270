//! Handoff orchestrator: moves every paired input device between nodes.
//!
//! A handoff starts from the local aggregate device status:
//!
//! - **all connected** (push): release each device locally, wait for the
//!   radio to drop them, then ask the target to `CONNECT_ALL`.
//! - **all disconnected** (pull): ask the target to `UNREGISTER_ALL`, and on
//!   success acquire each device locally.
//! - **partial**: refuse without touching any device.
//!
//! At most one handoff runs per node. The state machine is
//! `idle -> switching(progress) -> completed | failed -> idle`, and every
//! transition is broadcast to subscribers in order.
//!
//! The orchestrator is also the node's [`CommandHandler`]: it serves the
//! peer's side of a handoff and records `OP_SUCCESS`/`OP_FAILED` replies for
//! the response wait.

use crate::device::DeviceController;
use crate::notify::Notifier;
use crate::retry::{retry_async, RetryPolicy};
use crate::store::{JsonStore, LAST_KNOWN_ADDRESSES_KEY};
use async_trait::async_trait;
use peerswitch_types::config::NodeConfig;
use peerswitch_types::device::{AggregateStatus, Device};
use peerswitch_types::error::{HandoffError, HandoffResult, NetworkError, NetworkResult};
use peerswitch_types::host::RegisteredHost;
use peerswitch_types::message::{DeviceCommand, DeviceMessage};
use peerswitch_types::peer::PeerInfo;
use peerswitch_types::state::{SwitchPhase, SwitchProgress, SwitchState};
use peerswitch_wire::{CommandHandler, NetworkCoordinator};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Capacity of the state broadcast channel.
const STATE_CHANNEL_CAPACITY: usize = 64;

/// Failure reason recorded when a handoff future is dropped mid-flight.
const CANCELLED: &str = "cancelled";

/// What the orchestrator needs from the network layer.
#[async_trait]
pub trait PeerMessenger: Send + Sync + 'static {
    /// Send to a discovered peer, connecting first if needed.
    async fn send_to_peer(&self, host_id: &str, msg: &DeviceMessage) -> NetworkResult<()>;

    fn peer(&self, host_id: &str) -> Option<PeerInfo>;

    fn find_peer_by_host_name(&self, host_name: &str) -> Option<PeerInfo>;
}

#[async_trait]
impl PeerMessenger for NetworkCoordinator {
    async fn send_to_peer(&self, host_id: &str, msg: &DeviceMessage) -> NetworkResult<()> {
        NetworkCoordinator::send_to_peer(self, host_id, msg).await
    }

    fn peer(&self, host_id: &str) -> Option<PeerInfo> {
        NetworkCoordinator::peer(self, host_id)
    }

    fn find_peer_by_host_name(&self, host_name: &str) -> Option<PeerInfo> {
        NetworkCoordinator::find_peer_by_host_name(self, host_name)
    }
}

/// Timing knobs for a handoff.
#[derive(Debug, Clone)]
pub struct HandoffSettings {
    pub retry: RetryPolicy,
    pub response_timeout: Duration,
    pub response_poll_interval: Duration,
    pub disconnect_poll_attempts: u32,
    pub disconnect_poll_interval: Duration,
}

impl Default for HandoffSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            response_timeout: Duration::from_secs(15),
            response_poll_interval: Duration::from_millis(200),
            disconnect_poll_attempts: 5,
            disconnect_poll_interval: Duration::from_millis(500),
        }
    }
}

impl From<&NodeConfig> for HandoffSettings {
    fn from(c: &NodeConfig) -> Self {
        Self {
            retry: RetryPolicy::from(&c.retry),
            response_timeout: c.response_timeout(),
            response_poll_interval: c.response_poll_interval(),
            disconnect_poll_attempts: c.disconnect_poll_attempts,
            disconnect_poll_interval: c.disconnect_poll_interval(),
        }
    }
}

/// Held for the lifetime of one handoff. Clears the in-flight flag when
/// dropped. A handoff dropped before it reached an outcome (its future was
/// cancelled) is settled as `failed("cancelled")` then `idle`.
struct InFlight<'a> {
    orchestrator: &'a HandoffOrchestrator,
    settled: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!("Handoff cancelled before it finished");
            self.orchestrator
                .set_state(SwitchState::Failed(CANCELLED.to_string()));
            self.orchestrator.set_state(SwitchState::Idle);
        }
        self.orchestrator.in_flight.store(false, Ordering::SeqCst);
    }
}

/// Runs handoffs and serves the peer side of them.
pub struct HandoffOrchestrator {
    devices: Arc<dyn DeviceController>,
    messenger: Arc<dyn PeerMessenger>,
    store: JsonStore,
    notifier: Arc<dyn Notifier>,
    settings: HandoffSettings,
    in_flight: AtomicBool,
    state: Mutex<SwitchState>,
    state_tx: broadcast::Sender<SwitchState>,
    /// Latest `OP_SUCCESS`/`OP_FAILED` received from any peer.
    pending_response: Mutex<Option<DeviceCommand>>,
}

impl HandoffOrchestrator {
    pub fn new(
        devices: Arc<dyn DeviceController>,
        messenger: Arc<dyn PeerMessenger>,
        store: JsonStore,
        notifier: Arc<dyn Notifier>,
        settings: HandoffSettings,
    ) -> Self {
        let (state_tx, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        Self {
            devices,
            messenger,
            store,
            notifier,
            settings,
            in_flight: AtomicBool::new(false),
            state: Mutex::new(SwitchState::Idle),
            state_tx,
            pending_response: Mutex::new(None),
        }
    }

    pub fn current_state(&self) -> SwitchState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Every state transition from now on, in order.
    pub fn subscribe(&self) -> broadcast::Receiver<SwitchState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, next: SwitchState) {
        debug!(state = %next, "Switch state");
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = next.clone();
        let _ = self.state_tx.send(next);
    }

    // ---- Handoff ----

    /// Move every paired device to or from `target`.
    ///
    /// Fails immediately with [`HandoffError::Busy`] while another handoff
    /// runs. On return the state is back to idle.
    pub async fn switch_all_devices(&self, target: &RegisteredHost) -> HandoffResult<()> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!(target_host = %target.label, "Handoff rejected: another one is running");
            return Err(HandoffError::Busy);
        }
        let mut in_flight = InFlight {
            orchestrator: self,
            settled: false,
        };

        info!(target_host = %target.label, "Switch initiated");
        let outcome = self.run(target).await;
        in_flight.settled = true;
        match outcome {
            Ok(devices) => {
                self.set_state(SwitchState::Completed);
                self.notifier.switch_succeeded(&devices, target);
                info!(target_host = %target.label, devices = devices.len(), "Switch completed");
                self.set_state(SwitchState::Idle);
                Ok(())
            }
            Err(e) => {
                self.set_state(SwitchState::Failed(e.to_string()));
                error!(target_host = %target.label, error = %e, "Switch failed");
                if matches!(e, HandoffError::PartialConnection) {
                    self.notifier.partial_connection();
                } else {
                    self.notifier.switch_failed(&e);
                }
                self.set_state(SwitchState::Idle);
                Err(e)
            }
        }
    }

    async fn run(&self, target: &RegisteredHost) -> HandoffResult<Vec<Device>> {
        let devices = self.devices.discover_paired_devices().await?;
        if devices.is_empty() {
            return Err(HandoffError::NoDevices);
        }

        let addresses: Vec<String> = devices.iter().map(|d| d.address.clone()).collect();
        if let Err(e) = self.store.save(LAST_KNOWN_ADDRESSES_KEY, &addresses).await {
            warn!(error = %e, "Failed to remember device addresses");
        }

        match self.devices.connection_status(&devices).await {
            AggregateStatus::Partial => Err(HandoffError::PartialConnection),
            AggregateStatus::AllConnected => {
                let peer = self.resolve_target(target)?;
                self.push(&devices, &peer).await?;
                Ok(devices)
            }
            AggregateStatus::AllDisconnected => {
                let peer = self.resolve_target(target)?;
                self.pull(&devices, &peer).await?;
                Ok(devices)
            }
        }
    }

    /// The peer identifier to talk to for `target`.
    fn resolve_target(&self, target: &RegisteredHost) -> HandoffResult<String> {
        if let Some(id) = target.peer_host_id.as_deref() {
            if self.messenger.peer(id).is_some() {
                return Ok(id.to_string());
            }
        }
        self.messenger
            .find_peer_by_host_name(&target.host_name)
            .map(|p| p.host_id)
            .ok_or_else(|| NetworkError::PeerNotFound(target.label.clone()).into())
    }

    async fn push(&self, devices: &[Device], peer_id: &str) -> HandoffResult<()> {
        let total = devices.len();
        info!(peer = %peer_id, "All devices connected, sending them to the peer");
        self.progress(SwitchPhase::Releasing, 0, total);

        for (index, device) in devices.iter().enumerate() {
            retry_async(&self.settings.retry, || self.devices.release(device)).await?;
            self.progress(SwitchPhase::Releasing, index + 1, total);
            info!(device = %device.name, address = %device.address, "Device released");
        }

        let dropped = self
            .devices
            .poll_for_disconnection(
                devices,
                self.settings.disconnect_poll_attempts,
                self.settings.disconnect_poll_interval,
            )
            .await;
        if !dropped {
            warn!("Not all devices disconnected after polling, proceeding anyway");
        }

        self.progress(SwitchPhase::Verifying, total, total);
        let addresses: Vec<&str> = devices.iter().map(|d| d.address.as_str()).collect();
        let reply = self
            .request(
                peer_id,
                DeviceMessage::with_addresses(DeviceCommand::ConnectAll, &addresses),
            )
            .await?;
        if reply != DeviceCommand::OpSuccess {
            return Err(HandoffError::RemoteRejected(
                "the peer failed to connect the devices".into(),
            ));
        }
        Ok(())
    }

    async fn pull(&self, devices: &[Device], peer_id: &str) -> HandoffResult<()> {
        let total = devices.len();
        info!(peer = %peer_id, "All devices disconnected, pulling them from the peer");
        self.progress(SwitchPhase::Acquiring, 0, total);

        let reply = self
            .request(peer_id, DeviceMessage::new(DeviceCommand::UnregisterAll))
            .await?;
        if reply != DeviceCommand::OpSuccess {
            return Err(HandoffError::RemoteRejected(
                "the peer failed to release the devices".into(),
            ));
        }

        for (index, device) in devices.iter().enumerate() {
            retry_async(&self.settings.retry, || self.devices.acquire(device)).await?;
            self.progress(SwitchPhase::Acquiring, index + 1, total);
            info!(device = %device.name, address = %device.address, "Device acquired");
        }
        Ok(())
    }

    fn progress(&self, phase: SwitchPhase, completed: usize, total: usize) {
        self.set_state(SwitchState::Switching(SwitchProgress::new(
            phase, completed, total,
        )));
    }

    /// Send `msg` and wait for the next response command.
    ///
    /// The pending slot is cleared before sending so a reply can never be
    /// missed, then polled until the response timeout.
    async fn request(&self, peer_id: &str, msg: DeviceMessage) -> HandoffResult<DeviceCommand> {
        self.take_pending();
        self.messenger.send_to_peer(peer_id, &msg).await?;
        info!(peer = %peer_id, command = %msg.command, "Request sent");

        let timeout = self.settings.response_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(reply) = self.take_pending() {
                debug!(command = %reply, "Response received");
                return Ok(reply);
            }
            if Instant::now() >= deadline {
                return Err(HandoffError::ResponseTimeout {
                    seconds: timeout.as_secs(),
                });
            }
            tokio::time::sleep(self.settings.response_poll_interval).await;
        }
    }

    fn take_pending(&self) -> Option<DeviceCommand> {
        self.pending_response
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    // ---- Peer side ----

    /// Acquire every remembered device. Falls back to the addresses in the
    /// request when nothing is remembered.
    async fn serve_connect_all(&self, request: &DeviceMessage) -> DeviceCommand {
        let mut addresses: Vec<String> = self
            .store
            .load_or_default(LAST_KNOWN_ADDRESSES_KEY, Vec::new())
            .await;
        if addresses.is_empty() {
            addresses = request.addresses();
        }
        info!(devices = addresses.len(), "Handling CONNECT_ALL");

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for address in addresses {
            let device = Device::from_address(&address);
            match retry_async(&self.settings.retry, || self.devices.acquire(&device)).await {
                Ok(()) => {
                    info!(address = %address, "Device acquired for peer");
                    succeeded.push(address);
                }
                Err(e) => {
                    error!(address = %address, error = %e, "Failed to acquire device");
                    failed.push(address);
                }
            }
        }
        outcome(succeeded, failed)
    }

    /// Release every device currently paired here.
    async fn serve_unregister_all(&self) -> DeviceCommand {
        info!("Handling UNREGISTER_ALL");
        let devices = match self.devices.discover_paired_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                error!(error = %e, "Device discovery failed");
                return DeviceCommand::OpFailed;
            }
        };

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for device in devices {
            match self.devices.release(&device).await {
                Ok(()) => {
                    info!(address = %device.address, "Device released for peer");
                    succeeded.push(device.address);
                }
                Err(e) => {
                    error!(address = %device.address, error = %e, "Failed to release device");
                    failed.push(device.address);
                }
            }
        }
        outcome(succeeded, failed)
    }
}

fn outcome(succeeded: Vec<String>, failed: Vec<String>) -> DeviceCommand {
    if failed.is_empty() {
        return DeviceCommand::OpSuccess;
    }
    warn!("{}", HandoffError::PartialFailure { succeeded, failed });
    DeviceCommand::OpFailed
}

#[async_trait]
impl CommandHandler for HandoffOrchestrator {
    async fn handle_command(
        &self,
        connection_id: Uuid,
        message: DeviceMessage,
    ) -> Option<DeviceMessage> {
        debug!(connection = %connection_id, command = %message.command, "Handling command");
        let reply = match message.command {
            DeviceCommand::ConnectAll => self.serve_connect_all(&message).await,
            DeviceCommand::UnregisterAll => self.serve_unregister_all().await,
            DeviceCommand::HealthCheck => DeviceCommand::OpSuccess,
            DeviceCommand::OpSuccess | DeviceCommand::OpFailed => {
                let previous = self
                    .pending_response
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .replace(message.command);
                if let Some(previous) = previous {
                    debug!(dropped = %previous, "Overwriting unconsumed response");
                }
                return None;
            }
            DeviceCommand::Notification => {
                let text = message
                    .payload
                    .as_deref()
                    .filter(|p| !p.is_empty())
                    .unwrap_or("Notification received from peer");
                self.notifier.remote_notification(text);
                return None;
            }
            DeviceCommand::SyncPeripherals | DeviceCommand::PeripheralData => {
                debug!(command = %message.command, "Sync command ignored");
                return None;
            }
        };
        info!(command = %message.command, reply = %reply, "Replying to peer");
        Some(DeviceMessage::new(reply))
    }
}
