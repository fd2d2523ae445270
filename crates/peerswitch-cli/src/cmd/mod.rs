//! Subcommand implementations and the helpers they share.

pub mod devices;
pub mod hosts;
pub mod network;
pub mod trust;

use crate::blueutil::BlueutilController;
use crate::ui;
use peerswitch_kernel::error::KernelError;
use peerswitch_kernel::notify::TracingNotifier;
use peerswitch_kernel::SwitchNode;
use peerswitch_types::config::NodeConfig;
use peerswitch_types::error::PeerSwitchError;
use std::sync::Arc;

/// Runtime for subcommands that need async I/O.
pub(crate) fn runtime() -> tokio::runtime::Runtime {
    match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            ui::error(&format!("Failed to start async runtime: {e}"));
            std::process::exit(1);
        }
    }
}

pub(crate) fn device_controller(config: &NodeConfig) -> Arc<BlueutilController> {
    Arc::new(BlueutilController::new(&config.blueutil_path))
}

/// Boot a node or exit with a diagnostic.
pub(crate) async fn boot_node(config: NodeConfig) -> SwitchNode {
    let devices = device_controller(&config);
    let notifier = Arc::new(TracingNotifier::new(config.show_notifications));
    match SwitchNode::boot(config, devices, notifier).await {
        Ok(node) => node,
        Err(e) => fail_kernel(&e),
    }
}

/// Print the error with its remedy and exit non-zero.
pub(crate) fn fail_kernel(e: &KernelError) -> ! {
    report(&e.to_string(), e.recovery_suggestion());
    std::process::exit(1);
}

pub(crate) fn fail(e: &PeerSwitchError) -> ! {
    report(&e.to_string(), e.recovery_suggestion());
    std::process::exit(1);
}

fn report(msg: &str, fix: Option<&str>) {
    match fix {
        Some(fix) => ui::error_with_fix(msg, fix),
        None => ui::error(msg),
    }
}
