//! Trust store commands: list, forget.

use crate::table::Table;
use crate::ui;
use peerswitch_types::config::NodeConfig;
use peerswitch_wire::TrustStore;

pub fn cmd_trust_list(config: &NodeConfig) {
    let trust = TrustStore::open_in(&config.data_dir);
    if trust.is_empty() {
        ui::hint("No trusted peers yet. Fingerprints are pinned on first contact.");
        return;
    }
    let mut table = Table::new(&["Peer", "SHA-256 fingerprint"]);
    for (id, fingerprint) in trust.records() {
        table.add_row(&[id, fingerprint]);
    }
    table.print();
    ui::kv("Store", &trust.path().display().to_string());
}

pub fn cmd_trust_forget(config: &NodeConfig, id: &str) {
    let trust = TrustStore::open_in(&config.data_dir);
    if trust.remove_trusted(id).is_none() {
        ui::error_with_fix(
            &format!("No trusted fingerprint for '{id}'"),
            "List pinned peers with `peerswitch trust list`",
        );
        std::process::exit(1);
    }
    if let Err(e) = trust.flush() {
        ui::error(&format!("Failed to write trust store: {e}"));
        std::process::exit(1);
    }
    ui::success(&format!("Forgot '{id}'. It will be re-pinned on next contact."));
}
