//! Configuration loading from `~/.peerswitch/config.toml` with defaults.

use peerswitch_types::config::{peerswitch_home, NodeConfig};
use peerswitch_types::error::{PeerSwitchError, PeerSwitchResult};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

/// File under the data directory holding the generated host identifier.
pub const HOST_ID_FILE: &str = "host-id";

/// Load node configuration from a TOML file, with defaults.
///
/// Any read or parse failure is logged and the defaults are used.
pub fn load_config(path: Option<&Path>) -> NodeConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if config_path.exists() {
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str::<NodeConfig>(&contents) {
                Ok(config) => {
                    info!(path = %config_path.display(), "Loaded configuration");
                    return config;
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        path = %config_path.display(),
                        "Failed to parse config, using defaults"
                    );
                }
            },
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to read config file, using defaults"
                );
            }
        }
    } else {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
    }

    NodeConfig::default()
}

/// Default config file location.
pub fn default_config_path() -> PathBuf {
    peerswitch_home().join("config.toml")
}

/// The node's stable identifier.
///
/// Uses `host_id` from the config when set. Otherwise a UUID is generated
/// once and kept in `<data_dir>/host-id` so it survives restarts.
pub fn resolve_host_id(config: &NodeConfig) -> PeerSwitchResult<String> {
    if let Some(id) = config.host_id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        return Ok(id.to_string());
    }

    let path = config.data_dir.join(HOST_ID_FILE);
    match std::fs::read_to_string(&path) {
        Ok(s) if !s.trim().is_empty() => return Ok(s.trim().to_string()),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(PeerSwitchError::Persistence(format!(
                "read {} failed: {e}",
                path.display()
            )))
        }
    }

    let id = Uuid::new_v4().to_string().to_uppercase();
    std::fs::create_dir_all(&config.data_dir)?;
    std::fs::write(&path, &id)?;
    info!(host_id = %id, "Generated host identifier");
    Ok(id)
}
