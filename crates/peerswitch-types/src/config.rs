//! Node configuration, deserialized from `~/.peerswitch/config.toml`.
//!
//! Every field has a default so a missing or partial file still yields a
//! runnable node.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Service type advertised and browsed on the local network.
pub const DEFAULT_SERVICE_TYPE: &str = "_magicswitch._tcp.local.";

/// Upper bound on registered hosts.
pub const DEFAULT_MAX_HOSTS: usize = 8;

/// Retry settings for individual device operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Attempts including the first try.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 10_000,
        }
    }
}

/// Top-level node configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Display name advertised to peers; also the service instance name.
    pub host_name: String,
    /// Stable identifier. Generated and persisted under `data_dir` if unset.
    pub host_id: Option<String>,
    pub service_type: String,
    /// Listener address. Port 0 lets the OS pick; peers learn the real port
    /// from the advertisement.
    pub listen_addr: SocketAddr,
    /// Wrap peer links in TLS 1.3 with trust-on-first-use.
    pub use_tls: bool,
    /// Directory for persisted state (hosts, trust store, identity).
    pub data_dir: PathBuf,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
    pub connect_timeout_secs: u64,
    /// How long a handoff waits for the peer's answer.
    pub response_timeout_secs: u64,
    pub response_poll_interval_ms: u64,
    pub heartbeat_interval_secs: u64,
    pub retry: RetrySettings,
    pub disconnect_poll_attempts: u32,
    pub disconnect_poll_interval_ms: u64,
    pub max_hosts: usize,
    pub show_notifications: bool,
    /// Battery percentage under which devices are flagged.
    pub low_battery_threshold: u8,
    /// Seconds between battery checks while serving. 0 disables them.
    pub battery_check_interval_secs: u64,
    /// Path to the `blueutil` executable.
    pub blueutil_path: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host_name: system_host_name().unwrap_or_else(|| "peerswitch-node".to_string()),
            host_id: None,
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            use_tls: true,
            data_dir: peerswitch_home(),
            log_level: "info".to_string(),
            connect_timeout_secs: 10,
            response_timeout_secs: 15,
            response_poll_interval_ms: 200,
            heartbeat_interval_secs: 30,
            retry: RetrySettings::default(),
            disconnect_poll_attempts: 5,
            disconnect_poll_interval_ms: 500,
            max_hosts: DEFAULT_MAX_HOSTS,
            show_notifications: true,
            low_battery_threshold: 20,
            battery_check_interval_secs: 60,
            blueutil_path: PathBuf::from("blueutil"),
        }
    }
}

impl NodeConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    pub fn response_poll_interval(&self) -> Duration {
        Duration::from_millis(self.response_poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn disconnect_poll_interval(&self) -> Duration {
        Duration::from_millis(self.disconnect_poll_interval_ms)
    }

    /// `None` when battery checks are disabled.
    pub fn battery_check_interval(&self) -> Option<Duration> {
        (self.battery_check_interval_secs > 0)
            .then(|| Duration::from_secs(self.battery_check_interval_secs))
    }
}

/// Default PeerSwitch home directory (`~/.peerswitch`).
pub fn peerswitch_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".peerswitch")
}

/// Best-effort operating-system host name.
pub fn system_host_name() -> Option<String> {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .filter_map(|k| std::env::var(k).ok())
        .chain(std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .find(|h| !h.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = NodeConfig::default();
        assert_eq!(c.service_type, "_magicswitch._tcp.local.");
        assert_eq!(c.listen_addr.port(), 0);
        assert_eq!(c.connect_timeout(), Duration::from_secs(10));
        assert_eq!(c.response_timeout(), Duration::from_secs(15));
        assert_eq!(c.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(c.retry.max_attempts, 3);
        assert_eq!(c.retry.base_delay_ms, 1_000);
        assert_eq!(c.retry.max_delay_ms, 10_000);
        assert_eq!(c.disconnect_poll_attempts, 5);
        assert!(!c.host_name.is_empty());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let c: NodeConfig = toml::from_str(
            r#"
            host_name = "desk"
            use_tls = false

            [retry]
            max_attempts = 5
            "#,
        )
        .unwrap();
        assert_eq!(c.host_name, "desk");
        assert!(!c.use_tls);
        assert_eq!(c.retry.max_attempts, 5);
        assert_eq!(c.retry.base_delay_ms, 1_000);
        assert_eq!(c.response_timeout_secs, 15);
    }
}
