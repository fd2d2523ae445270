//! User-registered handoff targets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A host the user has registered as a handoff target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredHost {
    pub id: Uuid,
    /// User-facing label.
    pub label: String,
    /// Network host name as advertised by the peer.
    pub host_name: String,
    /// Bound stable peer identifier, once known.
    #[serde(default)]
    pub peer_host_id: Option<String>,
    #[serde(default)]
    pub paired: bool,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    /// Not persisted; recomputed from the live peer table.
    #[serde(skip)]
    pub online: bool,
}

impl RegisteredHost {
    pub fn new(label: impl Into<String>, host_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            label: label.into(),
            host_name: host_name.into(),
            peer_host_id: None,
            paired: false,
            last_seen: None,
            online: false,
        }
    }

    pub fn with_peer_host_id(mut self, host_id: impl Into<String>) -> Self {
        self.peer_host_id = Some(host_id.into());
        self
    }

    /// Case-insensitive match against a label, host name or bound identifier.
    pub fn matches(&self, needle: &str) -> bool {
        self.label.eq_ignore_ascii_case(needle)
            || self.host_name.eq_ignore_ascii_case(needle)
            || self.peer_host_id.as_deref() == Some(needle)
            || self.id.to_string() == needle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_online_not_persisted() {
        let mut host = RegisteredHost::new("Desk", "desk-mac");
        host.online = true;
        let json = serde_json::to_string(&host).unwrap();
        assert!(!json.contains("online"));
        let back: RegisteredHost = serde_json::from_str(&json).unwrap();
        assert!(!back.online);
        assert_eq!(back.host_name, "desk-mac");
    }

    #[test]
    fn test_matches() {
        let host = RegisteredHost::new("Desk", "desk-mac").with_peer_host_id("HID-1");
        assert!(host.matches("desk"));
        assert!(host.matches("DESK-MAC"));
        assert!(host.matches("HID-1"));
        assert!(!host.matches("laptop"));
    }
}
