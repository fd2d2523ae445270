//! Process-lifetime state machines: peer links and handoffs.

use serde::{Deserialize, Serialize};

/// Lifecycle of a single peer link.
///
/// `Idle -> Connecting -> {Connected | Failed} -> Disconnected`. Once
/// `Disconnected` the link is never reused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Failed(String),
    Disconnected,
}

impl ConnectionState {
    /// True for `Failed` and `Disconnected`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::Failed(_) | ConnectionState::Disconnected
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Failed(reason) => write!(f, "failed: {reason}"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Which leg of a handoff is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchPhase {
    Releasing,
    Acquiring,
    Verifying,
}

impl std::fmt::Display for SwitchPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SwitchPhase::Releasing => write!(f, "releasing"),
            SwitchPhase::Acquiring => write!(f, "acquiring"),
            SwitchPhase::Verifying => write!(f, "verifying"),
        }
    }
}

/// Progress of a running handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchProgress {
    pub total_devices: usize,
    pub completed_devices: usize,
    pub phase: SwitchPhase,
}

impl SwitchProgress {
    pub fn new(phase: SwitchPhase, completed_devices: usize, total_devices: usize) -> Self {
        Self {
            total_devices,
            completed_devices,
            phase,
        }
    }

    /// Completion ratio in `[0, 1]`.
    pub fn fraction(&self) -> f64 {
        if self.total_devices == 0 {
            return 0.0;
        }
        self.completed_devices as f64 / self.total_devices as f64
    }
}

/// Handoff state as seen by observers.
///
/// `Idle -> Switching -> {Completed | Failed} -> Idle`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum SwitchState {
    Idle,
    Switching(SwitchProgress),
    Completed,
    Failed(String),
}

impl SwitchState {
    pub fn is_switching(&self) -> bool {
        matches!(self, SwitchState::Switching(_))
    }
}

impl std::fmt::Display for SwitchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SwitchState::Idle => write!(f, "idle"),
            SwitchState::Switching(p) => write!(
                f,
                "switching ({} {}/{})",
                p.phase, p.completed_devices, p.total_devices
            ),
            SwitchState::Completed => write!(f, "completed"),
            SwitchState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}
