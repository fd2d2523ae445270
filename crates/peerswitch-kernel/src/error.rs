//! Kernel-specific error types.

use peerswitch_types::error::{HandoffError, NetworkError, PeerSwitchError};
use thiserror::Error;

/// Kernel error type wrapping PeerSwitchError with boot context.
#[derive(Error, Debug)]
pub enum KernelError {
    #[error(transparent)]
    PeerSwitch(#[from] PeerSwitchError),

    /// The node failed to boot.
    #[error("Boot failed: {0}")]
    BootFailed(String),
}

impl KernelError {
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            KernelError::PeerSwitch(e) => e.recovery_suggestion(),
            KernelError::BootFailed(_) => None,
        }
    }
}

impl From<NetworkError> for KernelError {
    fn from(e: NetworkError) -> Self {
        KernelError::PeerSwitch(e.into())
    }
}

impl From<HandoffError> for KernelError {
    fn from(e: HandoffError) -> Self {
        KernelError::PeerSwitch(e.into())
    }
}

/// Alias for kernel results.
pub type KernelResult<T> = Result<T, KernelError>;
