//! Errors raised inside the membership engine.
//!
//! None of these cross the public event-handling entry points: the engine
//! logs and drops them. Steady-state faults surface to the application only
//! as `SprayEvent::Close`.

use spray_core::config::ConfigError;
use spray_core::wire::{JobId, PeerId};

use crate::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum MembershipError {
    #[error("partial view is empty")]
    EmptyView,
    #[error("peer {0} not found")]
    PeerNotFound(PeerId),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("no pending or forwarded job {0}")]
    UnknownJob(JobId),
    #[error("handshake {0} timed out")]
    HandshakeTimeout(JobId),
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl MembershipError {
    /// Races with a concurrent repair or an expired entry.
    pub fn is_benign(&self) -> bool {
        matches!(self, MembershipError::PeerNotFound(_) | MembershipError::UnknownJob(_))
    }
}

pub type Result<T, E = MembershipError> = std::result::Result<T, E>;
