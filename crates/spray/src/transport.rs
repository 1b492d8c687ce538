//! The boundary to the physical channel primitive.
//!
//! A transport creates channels in an initiating or responding role,
//! produces a local signaling payload for each, accepts the remote one, and
//! later reports connect/data/close. All of that comes back to the engine
//! as `ChannelEvent`s; the engine never blocks on the transport.

use std::fmt;

use spray_core::config::ChannelConfig;
use spray_core::wire::{Message, SignalPayload};

/// Engine-allocated handle for one channel, unique per engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Produces the offer.
    Initiator,
    /// Answers an offer.
    Responder,
}

/// What a transport reports about one of its channels.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Local signaling payload is ready (offer for initiators, answer for responders).
    Signal(SignalPayload),
    /// The channel is open in both directions.
    Connect,
    /// A message arrived from the remote end.
    Data(Message),
    /// The remote end went away, or the channel failed.
    Close,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("channel {0} is not open")]
    NotOpen(ChannelId),
    #[error("channel {0} is unknown to the transport")]
    UnknownChannel(ChannelId),
    #[error("{0}")]
    Other(String),
}

/// Implemented by the physical channel layer (data channels, a simulator, ...).
///
/// Implementations must eventually report `ChannelEvent::Close` for any
/// channel that fails or is closed by the remote end. A channel closed
/// locally through `close` needs no event.
pub trait Transport {
    fn create(&mut self, channel: ChannelId, role: Role, config: &ChannelConfig)
        -> Result<(), TransportError>;

    /// Feed the remote signaling payload into the channel.
    fn signal(&mut self, channel: ChannelId, payload: &SignalPayload) -> Result<(), TransportError>;

    fn send(&mut self, channel: ChannelId, message: &Message) -> Result<(), TransportError>;

    fn close(&mut self, channel: ChannelId);
}
