//! spray-core — identities, wire messages and configuration shared by
//! every Spray crate. No protocol logic lives here.

pub mod config;
pub mod wire;

pub use config::{ChannelConfig, ConfigError, MembershipConfig, SprayConfig};
pub use wire::{JobId, Message, PeerId, SignalPayload, Ticket, TicketKind, WireError};
