//! spray — the Spray random peer-sampling membership protocol.
//!
//! `Spray` is a sans-IO engine: it owns the partial view and the
//! correlation tables, drives channels through a [`Transport`], and is fed
//! every inbound event (channel signal/connect/data/close, timer tick)
//! one at a time. `SprayService` runs one engine on a tokio task so all
//! of those events are serialised onto a single stream.

mod clock;
mod error;
mod exchange;
mod handshake;
mod node;
mod partial_view;
mod registry;
mod router;
mod service;
mod tables;
mod transport;


pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{MembershipError, Result};
pub use handshake::{Handshake, HandshakeState, Promotion, Purpose, Route};
pub use node::{Spray, SprayEvent};
pub use partial_view::{Arc, PartialView};
pub use registry::{ProtocolHandler, ProtocolRegistry};
pub use service::{Command, SprayHandle, SprayService, TokioClock, TransportEvents};
pub use tables::{ForwardEntry, ForwardTable, PendingEntry, PendingTable, SocketTable};
pub use transport::{ChannelEvent, ChannelId, Role, Transport, TransportError};

pub use spray_core::{JobId, Message, PeerId, SignalPayload, SprayConfig, Ticket, TicketKind};
