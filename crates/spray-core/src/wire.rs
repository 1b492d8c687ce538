//! Spray wire vocabulary — peer identities, job ids, tickets and messages.
//!
//! Every message carries a `job_id` tying it to the request it answers.
//! The logical schema is transport-agnostic; `encode`/`decode` provide the
//! JSON form used by transports that carry text frames. The `type` tag on
//! the wire is the variant name (`"Join"`, `"OfferTicket"`, ...).

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

// ── Identities ────────────────────────────────────────────────────────────────

/// Opaque identifier of one participant instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// 128 random bits, hex encoded.
    pub fn random<R: RngCore + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 16];
        rng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Correlation token tying an asynchronous request to its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(u64);

impl JobId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn random<R: RngCore + ?Sized>(rng: &mut R) -> Self {
        Self(rng.next_u64())
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Transport-produced signaling blob (an SDP offer or answer, typically).
/// The core never looks inside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalPayload(String);

impl SignalPayload {
    pub fn new(payload: impl Into<String>) -> Self {
        Self(payload.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// ── Tickets ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketKind {
    /// Produced by the initiating side.
    Offer,
    /// The responder's answer to an offer.
    Stamped,
}

/// A signaling payload on its way between the two ends of a handshake.
///
/// Tickets travel either inside `OfferTicket`/`StampedTicket` messages over
/// an existing neighbour, or through the external rendezvous when a peer
/// bootstraps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub job_id: JobId,
    pub kind: TicketKind,
    pub payload: SignalPayload,
    /// Peer that produced the payload.
    pub sender: PeerId,
}

impl Ticket {
    pub fn offer(job_id: JobId, payload: SignalPayload, sender: PeerId) -> Self {
        Self { job_id, kind: TicketKind::Offer, payload, sender }
    }

    pub fn stamped(job_id: JobId, payload: SignalPayload, sender: PeerId) -> Self {
        Self { job_id, kind: TicketKind::Stamped, payload, sender }
    }
}

// ── Messages ──────────────────────────────────────────────────────────────────

/// Every message exchanged between two neighbours.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// Sent by a newcomer to its contact once their channel is open.
    Join { job_id: JobId },

    /// Opens a shuffle round; `occ` is how many arcs to the receiver the
    /// initiator gave up (the receiver materialises them as arcs back).
    Exchange { job_id: JobId, initiator: PeerId, occ: u32 },

    /// Closes a shuffle round from the receiver's side.
    ExchangeReply { job_id: JobId, occ: u32 },

    /// Asks the receiver to open a channel to `target`, using the sender
    /// as the relay for both tickets.
    TicketRequest { job_id: JobId, target: PeerId },

    OfferTicket { job_id: JobId, offer: SignalPayload, sender: PeerId },

    StampedTicket { job_id: JobId, answer: SignalPayload, sender: PeerId },

    /// The sender no longer references the receiver. The receiver closes the
    /// channel if it does not reference the sender either.
    Release { job_id: JobId },

    /// The sender is departing.
    Leave { job_id: JobId },

    /// Pass-through for protocols layered on top of the membership.
    Event {
        job_id: JobId,
        protocol: String,
        name: String,
        #[serde(default)]
        args: serde_json::Value,
    },
}

impl Message {
    pub fn job_id(&self) -> JobId {
        match self {
            Message::Join { job_id }
            | Message::Exchange { job_id, .. }
            | Message::ExchangeReply { job_id, .. }
            | Message::TicketRequest { job_id, .. }
            | Message::OfferTicket { job_id, .. }
            | Message::StampedTicket { job_id, .. }
            | Message::Release { job_id }
            | Message::Leave { job_id }
            | Message::Event { job_id, .. } => *job_id,
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Join { .. } => "join",
            Message::Exchange { .. } => "exchange",
            Message::ExchangeReply { .. } => "exchange_reply",
            Message::TicketRequest { .. } => "ticket_request",
            Message::OfferTicket { .. } => "offer_ticket",
            Message::StampedTicket { .. } => "stamped_ticket",
            Message::Release { .. } => "release",
            Message::Leave { .. } => "leave",
            Message::Event { .. } => "event",
        }
    }
}

impl From<Ticket> for Message {
    fn from(ticket: Ticket) -> Self {
        match ticket.kind {
            TicketKind::Offer => Message::OfferTicket {
                job_id: ticket.job_id,
                offer: ticket.payload,
                sender: ticket.sender,
            },
            TicketKind::Stamped => Message::StampedTicket {
                job_id: ticket.job_id,
                answer: ticket.payload,
                sender: ticket.sender,
            },
        }
    }
}

// ── Codec ─────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("failed to encode message: {0}")]
    Encode(serde_json::Error),
    #[error("failed to decode message: {0}")]
    Decode(serde_json::Error),
}

pub fn encode(message: &Message) -> Result<Vec<u8>, WireError> {
    serde_json::to_vec(message).map_err(WireError::Encode)
}

pub fn decode(bytes: &[u8]) -> Result<Message, WireError> {
    serde_json::from_slice(bytes).map_err(WireError::Decode)
}
