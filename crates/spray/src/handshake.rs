//! Per-connection handshake state machine.
//!
//! One `Handshake` value per connection attempt, stored in the
//! `PendingTable` under its job id until the channel connects or the
//! deadline passes. Three messages drive it:
//!
//!   initiator: local signal → OfferTicket ──► responder
//!   responder: offer fed, local signal → StampedTicket ──► initiator
//!   initiator: answer fed → transport connects both ends
//!
//! Initiator: AwaitingLocalSignal → OfferSent → AwaitingConnect → promoted
//! Responder: AwaitingLocalSignal → StampedSent → promoted
//!
//! Tickets travel either over the neighbour that asked for the link
//! (`Route::Channel`) or through the external rendezvous (`Route::Rendezvous`).

use spray_core::wire::{JobId, Message, PeerId, SignalPayload, Ticket, TicketKind};

use crate::error::{MembershipError, Result};
use crate::node::{Spray, SprayEvent};
use crate::tables::{Admission, PendingEntry};
use crate::transport::{ChannelId, Role, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingLocalSignal,
    /// Initiator: offer is out, waiting for the stamped ticket.
    OfferSent,
    /// Initiator: answer fed to the transport, waiting for connect.
    AwaitingConnect,
    /// Responder: answer is out, waiting for connect.
    StampedSent,
}

/// Where this attempt's tickets go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Channel(ChannelId),
    Rendezvous,
}

/// What the link is for once it connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    /// A plain arc.
    Link,
    /// Bootstrap link to a contact; send `Join` once connected.
    Join,
}

#[derive(Debug, Clone)]
pub struct Handshake {
    job: JobId,
    role: Role,
    state: HandshakeState,
    remote: Option<PeerId>,
    route: Route,
    purpose: Purpose,
}

/// A connected handshake, ready to move into the socket table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Promotion {
    pub job: JobId,
    pub peer: PeerId,
    pub role: Role,
    pub purpose: Purpose,
}

impl Handshake {
    /// `remote` is unknown when bootstrapping through the rendezvous.
    pub fn initiate(job: JobId, remote: Option<PeerId>, route: Route, purpose: Purpose) -> Self {
        Self {
            job,
            role: Role::Initiator,
            state: HandshakeState::AwaitingLocalSignal,
            remote,
            route,
            purpose,
        }
    }

    pub fn respond(job: JobId, remote: PeerId, route: Route) -> Self {
        Self {
            job,
            role: Role::Responder,
            state: HandshakeState::AwaitingLocalSignal,
            remote: Some(remote),
            route,
            purpose: Purpose::Link,
        }
    }

    pub fn job(&self) -> JobId {
        self.job
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn remote(&self) -> Option<&PeerId> {
        self.remote.as_ref()
    }

    pub fn route(&self) -> Route {
        self.route
    }

    pub fn purpose(&self) -> Purpose {
        self.purpose
    }

    /// The transport produced our signaling payload; wrap it as a ticket.
    pub fn on_local_signal(&mut self, local: &PeerId, payload: SignalPayload) -> Result<Ticket> {
        if self.state != HandshakeState::AwaitingLocalSignal {
            return Err(self.unexpected("local signal"));
        }
        let ticket = match self.role {
            Role::Initiator => {
                self.state = HandshakeState::OfferSent;
                Ticket::offer(self.job, payload, local.clone())
            }
            Role::Responder => {
                self.state = HandshakeState::StampedSent;
                Ticket::stamped(self.job, payload, local.clone())
            }
        };
        Ok(ticket)
    }

    /// The responder's answer came back to us.
    pub fn on_stamped(&mut self, ticket: &Ticket) -> Result<()> {
        if self.role != Role::Initiator
            || self.state != HandshakeState::OfferSent
            || ticket.kind != TicketKind::Stamped
        {
            return Err(self.unexpected("stamped ticket"));
        }
        let expected = self.remote.get_or_insert_with(|| ticket.sender.clone());
        if *expected != ticket.sender {
            return Err(MembershipError::Protocol(format!(
                "job {} answered by {} instead of {}",
                self.job, ticket.sender, expected
            )));
        }
        self.state = HandshakeState::AwaitingConnect;
        Ok(())
    }

    /// The transport reports the channel open.
    pub fn into_promotion(self) -> Result<Promotion> {
        let ready = matches!(
            (self.role, self.state),
            (Role::Initiator, HandshakeState::AwaitingConnect)
                | (Role::Responder, HandshakeState::StampedSent)
        );
        if !ready {
            return Err(self.unexpected("connect"));
        }
        let peer = self
            .remote
            .clone()
            .ok_or_else(|| self.unexpected("connect"))?;
        Ok(Promotion {
            job: self.job,
            peer,
            role: self.role,
            purpose: self.purpose,
        })
    }

    fn unexpected(&self, what: &str) -> MembershipError {
        MembershipError::Protocol(format!(
            "unexpected {what} for job {} ({:?} in {:?})",
            self.job, self.role, self.state
        ))
    }
}

// ── Engine glue ───────────────────────────────────────────────────────────────

impl<T: Transport> Spray<T> {
    /// Create an initiating channel and track it until it connects.
    pub(crate) fn open_handshake(
        &mut self,
        job: JobId,
        remote: Option<PeerId>,
        route: Route,
        purpose: Purpose,
    ) -> Result<ChannelId> {
        let channel = self.next_channel();
        self.transport
            .create(channel, Role::Initiator, &self.channel_config)?;
        self.pending.insert(
            job,
            PendingEntry {
                channel,
                handshake: Handshake::initiate(job, remote, route, purpose),
                deadline: self.deadline(),
            },
        );
        tracing::debug!(job = %job, %channel, ?purpose, "handshake initiated");
        Ok(channel)
    }

    /// Answer an offer: create a responding channel and feed it the offer.
    pub(crate) fn accept_offer(&mut self, ticket: Ticket, route: Route) -> Result<()> {
        if self.pending.contains(&ticket.job_id) {
            return Err(MembershipError::Protocol(format!(
                "duplicate offer for job {}",
                ticket.job_id
            )));
        }
        if ticket.sender == self.id {
            return Err(MembershipError::Protocol("offer from ourselves".into()));
        }
        let channel = self.next_channel();
        self.transport
            .create(channel, Role::Responder, &self.channel_config)?;
        if let Err(e) = self.transport.signal(channel, &ticket.payload) {
            self.transport.close(channel);
            return Err(e.into());
        }
        self.pending.insert(
            ticket.job_id,
            PendingEntry {
                channel,
                handshake: Handshake::respond(ticket.job_id, ticket.sender.clone(), route),
                deadline: self.deadline(),
            },
        );
        tracing::debug!(job = %ticket.job_id, from = %ticket.sender, %channel, "offer accepted");
        Ok(())
    }

    /// Feed a stamped ticket into our initiating channel.
    pub(crate) fn accept_stamped(&mut self, ticket: Ticket) -> Result<()> {
        let entry = self
            .pending
            .get_mut(&ticket.job_id)
            .ok_or(MembershipError::UnknownJob(ticket.job_id))?;
        entry.handshake.on_stamped(&ticket)?;
        let channel = entry.channel;
        self.transport.signal(channel, &ticket.payload)?;
        tracing::debug!(job = %ticket.job_id, from = %ticket.sender, %channel, "answer applied");
        Ok(())
    }

    pub(crate) fn on_local_signal(&mut self, channel: ChannelId, payload: SignalPayload) -> Result<()> {
        let job = self.pending.job_for_channel(channel).ok_or_else(|| {
            MembershipError::Protocol(format!("signal on {channel} with no handshake"))
        })?;
        let id = self.id.clone();
        let (ticket, route) = match self.pending.get_mut(&job) {
            Some(entry) => (
                entry.handshake.on_local_signal(&id, payload)?,
                entry.handshake.route(),
            ),
            None => return Err(MembershipError::UnknownJob(job)),
        };
        match route {
            Route::Channel(via) => self.transport.send(via, &Message::from(ticket))?,
            Route::Rendezvous => self.emit(SprayEvent::Rendezvous(ticket)),
        }
        Ok(())
    }

    pub(crate) fn on_connect(&mut self, channel: ChannelId) -> Result<()> {
        let Some(job) = self.pending.job_for_channel(channel) else {
            tracing::trace!(%channel, "connect on a channel with no handshake");
            return Ok(());
        };
        let Some(entry) = self.pending.remove(&job) else {
            return Err(MembershipError::UnknownJob(job));
        };
        let promotion = match entry.handshake.into_promotion() {
            Ok(p) => p,
            Err(e) => {
                self.transport.close(channel);
                return Err(e);
            }
        };
        self.promote(channel, promotion)
    }

    /// Move a connected channel into the socket table and act on it.
    fn promote(&mut self, channel: ChannelId, promotion: Promotion) -> Result<()> {
        let Promotion { job, peer, role, purpose } = promotion;

        let grace_until = self.deadline();
        match self.sockets.admit(peer.clone(), channel, job, grace_until) {
            Admission::New => self.emit(SprayEvent::Open(peer.clone())),
            Admission::Duplicate { kept, retired } => {
                tracing::debug!(%peer, %kept, %retired, "redundant channel retired");
            }
        }

        if role == Role::Initiator {
            self.view.add_neighbor(peer.clone());
        }
        tracing::debug!(job = %job, %peer, ?role, view = self.view.len(), "handshake connected");

        if purpose == Purpose::Join {
            self.send_to(&peer, Message::Join { job_id: job })?;
            tracing::info!(contact = %peer, "join sent");
        }
        Ok(())
    }

    /// A pending channel closed or expired before connecting.
    pub(crate) fn fail_handshake(&mut self, entry: PendingEntry, reason: &MembershipError) {
        self.transport.close(entry.channel);
        let handshake = entry.handshake;
        match handshake.role() {
            Role::Initiator => {
                tracing::debug!(job = %handshake.job(), error = %reason, "link attempt failed, repairing");
                if let Some(peer) = handshake.remote() {
                    self.emit(SprayEvent::Close(peer.clone()));
                }
                self.on_arc_down();
            }
            // The responder never added an arc for this link, so nothing is lost.
            Role::Responder => {
                tracing::debug!(job = %handshake.job(), error = %reason, "answered handshake failed");
            }
        }
    }
}
