//! Message router: the single entry point for everything a neighbour sends us.
//!
//! Tickets are the only messages that may not be for us: when the job id
//! matches a forward entry we are the relay and pass the ticket on,
//! otherwise it belongs to one of our own handshakes.

use spray_core::wire::{JobId, Message, PeerId, SignalPayload, Ticket};

use crate::error::{MembershipError, Result};
use crate::handshake::Route;
use crate::node::Spray;
use crate::transport::{ChannelId, Transport};

impl<T: Transport> Spray<T> {
    /// Handle one message received on `channel`. Failures are logged and
    /// the message dropped.
    pub fn receive(&mut self, channel: ChannelId, message: Message) {
        let result = self.route(channel, message);
        self.log_dropped(result);
    }

    fn route(&mut self, channel: ChannelId, message: Message) -> Result<()> {
        let from = self
            .sockets
            .peer_of(channel)
            .cloned()
            .ok_or_else(|| MembershipError::Protocol(format!("{} on unpromoted {channel}", message.kind())))?;
        tracing::trace!(%from, kind = message.kind(), job = %message.job_id(), "recv");

        match message {
            Message::Join { job_id } => self.on_join(&from, job_id),
            Message::Exchange { job_id, initiator, occ } => {
                if initiator != from {
                    return Err(MembershipError::Protocol(format!(
                        "exchange {job_id} claims initiator {initiator} but came from {from}"
                    )));
                }
                self.on_exchange(&from, job_id, occ)
            }
            Message::ExchangeReply { job_id, occ } => self.on_exchange_reply(&from, job_id, occ),
            Message::TicketRequest { job_id, target } => self.on_ticket_request(channel, job_id, target),
            Message::OfferTicket { job_id, offer, sender } => {
                self.on_offer_ticket(channel, &from, job_id, offer, sender)
            }
            Message::StampedTicket { job_id, answer, sender } => {
                self.on_stamped_ticket(&from, job_id, answer, sender)
            }
            Message::Release { .. } => self.on_release(&from),
            Message::Leave { .. } => self.on_leave(&from),
            Message::Event { protocol, name, args, .. } => {
                if !self.protocols.dispatch(&from, &protocol, &name, &args) {
                    tracing::debug!(%protocol, %name, %from, "event for unregistered protocol dropped");
                }
                Ok(())
            }
        }
    }

    fn on_offer_ticket(
        &mut self,
        channel: ChannelId,
        from: &PeerId,
        job: JobId,
        offer: SignalPayload,
        sender: PeerId,
    ) -> Result<()> {
        let Some(entry) = self.forwards.get(&job) else {
            // Relayed offers carry the originator as sender, not the relay.
            return self.accept_offer(Ticket::offer(job, offer, sender), Route::Channel(channel));
        };

        if self.sockets.peer_of(entry.channel) != Some(from) {
            return Err(MembershipError::Protocol(format!("offer {job} relayed from the wrong neighbour {from}")));
        }
        let target = entry
            .target()
            .cloned()
            .ok_or_else(|| MembershipError::Protocol(format!("forward {job} has no target")))?;
        let Some(next) = self.sockets.get(&target) else {
            self.forwards.remove(&job);
            return Err(MembershipError::PeerNotFound(target));
        };
        self.transport
            .send(next, &Message::OfferTicket { job_id: job, offer, sender })?;
        tracing::trace!(job = %job, %from, to = %target, "offer relayed");
        Ok(())
    }

    fn on_stamped_ticket(
        &mut self,
        from: &PeerId,
        job: JobId,
        answer: SignalPayload,
        sender: PeerId,
    ) -> Result<()> {
        let Some(entry) = self.forwards.remove(&job) else {
            return self.accept_stamped(Ticket::stamped(job, answer, sender));
        };

        if entry.target() != Some(from) {
            let channel = entry.channel;
            self.forwards.insert(job, entry);
            return Err(MembershipError::Protocol(format!(
                "answer {job} from {from} does not match the relayed request on {channel}"
            )));
        }
        // The requester's socket may have been swapped for a duplicate since.
        let back = self
            .sockets
            .peer_of(entry.channel)
            .and_then(|requester| self.sockets.get(requester))
            .unwrap_or(entry.channel);
        self.transport
            .send(back, &Message::StampedTicket { job_id: job, answer, sender })?;
        tracing::trace!(job = %job, %from, channel = %back, "answer relayed");
        Ok(())
    }
}
