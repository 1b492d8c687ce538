//! Exchange engine — join, periodic shuffle, churn repair and leave.
//!
//! A round on the initiator P with its oldest neighbour O:
//!   1. age every arc, pick O, sample ceil(|PV|/2) arcs with O forced in;
//!   2. drop the sample from P's view right away;
//!   3. for every sampled arc to Q != O, ask O to link to Q (P relays the tickets);
//!   4. send `Exchange{occ}` where occ counts the sampled arcs to O itself.
//! O samples its own view the same way (no forced slot), asks P to link to
//! each sampled Q != P, turns `occ` into arcs back to P and answers with
//! `ExchangeReply{occ}` for its sampled arcs to P. Both views keep their size.

use std::time::Instant;

use rand::seq::SliceRandom;
use rand::Rng;

use spray_core::wire::{JobId, Message, PeerId, Ticket, TicketKind};

use crate::error::{MembershipError, Result};
use crate::handshake::{Purpose, Route};
use crate::node::{Spray, SprayEvent};
use crate::tables::ForwardEntry;
use crate::transport::{ChannelId, Transport};

/// An exchange we started and whose reply has not arrived yet.
///
/// After the first deadline the loss is repaired, but the entry stays for
/// another timeout so a late reply still hands over its arcs.
#[derive(Debug, Clone)]
pub(crate) struct InflightExchange {
    pub peer: PeerId,
    pub deadline: Instant,
    pub repaired: bool,
}

/// Peers whose sockets may be released once `at` has passed.
#[derive(Debug, Clone)]
pub(crate) struct ScheduledEviction {
    pub at: Instant,
    pub peers: Vec<PeerId>,
}

impl<T: Transport> Spray<T> {
    // ── Join ──────────────────────────────────────────────────────────────────

    /// Enter the network through `contact`.
    ///
    /// With an open channel to the contact the `Join` goes out directly.
    /// Otherwise a bootstrap handshake starts and its offer is emitted as
    /// `SprayEvent::Rendezvous` for the application to deliver; the contact's
    /// stamped ticket comes back through `accept_rendezvous`.
    pub fn join(&mut self, contact: Option<&PeerId>) -> Result<JobId> {
        let job = self.next_job();
        if let Some(contact) = contact.filter(|c| self.sockets.contains(c)) {
            self.view.add_neighbor(contact.clone());
            self.send_to(contact, Message::Join { job_id: job })?;
            tracing::info!(%contact, "join sent");
            return Ok(job);
        }
        self.open_handshake(job, contact.cloned(), Route::Rendezvous, Purpose::Join)?;
        Ok(job)
    }

    /// Hand a ticket delivered by the rendezvous to the engine.
    pub fn accept_rendezvous(&mut self, ticket: Ticket) -> Result<()> {
        match ticket.kind {
            TicketKind::Offer => self.accept_offer(ticket, Route::Rendezvous),
            TicketKind::Stamped => self.accept_stamped(ticket),
        }
    }

    /// We are the contact: fan our neighbourhood out to the newcomer.
    pub(crate) fn on_join(&mut self, joiner: &PeerId, job: JobId) -> Result<()> {
        let neighbours: Vec<PeerId> = self
            .view
            .iter()
            .filter(|a| &a.peer != joiner)
            .map(|a| a.peer.clone())
            .collect();
        for target in &neighbours {
            if let Err(e) = self.request_link(joiner, target) {
                tracing::warn!(%joiner, %target, error = %e, "join fan-out request failed");
            }
        }
        self.view.add_neighbor(joiner.clone());
        tracing::info!(job = %job, %joiner, fan_out = neighbours.len(), "peer joined through us");
        Ok(())
    }

    // ── Link intents ──────────────────────────────────────────────────────────

    /// Ask `via` to open a channel to `target`, relaying both tickets.
    pub(crate) fn request_link(&mut self, via: &PeerId, target: &PeerId) -> Result<()> {
        let channel = self
            .sockets
            .get(via)
            .ok_or_else(|| MembershipError::PeerNotFound(via.clone()))?;
        let job_id = self.next_job();
        let request = Message::TicketRequest { job_id, target: target.clone() };
        self.transport.send(channel, &request)?;
        let deadline = self.deadline();
        self.forwards.insert(job_id, ForwardEntry { channel, request, deadline });
        tracing::trace!(job = %job_id, %via, %target, "link requested");
        Ok(())
    }

    /// A neighbour asks us to link to `target`.
    pub(crate) fn on_ticket_request(&mut self, channel: ChannelId, job: JobId, target: PeerId) -> Result<()> {
        if target == self.id {
            return Err(MembershipError::Protocol(format!("job {job} asks us to link to ourselves")));
        }
        if self.sockets.contains(&target) {
            // Already connected: the arc rides the existing channel.
            self.view.add_neighbor(target.clone());
            tracing::debug!(job = %job, %target, "link short-circuited");
            return Ok(());
        }
        self.open_handshake(job, Some(target), Route::Channel(channel), Purpose::Link)?;
        Ok(())
    }

    // ── Exchange ──────────────────────────────────────────────────────────────

    /// Run one shuffle round with the oldest neighbour. Returns the job id of
    /// the round, or `None` when there is nobody to exchange with.
    pub fn exchange(&mut self) -> Option<JobId> {
        match self.try_exchange() {
            Ok(job) => job,
            Err(e) => {
                self.log_dropped(Err(e));
                None
            }
        }
    }

    fn try_exchange(&mut self) -> Result<Option<JobId>> {
        if self.view.is_empty() {
            return Ok(None);
        }
        self.view.increment();
        let oldest = self.view.oldest()?.peer.clone();
        if !self.sockets.contains(&oldest) {
            tracing::warn!(peer = %oldest, "oldest neighbour has no channel");
            self.on_peer_down(&oldest);
            return Ok(None);
        }

        let sample = self.view.sample(&oldest, true, &mut self.rng);
        self.view.remove_sample(&sample);

        let mut own = Vec::new();
        let mut handed = Vec::new();
        for arc in sample {
            if arc.peer == oldest {
                own.push(arc);
            } else if let Err(e) = self.request_link(&oldest, &arc.peer) {
                tracing::warn!(via = %oldest, target = %arc.peer, error = %e, "exchange link request failed");
                self.view.restore([arc]);
            } else {
                handed.push(arc.peer);
            }
        }

        let job_id = self.next_job();
        let occ = own.len() as u32;
        if let Err(e) = self.send_to(&oldest, Message::Exchange { job_id, initiator: self.id.clone(), occ }) {
            self.view.restore(own);
            self.schedule_eviction(handed);
            return Err(e);
        }
        let deadline = self.deadline();
        self.exchanges.insert(
            job_id,
            InflightExchange { peer: oldest.clone(), deadline, repaired: false },
        );
        handed.push(oldest.clone());
        self.schedule_eviction(handed);

        tracing::debug!(job = %job_id, with = %oldest, occ, view = self.view.len(), "exchange started");
        Ok(Some(job_id))
    }

    pub(crate) fn on_exchange(&mut self, initiator: &PeerId, job: JobId, occ: u32) -> Result<()> {
        let sample = self.view.sample(initiator, false, &mut self.rng);
        self.view.remove_sample(&sample);

        let mut back = 0u32;
        let mut handed = Vec::new();
        for arc in sample {
            if &arc.peer == initiator {
                back += 1;
            } else if let Err(e) = self.request_link(initiator, &arc.peer) {
                tracing::warn!(via = %initiator, target = %arc.peer, error = %e, "exchange link request failed");
                self.view.restore([arc]);
            } else {
                handed.push(arc.peer);
            }
        }
        for _ in 0..occ {
            self.view.add_neighbor(initiator.clone());
        }

        self.send_to(initiator, Message::ExchangeReply { job_id: job, occ: back })?;
        self.schedule_eviction(handed);
        tracing::debug!(job = %job, with = %initiator, occ, back, view = self.view.len(), "exchange answered");
        Ok(())
    }

    pub(crate) fn on_exchange_reply(&mut self, from: &PeerId, job: JobId, occ: u32) -> Result<()> {
        let inflight = self.exchanges.remove(&job).ok_or(MembershipError::UnknownJob(job))?;
        if &inflight.peer != from {
            self.exchanges.insert(job, inflight);
            return Err(MembershipError::Protocol(format!("exchange {job} answered by {from}")));
        }
        // The timeout repair already stood in for one of the returned arcs.
        let credit = if inflight.repaired { occ.saturating_sub(1) } else { occ };
        for _ in 0..credit {
            self.view.add_neighbor(from.clone());
        }
        tracing::info!(job = %job, with = %from, late = inflight.repaired, view = self.view.len(), "exchange completed");
        Ok(())
    }

    pub(crate) fn expire_exchanges(&mut self, now: Instant) {
        let expired: Vec<JobId> = self
            .exchanges
            .iter()
            .filter(|(_, x)| x.deadline <= now)
            .map(|(job, _)| *job)
            .collect();
        let grace = self.config.timeout();
        for job in expired {
            let Some(x) = self.exchanges.get_mut(&job) else {
                continue;
            };
            if x.repaired {
                self.exchanges.remove(&job);
                continue;
            }
            x.repaired = true;
            x.deadline += grace;
            let err = MembershipError::HandshakeTimeout(job);
            tracing::warn!(job = %job, with = %x.peer, error = %err, "exchange reply missing");
            self.on_arc_down();
        }
    }

    // ── Socket eviction ───────────────────────────────────────────────────────

    fn schedule_eviction(&mut self, mut peers: Vec<PeerId>) {
        peers.sort();
        peers.dedup();
        if peers.is_empty() {
            return;
        }
        let at = self.deadline();
        self.evictions.push(ScheduledEviction { at, peers });
    }

    pub(crate) fn run_evictions(&mut self, now: Instant) {
        let (due, later): (Vec<_>, Vec<_>) = std::mem::take(&mut self.evictions)
            .into_iter()
            .partition(|e| e.at <= now);
        self.evictions = later;

        for peer in due.into_iter().flat_map(|e| e.peers) {
            if self.still_needed(&peer) {
                continue;
            }
            let job_id = self.next_job();
            match self.send_to(&peer, Message::Release { job_id }) {
                Ok(()) => tracing::debug!(%peer, "socket released"),
                Err(e) => tracing::trace!(%peer, error = %e, "release skipped"),
            }
        }
    }

    /// Whether the channel to `peer` still carries an arc or a handshake.
    fn still_needed(&self, peer: &PeerId) -> bool {
        let channel = self.sockets.get(peer);
        self.view.contains(peer)
            || self.pending.uses(peer, channel)
            || self.forwards.uses(peer, channel)
    }

    /// `peer` no longer references us; close if we don't reference it either.
    pub(crate) fn on_release(&mut self, peer: &PeerId) -> Result<()> {
        if self.still_needed(peer) {
            tracing::debug!(%peer, "release ignored, channel still in use");
            return Ok(());
        }
        if let Some(channel) = self.sockets.remove(peer) {
            self.transport.close(channel);
            self.emit(SprayEvent::Close(peer.clone()));
            tracing::debug!(%peer, %channel, "socket evicted");
        }
        Ok(())
    }

    // ── Leave ─────────────────────────────────────────────────────────────────

    /// Close every channel and forget all membership state. Neighbours find
    /// out through their own failure detection.
    pub fn leave(&mut self) {
        let (live, retired) = self.sockets.drain();
        for (peer, channel) in live {
            self.transport.close(channel);
            self.emit(SprayEvent::Close(peer));
        }
        for channel in retired {
            self.transport.close(channel);
        }
        for channel in self.forwards.channels() {
            self.transport.close(channel);
        }
        for (_, entry) in self.pending.drain() {
            self.transport.close(entry.channel);
        }
        self.forwards.clear();
        self.view.clear();
        self.exchanges.clear();
        self.evictions.clear();
        tracing::info!(peer = %self.id, "left the network");
    }

    /// A neighbour announced its departure.
    pub(crate) fn on_leave(&mut self, peer: &PeerId) -> Result<()> {
        if let Some(channel) = self.sockets.remove(peer) {
            self.transport.close(channel);
            self.emit(SprayEvent::Close(peer.clone()));
        }
        self.on_peer_down(peer);
        Ok(())
    }

    // ── Churn repair ──────────────────────────────────────────────────────────

    /// A neighbour is gone: drop its arcs and re-add redundancy. Each lost
    /// occurrence duplicates a surviving arc with probability occ/(|PV|+occ).
    pub fn on_peer_down(&mut self, peer: &PeerId) {
        let occ = self.view.remove_all(peer);
        if occ == 0 {
            return;
        }
        let survivors: Vec<PeerId> = self.view.iter().map(|a| a.peer.clone()).collect();
        let p = occ as f64 / (survivors.len() + occ) as f64;
        let mut added = 0usize;
        for _ in 0..occ {
            if !self.rng.gen_bool(p) {
                continue;
            }
            if let Some(dup) = survivors.choose(&mut self.rng) {
                self.view.add_neighbor(dup.clone());
                added += 1;
            }
        }
        tracing::info!(%peer, lost = occ, added, view = self.view.len(), "peer down, view repaired");
    }

    /// A single link attempt failed: duplicate one surviving arc.
    pub fn on_arc_down(&mut self) {
        let dup = self.view.random_arc(&mut self.rng).map(|a| a.peer.clone());
        if let Some(peer) = dup {
            self.view.add_neighbor(peer.clone());
            tracing::debug!(duplicated = %peer, view = self.view.len(), "arc down, view repaired");
        }
    }
}
