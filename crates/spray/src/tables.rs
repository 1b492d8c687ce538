//! Correlation tables for established sockets, handshakes in flight, and
//! tickets relayed on behalf of a neighbour.

use std::collections::HashMap;
use std::time::Instant;

use spray_core::wire::{JobId, Message, PeerId};

use crate::handshake::{Handshake, Route};
use crate::transport::ChannelId;

// ── Sockets ───────────────────────────────────────────────────────────────────

/// A promoted channel and the job that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Socket {
    pub channel: ChannelId,
    pub job: JobId,
}

/// A duplicate channel that lost the tie-break. It still carries traffic
/// until `close_at`, so the far end can reach the same decision first.
#[derive(Debug, Clone)]
struct Retired {
    peer: PeerId,
    close_at: Instant,
}

/// Outcome of promoting a channel to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First channel to this peer.
    New,
    /// A second channel connected. Both ends keep the one with the lower
    /// job id, whatever order their connects arrived in.
    Duplicate { kept: ChannelId, retired: ChannelId },
}

/// One established channel per remote peer, shared by every arc to it.
#[derive(Debug, Default)]
pub struct SocketTable {
    sockets: HashMap<PeerId, Socket>,
    retired: HashMap<ChannelId, Retired>,
}

impl SocketTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer: &PeerId) -> Option<ChannelId> {
        self.sockets.get(peer).map(|s| s.channel)
    }

    pub fn socket(&self, peer: &PeerId) -> Option<Socket> {
        self.sockets.get(peer).copied()
    }

    pub fn insert(&mut self, peer: PeerId, channel: ChannelId, job: JobId) -> Option<ChannelId> {
        self.sockets
            .insert(peer, Socket { channel, job })
            .map(|s| s.channel)
    }

    /// Promote `channel`, settling duplicates by job id.
    pub fn admit(&mut self, peer: PeerId, channel: ChannelId, job: JobId, grace_until: Instant) -> Admission {
        let Some(existing) = self.sockets.get(&peer).copied() else {
            self.sockets.insert(peer, Socket { channel, job });
            return Admission::New;
        };
        if existing.channel == channel {
            return Admission::New;
        }
        let (kept, retired) = if existing.job <= job {
            (existing.channel, channel)
        } else {
            self.sockets.insert(peer.clone(), Socket { channel, job });
            (channel, existing.channel)
        };
        self.retired.insert(retired, Retired { peer, close_at: grace_until });
        Admission::Duplicate { kept, retired }
    }

    pub fn remove(&mut self, peer: &PeerId) -> Option<ChannelId> {
        self.sockets.remove(peer).map(|s| s.channel)
    }

    /// Reverse lookup, retired channels included; the table stays small
    /// (one entry per neighbour).
    pub fn peer_of(&self, channel: ChannelId) -> Option<&PeerId> {
        self.sockets
            .iter()
            .find(|(_, s)| s.channel == channel)
            .map(|(p, _)| p)
            .or_else(|| self.retired.get(&channel).map(|r| &r.peer))
    }

    /// Forget a retired channel the far end already closed.
    pub fn forget_retired(&mut self, channel: ChannelId) -> bool {
        self.retired.remove(&channel).is_some()
    }

    /// Retired channels whose grace period is over.
    pub fn take_retired(&mut self, now: Instant) -> Vec<ChannelId> {
        let due: Vec<ChannelId> = self
            .retired
            .iter()
            .filter(|(_, r)| r.close_at <= now)
            .map(|(c, _)| *c)
            .collect();
        for channel in &due {
            self.retired.remove(channel);
        }
        due
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.sockets.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, ChannelId)> {
        self.sockets.iter().map(|(p, s)| (p, s.channel))
    }

    /// Empty the table: live sockets with their peer, then bare retired channels.
    pub fn drain(&mut self) -> (Vec<(PeerId, ChannelId)>, Vec<ChannelId>) {
        let live = self.sockets.drain().map(|(p, s)| (p, s.channel)).collect();
        let retired = self.retired.drain().map(|(c, _)| c).collect();
        (live, retired)
    }
}

// ── Pending handshakes ────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct PendingEntry {
    /// The channel being established. Owned here until promotion.
    pub channel: ChannelId,
    pub handshake: Handshake,
    pub deadline: Instant,
}

/// Handshakes in flight, keyed by job id.
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: HashMap<JobId, PendingEntry>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, job: JobId, entry: PendingEntry) {
        self.entries.insert(job, entry);
    }

    pub fn get(&self, job: &JobId) -> Option<&PendingEntry> {
        self.entries.get(job)
    }

    pub fn get_mut(&mut self, job: &JobId) -> Option<&mut PendingEntry> {
        self.entries.get_mut(job)
    }

    pub fn remove(&mut self, job: &JobId) -> Option<PendingEntry> {
        self.entries.remove(job)
    }

    pub fn contains(&self, job: &JobId) -> bool {
        self.entries.contains_key(job)
    }

    pub fn job_for_channel(&self, channel: ChannelId) -> Option<JobId> {
        self.entries
            .iter()
            .find(|(_, e)| e.channel == channel)
            .map(|(job, _)| *job)
    }

    /// Whether a handshake towards `peer`, or one relayed through `via`, is in flight.
    pub fn uses(&self, peer: &PeerId, via: Option<ChannelId>) -> bool {
        self.entries.values().any(|e| {
            e.handshake.remote() == Some(peer)
                || matches!(e.handshake.route(), Route::Channel(c) if Some(c) == via)
        })
    }

    /// Remove and return every entry whose deadline has passed.
    pub fn take_expired(&mut self, now: Instant) -> Vec<(JobId, PendingEntry)> {
        let expired: Vec<JobId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(job, _)| *job)
            .collect();
        expired
            .into_iter()
            .filter_map(|job| self.entries.remove(&job).map(|e| (job, e)))
            .collect()
    }

    pub fn drain(&mut self) -> Vec<(JobId, PendingEntry)> {
        self.entries.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Forwarded tickets ─────────────────────────────────────────────────────────

/// A link request we issued as the relay between two neighbours.
#[derive(Debug, Clone)]
pub struct ForwardEntry {
    /// Channel to the neighbour that will produce the offer and receive the answer.
    pub channel: ChannelId,
    /// The `TicketRequest` as sent.
    pub request: Message,
    pub deadline: Instant,
}

impl ForwardEntry {
    /// Who the offer should be relayed to.
    pub fn target(&self) -> Option<&PeerId> {
        match &self.request {
            Message::TicketRequest { target, .. } => Some(target),
            _ => None,
        }
    }
}

/// Correlation id → requester, so an answer can be relayed back without
/// any global routing knowledge.
#[derive(Debug, Default)]
pub struct ForwardTable {
    entries: HashMap<JobId, ForwardEntry>,
}

impl ForwardTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, job: JobId, entry: ForwardEntry) {
        self.entries.insert(job, entry);
    }

    pub fn get(&self, job: &JobId) -> Option<&ForwardEntry> {
        self.entries.get(job)
    }

    pub fn remove(&mut self, job: &JobId) -> Option<ForwardEntry> {
        self.entries.remove(job)
    }

    pub fn contains(&self, job: &JobId) -> bool {
        self.entries.contains_key(job)
    }

    /// Whether some relay still needs the channel to `peer`.
    pub fn uses(&self, peer: &PeerId, channel: Option<ChannelId>) -> bool {
        self.entries
            .values()
            .any(|e| e.target() == Some(peer) || Some(e.channel) == channel)
    }

    /// Drop entries past their deadline. Returns how many were dropped.
    pub fn expire(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.deadline > now);
        before - self.entries.len()
    }

    pub fn channels(&self) -> Vec<ChannelId> {
        self.entries.values().map(|e| e.channel).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
