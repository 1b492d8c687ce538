//! The Spray engine — one participant's membership state and its public API.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};

use spray_core::config::{ChannelConfig, MembershipConfig, SprayConfig};
use spray_core::wire::{JobId, Message, PeerId, Ticket};

use crate::clock::{Clock, SystemClock};
use crate::error::{MembershipError, Result};
use crate::exchange::{InflightExchange, ScheduledEviction};
use crate::partial_view::PartialView;
use crate::registry::{ProtocolHandler, ProtocolRegistry};
use crate::tables::{ForwardTable, PendingTable, SocketTable};
use crate::transport::{ChannelEvent, ChannelId, Transport};

/// What the engine reports to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SprayEvent {
    /// A channel to this peer was promoted.
    Open(PeerId),
    /// The channel to this peer went away, or a link attempt to it failed.
    Close(PeerId),
    /// A ticket for the external rendezvous to deliver (bootstrap only).
    Rendezvous(Ticket),
}

pub struct Spray<T: Transport> {
    pub(crate) id: PeerId,
    pub(crate) config: MembershipConfig,
    pub(crate) channel_config: ChannelConfig,
    pub(crate) transport: T,
    pub(crate) clock: Box<dyn Clock>,
    pub(crate) rng: Box<dyn RngCore + Send>,
    pub(crate) view: PartialView,
    pub(crate) sockets: SocketTable,
    pub(crate) pending: PendingTable,
    pub(crate) forwards: ForwardTable,
    pub(crate) exchanges: HashMap<JobId, InflightExchange>,
    pub(crate) evictions: Vec<ScheduledEviction>,
    pub(crate) protocols: ProtocolRegistry,
    events: VecDeque<SprayEvent>,
    next_channel: u64,
}

impl<T: Transport> Spray<T> {
    /// Engine with the system clock and an entropy-seeded random source.
    pub fn new(id: PeerId, config: &SprayConfig, transport: T) -> Result<Self> {
        Self::with_parts(
            id,
            config,
            transport,
            Box::new(SystemClock),
            Box::new(StdRng::from_entropy()),
        )
    }

    /// Engine with an injected clock and random source. Fails fast on an
    /// invalid configuration.
    pub fn with_parts(
        id: PeerId,
        config: &SprayConfig,
        transport: T,
        clock: Box<dyn Clock>,
        rng: Box<dyn RngCore + Send>,
    ) -> Result<Self> {
        config.validate()?;
        tracing::debug!(peer = %id, timeout_ms = config.membership.timeout_ms, "spray engine created");
        Ok(Self {
            id,
            config: config.membership.clone(),
            channel_config: config.channel.clone(),
            transport,
            clock,
            rng,
            view: PartialView::new(),
            sockets: SocketTable::new(),
            pending: PendingTable::new(),
            forwards: ForwardTable::new(),
            exchanges: HashMap::new(),
            evictions: Vec::new(),
            protocols: ProtocolRegistry::new(),
            events: VecDeque::new(),
            next_channel: 0,
        })
    }

    // ── Read access ───────────────────────────────────────────────────────────

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn config(&self) -> &MembershipConfig {
        &self.config
    }

    pub fn view(&self) -> &PartialView {
        &self.view
    }

    pub fn sockets(&self) -> &SocketTable {
        &self.sockets
    }

    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    pub fn forwards(&self) -> &ForwardTable {
        &self.forwards
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Whether we hold at least one arc.
    pub fn is_connected(&self) -> bool {
        !self.view.is_empty()
    }

    /// Up to `k` distinct neighbours, chosen at random.
    pub fn peers(&mut self, k: usize) -> Vec<PeerId> {
        let mut peers = self.view.peers();
        peers.shuffle(&mut self.rng);
        peers.truncate(k);
        peers
    }

    // ── Extensions ────────────────────────────────────────────────────────────

    pub fn register_protocol(
        &mut self,
        protocol: impl Into<String>,
        handler: Box<dyn ProtocolHandler>,
    ) -> Option<Box<dyn ProtocolHandler>> {
        self.protocols.register(protocol, handler)
    }

    /// Send a pass-through event to a neighbour.
    pub fn send_event(
        &mut self,
        peer: &PeerId,
        protocol: impl Into<String>,
        name: impl Into<String>,
        args: serde_json::Value,
    ) -> Result<()> {
        let job_id = self.next_job();
        self.send_to(
            peer,
            Message::Event {
                job_id,
                protocol: protocol.into(),
                name: name.into(),
                args,
            },
        )
    }

    // ── Events ────────────────────────────────────────────────────────────────

    pub fn poll_event(&mut self) -> Option<SprayEvent> {
        self.events.pop_front()
    }

    pub fn drain_events(&mut self) -> Vec<SprayEvent> {
        self.events.drain(..).collect()
    }

    // ── Inbound ───────────────────────────────────────────────────────────────

    /// Feed one transport event into the engine.
    pub fn handle_channel_event(&mut self, channel: ChannelId, event: ChannelEvent) {
        let result = match event {
            ChannelEvent::Signal(payload) => self.on_local_signal(channel, payload),
            ChannelEvent::Connect => self.on_connect(channel),
            ChannelEvent::Data(message) => {
                self.receive(channel, message);
                Ok(())
            }
            ChannelEvent::Close => self.on_channel_close(channel),
        };
        self.log_dropped(result);
    }

    /// Check every deadline against the clock.
    pub fn tick(&mut self) {
        let now = self.now();

        for (job, entry) in self.pending.take_expired(now) {
            tracing::debug!(job = %job, channel = %entry.channel, "handshake expired");
            self.fail_handshake(entry, &MembershipError::HandshakeTimeout(job));
        }

        let dropped = self.forwards.expire(now);
        if dropped > 0 {
            tracing::debug!(dropped, "forwarded tickets expired");
        }

        for channel in self.sockets.take_retired(now) {
            tracing::trace!(%channel, "retired channel closed");
            self.transport.close(channel);
        }

        self.expire_exchanges(now);
        self.run_evictions(now);
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn on_channel_close(&mut self, channel: ChannelId) -> Result<()> {
        if let Some(job) = self.pending.job_for_channel(channel) {
            if let Some(entry) = self.pending.remove(&job) {
                self.fail_handshake(entry, &MembershipError::Protocol(format!("{channel} closed")));
            }
            return Ok(());
        }
        if self.sockets.forget_retired(channel) {
            tracing::trace!(%channel, "retired channel closed by the far end");
            return Ok(());
        }
        let Some(peer) = self.sockets.peer_of(channel).cloned() else {
            tracing::trace!(%channel, "close on an untracked channel");
            return Ok(());
        };
        self.sockets.remove(&peer);
        tracing::debug!(%peer, %channel, "channel closed");
        self.emit(SprayEvent::Close(peer.clone()));
        self.on_peer_down(&peer);
        Ok(())
    }

    pub(crate) fn log_dropped(&self, result: Result<()>) {
        if let Err(e) = result {
            if e.is_benign() {
                tracing::debug!(peer = %self.id, error = %e, "dropped");
            } else {
                tracing::warn!(peer = %self.id, error = %e, "dropped");
            }
        }
    }

    pub(crate) fn emit(&mut self, event: SprayEvent) {
        self.events.push_back(event);
    }

    pub(crate) fn next_channel(&mut self) -> ChannelId {
        self.next_channel += 1;
        ChannelId(self.next_channel)
    }

    pub(crate) fn next_job(&mut self) -> JobId {
        JobId::random(&mut self.rng)
    }

    fn now(&self) -> Instant {
        self.clock.now()
    }

    pub(crate) fn deadline(&self) -> Instant {
        self.clock.now() + self.config.timeout()
    }

    pub(crate) fn send_to(&mut self, peer: &PeerId, message: Message) -> Result<()> {
        let channel = self
            .sockets
            .get(peer)
            .ok_or_else(|| MembershipError::PeerNotFound(peer.clone()))?;
        tracing::trace!(%peer, kind = message.kind(), job = %message.job_id(), "send");
        self.transport.send(channel, &message)?;
        Ok(())
    }
}
