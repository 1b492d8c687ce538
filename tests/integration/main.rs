//! Spray integration test harness.
//!
//! Everything runs in memory: a `Switchboard` stands in for the physical
//! channel layer and pairs channels by the signaling payloads the engines
//! exchange, the `Network` wrapper plays the external rendezvous and
//! pumps events until the system is quiet. Messages cross the switchboard
//! through the JSON codec, so every scenario also exercises the wire form.
//!
//!   cargo test --test integration
//!   RUST_LOG=spray=debug cargo test --test integration -- --nocapture

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;

use spray::{
    ChannelEvent, ChannelId, JobId, ManualClock, Message, PeerId, Role, SignalPayload, Spray,
    SprayConfig, SprayEvent, TicketKind, Transport, TransportError,
};
use spray_core::config::ChannelConfig;
use spray_core::wire;

mod convergence;
mod exchange;
mod handshake;

// ── Logging ───────────────────────────────────────────────────────────────────

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ── Switchboard ───────────────────────────────────────────────────────────────

pub type EventSink = mpsc::UnboundedSender<(ChannelId, ChannelEvent)>;

type Endpoint = (PeerId, ChannelId);

#[derive(Debug)]
struct Line {
    role: Role,
    remote: Option<Endpoint>,
    open: bool,
}

/// The simulated physical layer shared by every node.
///
/// Signaling payloads are `offer/<peer>/<channel>` and
/// `answer/<peer>/<channel>`: they name the endpoint that produced them,
/// which is all the switchboard needs to connect the two ends.
#[derive(Debug, Default)]
pub struct Switchboard {
    sinks: HashMap<PeerId, EventSink>,
    lines: HashMap<Endpoint, Line>,
    /// Nodes whose channels never produce a local signal.
    silent: HashSet<PeerId>,
}

pub type SharedSwitchboard = Arc<Mutex<Switchboard>>;

impl Switchboard {
    pub fn attach(&mut self, peer: PeerId, sink: EventSink) {
        self.sinks.insert(peer, sink);
    }

    pub fn silence(&mut self, peer: PeerId) {
        self.silent.insert(peer);
    }

    /// Drop every line the peer owns, as if its process died.
    pub fn crash(&mut self, peer: &PeerId) {
        self.sinks.remove(peer);
        let owned: Vec<Endpoint> = self
            .lines
            .keys()
            .filter(|(owner, _)| owner == peer)
            .cloned()
            .collect();
        for (owner, channel) in owned {
            self.hang_up(&owner, channel);
        }
    }

    /// Number of lines open in both directions.
    pub fn open_lines(&self) -> usize {
        self.lines.values().filter(|l| l.open).count() / 2
    }

    fn deliver(&self, to: &PeerId, channel: ChannelId, event: ChannelEvent) {
        if let Some(sink) = self.sinks.get(to) {
            let _ = sink.send((channel, event));
        }
    }

    fn create(&mut self, owner: &PeerId, channel: ChannelId, role: Role) -> Result<(), TransportError> {
        let key = (owner.clone(), channel);
        if self.lines.contains_key(&key) {
            return Err(TransportError::Other(format!("{channel} already exists")));
        }
        self.lines.insert(key, Line { role, remote: None, open: false });
        if role == Role::Initiator && !self.silent.contains(owner) {
            let offer = SignalPayload::new(format!("offer/{owner}/{}", channel.0));
            self.deliver(owner, channel, ChannelEvent::Signal(offer));
        }
        Ok(())
    }

    fn signal(&mut self, owner: &PeerId, channel: ChannelId, payload: &SignalPayload) -> Result<(), TransportError> {
        let (kind, remote) = parse_payload(payload)?;
        let key = (owner.clone(), channel);
        let role = self
            .lines
            .get(&key)
            .map(|l| l.role)
            .ok_or(TransportError::UnknownChannel(channel))?;

        match (role, kind) {
            (Role::Responder, "offer") => {
                if let Some(line) = self.lines.get_mut(&key) {
                    line.remote = Some(remote);
                }
                if !self.silent.contains(owner) {
                    let answer = SignalPayload::new(format!("answer/{owner}/{}", channel.0));
                    self.deliver(owner, channel, ChannelEvent::Signal(answer));
                }
                Ok(())
            }
            (Role::Initiator, "answer") => {
                let answered_us = self
                    .lines
                    .get(&remote)
                    .map(|l| l.remote.as_ref() == Some(&key))
                    .unwrap_or(false);
                if !answered_us {
                    return Err(TransportError::Other(format!("stale answer on {channel}")));
                }
                for end in [&key, &remote] {
                    if let Some(line) = self.lines.get_mut(end) {
                        line.open = true;
                    }
                }
                if let Some(line) = self.lines.get_mut(&key) {
                    line.remote = Some(remote.clone());
                }
                self.deliver(owner, channel, ChannelEvent::Connect);
                self.deliver(&remote.0, remote.1, ChannelEvent::Connect);
                Ok(())
            }
            _ => Err(TransportError::Other(format!("{kind} fed to a {role:?} channel"))),
        }
    }

    fn send(&mut self, owner: &PeerId, channel: ChannelId, message: &Message) -> Result<(), TransportError> {
        let line = self
            .lines
            .get(&(owner.clone(), channel))
            .ok_or(TransportError::NotOpen(channel))?;
        let remote = match (&line.remote, line.open) {
            (Some(remote), true) => remote.clone(),
            _ => return Err(TransportError::NotOpen(channel)),
        };
        let bytes = wire::encode(message).map_err(|e| TransportError::Other(e.to_string()))?;
        let decoded = wire::decode(&bytes).map_err(|e| TransportError::Other(e.to_string()))?;
        self.deliver(&remote.0, remote.1, ChannelEvent::Data(decoded));
        Ok(())
    }

    /// Close one end and report `Close` to the other end, if it still exists.
    fn hang_up(&mut self, owner: &PeerId, channel: ChannelId) {
        let key = (owner.clone(), channel);
        let Some(line) = self.lines.remove(&key) else {
            return;
        };
        // An initiator learns its remote only from the answer; the responder
        // may already point at us.
        let remote = line.remote.or_else(|| {
            self.lines
                .iter()
                .find(|(_, l)| l.remote.as_ref() == Some(&key))
                .map(|(k, _)| k.clone())
        });
        let Some(remote) = remote else {
            return;
        };
        if self.lines.remove(&remote).is_some() {
            self.deliver(&remote.0, remote.1, ChannelEvent::Close);
        }
    }
}

fn parse_payload(payload: &SignalPayload) -> Result<(&str, Endpoint), TransportError> {
    let bad = || TransportError::Other(format!("bad signal payload {:?}", payload.as_str()));
    let mut parts = payload.as_str().split('/');
    let kind = parts.next().ok_or_else(bad)?;
    let peer = parts.next().ok_or_else(bad)?;
    let channel: u64 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    Ok((kind, (PeerId::from(peer), ChannelId(channel))))
}

/// One node's handle onto the switchboard.
#[derive(Debug, Clone)]
pub struct SimTransport {
    owner: PeerId,
    board: SharedSwitchboard,
}

impl SimTransport {
    pub fn new(owner: PeerId, board: SharedSwitchboard) -> Self {
        Self { owner, board }
    }

    fn board(&self) -> std::sync::MutexGuard<'_, Switchboard> {
        self.board.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Transport for SimTransport {
    fn create(&mut self, channel: ChannelId, role: Role, _config: &ChannelConfig) -> Result<(), TransportError> {
        let owner = self.owner.clone();
        self.board().create(&owner, channel, role)
    }

    fn signal(&mut self, channel: ChannelId, payload: &SignalPayload) -> Result<(), TransportError> {
        let owner = self.owner.clone();
        self.board().signal(&owner, channel, payload)
    }

    fn send(&mut self, channel: ChannelId, message: &Message) -> Result<(), TransportError> {
        let owner = self.owner.clone();
        self.board().send(&owner, channel, message)
    }

    fn close(&mut self, channel: ChannelId) {
        let owner = self.owner.clone();
        self.board().hang_up(&owner, channel);
    }
}

// ── Network ───────────────────────────────────────────────────────────────────

pub struct Node {
    pub spray: Spray<SimTransport>,
    inbox: mpsc::UnboundedReceiver<(ChannelId, ChannelEvent)>,
    pub events: Vec<SprayEvent>,
}

/// A set of engines sharing one switchboard and one manual clock.
pub struct Network {
    pub clock: ManualClock,
    pub board: SharedSwitchboard,
    nodes: BTreeMap<PeerId, Node>,
    rng: StdRng,
    /// Bootstrap job → (joiner, contact).
    rendezvous: HashMap<JobId, (PeerId, PeerId)>,
}

const PUMP_LIMIT: usize = 100_000;

impl Network {
    pub fn new(seed: u64) -> Self {
        init_tracing();
        Self {
            clock: ManualClock::new(),
            board: SharedSwitchboard::default(),
            nodes: BTreeMap::new(),
            rng: StdRng::seed_from_u64(seed),
            rendezvous: HashMap::new(),
        }
    }

    pub fn add(&mut self, name: &str) -> PeerId {
        let id = PeerId::from(name);
        let (sink, inbox) = mpsc::unbounded_channel();
        self.board().attach(id.clone(), sink);
        let spray = Spray::with_parts(
            id.clone(),
            &SprayConfig::default(),
            SimTransport::new(id.clone(), self.board.clone()),
            Box::new(self.clock.clone()),
            Box::new(StdRng::seed_from_u64(self.rng.gen())),
        )
        .expect("default config is valid");
        self.nodes.insert(id.clone(), Node { spray, inbox, events: Vec::new() });
        id
    }

    /// `n` nodes, each joining through a random earlier member.
    pub fn grow(&mut self, n: usize) -> Result<Vec<PeerId>> {
        let mut ids: Vec<PeerId> = Vec::with_capacity(n);
        for i in 0..n {
            let id = self.add(&format!("n{i:02}"));
            if let Some(contact) = ids.choose(&mut self.rng).cloned() {
                self.join(&id, &contact)?;
            }
            ids.push(id);
        }
        Ok(ids)
    }

    /// Bootstrap `joiner` through `contact` via the rendezvous.
    pub fn join(&mut self, joiner: &PeerId, contact: &PeerId) -> Result<JobId> {
        let job = self
            .node_mut(joiner)?
            .spray
            .join(Some(contact))
            .context("join failed")?;
        self.rendezvous.insert(job, (joiner.clone(), contact.clone()));
        self.pump()?;
        Ok(job)
    }

    pub fn exchange(&mut self, id: &PeerId) -> Result<Option<JobId>> {
        let job = self.node_mut(id)?.spray.exchange();
        self.pump()?;
        Ok(job)
    }

    /// Every live node runs one exchange, in random order.
    pub fn round(&mut self) -> Result<()> {
        let mut ids = self.ids();
        ids.shuffle(&mut self.rng);
        for id in ids {
            if self.nodes.contains_key(&id) {
                self.exchange(&id)?;
            }
        }
        Ok(())
    }

    /// Move the clock, let every node check its deadlines, and settle.
    pub fn advance(&mut self, by: Duration) -> Result<()> {
        self.clock.advance(by);
        for node in self.nodes.values_mut() {
            node.spray.tick();
        }
        self.pump()
    }

    pub fn crash(&mut self, id: &PeerId) -> Result<()> {
        self.nodes.remove(id).context("unknown node")?;
        self.board().crash(id);
        self.pump()
    }

    pub fn leave(&mut self, id: &PeerId) -> Result<()> {
        let mut node = self.nodes.remove(id).context("unknown node")?;
        node.spray.leave();
        self.board().crash(id);
        self.pump()
    }

    pub fn silence(&mut self, id: &PeerId) {
        self.board().silence(id.clone());
    }

    /// Deliver queued transport events until every inbox is empty.
    pub fn pump(&mut self) -> Result<()> {
        for _ in 0..PUMP_LIMIT {
            let mut progressed = false;
            let mut tickets = Vec::new();

            for node in self.nodes.values_mut() {
                while let Ok((channel, event)) = node.inbox.try_recv() {
                    node.spray.handle_channel_event(channel, event);
                    progressed = true;
                }
                for event in node.spray.drain_events() {
                    if let SprayEvent::Rendezvous(ticket) = &event {
                        tickets.push(ticket.clone());
                    }
                    node.events.push(event);
                }
            }

            for ticket in tickets {
                let Some((joiner, contact)) = self.rendezvous.get(&ticket.job_id).cloned() else {
                    bail!("rendezvous ticket for unknown job {}", ticket.job_id);
                };
                let to = match ticket.kind {
                    TicketKind::Offer => contact,
                    TicketKind::Stamped => joiner,
                };
                if let Some(node) = self.nodes.get_mut(&to) {
                    if let Err(e) = node.spray.accept_rendezvous(ticket) {
                        tracing::debug!(%to, error = %e, "rendezvous ticket refused");
                    }
                }
                progressed = true;
            }

            if !progressed {
                return Ok(());
            }
        }
        bail!("network did not settle after {PUMP_LIMIT} pump passes")
    }

    // ── Inspection ──────────────────────────────────────────────────────────

    pub fn ids(&self) -> Vec<PeerId> {
        self.nodes.keys().cloned().collect()
    }

    pub fn node(&self, id: &PeerId) -> Result<&Node> {
        self.nodes.get(id).with_context(|| format!("no node {id}"))
    }

    pub fn node_mut(&mut self, id: &PeerId) -> Result<&mut Node> {
        self.nodes.get_mut(id).with_context(|| format!("no node {id}"))
    }

    pub fn spray(&self, id: &PeerId) -> &Spray<SimTransport> {
        &self.nodes[id].spray
    }

    pub fn view_len(&self, id: &PeerId) -> usize {
        self.spray(id).view().len()
    }

    pub fn total_arcs(&self) -> usize {
        self.nodes.values().map(|n| n.spray.view().len()).sum()
    }

    pub fn mean_view(&self) -> f64 {
        self.total_arcs() as f64 / self.nodes.len().max(1) as f64
    }

    fn board(&self) -> std::sync::MutexGuard<'_, Switchboard> {
        self.board.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every arc is carried by an indexed channel, no node points at itself,
    /// and no arc outlives the node it points to.
    pub fn check_invariants(&self) -> Result<()> {
        for (id, node) in &self.nodes {
            let spray = &node.spray;
            for arc in spray.view().iter() {
                if &arc.peer == id {
                    bail!("{id} holds an arc to itself");
                }
                if !spray.sockets().contains(&arc.peer) {
                    bail!("{id} holds an arc to {} without a channel", arc.peer);
                }
                if !self.nodes.contains_key(&arc.peer) {
                    bail!("{id} holds an arc to departed {}", arc.peer);
                }
            }
        }
        Ok(())
    }
}
