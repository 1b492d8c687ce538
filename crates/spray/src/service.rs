//! Async driver that runs one engine on a tokio task.
//!
//! Transport events, application commands and the two timers (exchange
//! period and deadline sweep) are multiplexed onto a single `select!` loop,
//! so the engine sees one event at a time. Engine events are fanned out to
//! subscribers over a broadcast channel.

use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use spray_core::wire::{JobId, PeerId, Ticket};

use crate::clock::Clock;
use crate::error::MembershipError;
use crate::node::{Spray, SprayEvent};
use crate::transport::{ChannelEvent, ChannelId, Transport};

/// Stream of events the transport reports for the engine's channels.
pub type TransportEvents = mpsc::UnboundedReceiver<(ChannelId, ChannelEvent)>;

const COMMAND_QUEUE: usize = 64;
const EVENT_QUEUE: usize = 256;

/// Clock that follows tokio time, so paused-time tests drive deadlines too.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

/// Requests from a `SprayHandle` to the service task.
#[derive(Debug)]
pub enum Command {
    Join {
        contact: Option<PeerId>,
        reply: oneshot::Sender<Result<JobId, MembershipError>>,
    },
    AcceptRendezvous {
        ticket: Ticket,
        reply: oneshot::Sender<Result<(), MembershipError>>,
    },
    Exchange {
        reply: oneshot::Sender<Option<JobId>>,
    },
    SendEvent {
        peer: PeerId,
        protocol: String,
        name: String,
        args: serde_json::Value,
        reply: oneshot::Sender<Result<(), MembershipError>>,
    },
    Peers {
        k: usize,
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    ViewLen {
        reply: oneshot::Sender<usize>,
    },
    Leave {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable front end to a running `SprayService`.
#[derive(Debug, Clone)]
pub struct SprayHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SprayEvent>,
}

impl SprayHandle {
    async fn call<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| anyhow::anyhow!("spray service stopped"))?;
        rx.await.context("spray service dropped the request")
    }

    pub async fn join(&self, contact: Option<PeerId>) -> Result<JobId> {
        Ok(self.call(|reply| Command::Join { contact, reply }).await??)
    }

    pub async fn accept_rendezvous(&self, ticket: Ticket) -> Result<()> {
        Ok(self
            .call(|reply| Command::AcceptRendezvous { ticket, reply })
            .await??)
    }

    /// Trigger a shuffle round now instead of waiting for the timer.
    pub async fn exchange(&self) -> Result<Option<JobId>> {
        self.call(|reply| Command::Exchange { reply }).await
    }

    pub async fn send_event(
        &self,
        peer: PeerId,
        protocol: impl Into<String>,
        name: impl Into<String>,
        args: serde_json::Value,
    ) -> Result<()> {
        let (protocol, name) = (protocol.into(), name.into());
        Ok(self
            .call(|reply| Command::SendEvent { peer, protocol, name, args, reply })
            .await??)
    }

    pub async fn peers(&self, k: usize) -> Result<Vec<PeerId>> {
        self.call(|reply| Command::Peers { k, reply }).await
    }

    pub async fn view_len(&self) -> Result<usize> {
        self.call(|reply| Command::ViewLen { reply }).await
    }

    pub async fn leave(&self) -> Result<()> {
        self.call(|reply| Command::Leave { reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SprayEvent> {
        self.events.subscribe()
    }
}

pub struct SprayService<T: Transport> {
    spray: Spray<T>,
    transport_events: TransportEvents,
    commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<SprayEvent>,
    shutdown: broadcast::Receiver<()>,
}

impl<T: Transport + Send + 'static> SprayService<T> {
    pub fn new(
        spray: Spray<T>,
        transport_events: TransportEvents,
        shutdown: broadcast::Receiver<()>,
    ) -> (Self, SprayHandle) {
        let (command_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let (events, _) = broadcast::channel(EVENT_QUEUE);
        let handle = SprayHandle {
            commands: command_tx,
            events: events.clone(),
        };
        let service = Self {
            spray,
            transport_events,
            commands,
            events,
            shutdown,
        };
        (service, handle)
    }

    /// Build the service and run it on a new task.
    pub fn spawn(
        spray: Spray<T>,
        transport_events: TransportEvents,
        shutdown: broadcast::Receiver<()>,
    ) -> (JoinHandle<Result<()>>, SprayHandle) {
        let (service, handle) = Self::new(spray, transport_events, shutdown);
        (tokio::spawn(service.run()), handle)
    }

    /// Runs until shutdown, or until the transport or every handle goes away.
    pub async fn run(mut self) -> Result<()> {
        let config = self.spray.config().clone();
        let start = tokio::time::Instant::now();
        let mut exchange_interval =
            tokio::time::interval_at(start + config.delta_time(), config.delta_time());
        let mut sweep_interval =
            tokio::time::interval_at(start + config.sweep_interval(), config.sweep_interval());

        tracing::info!(
            peer = %self.spray.id(),
            delta_ms = config.delta_time_ms,
            timeout_ms = config.timeout_ms,
            "spray service starting"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!(peer = %self.spray.id(), "spray service shutting down");
                    self.spray.leave();
                    self.publish();
                    return Ok(());
                }

                _ = exchange_interval.tick() => {
                    if let Some(job) = self.spray.exchange() {
                        tracing::trace!(job = %job, "periodic exchange");
                    }
                }

                _ = sweep_interval.tick() => {
                    self.spray.tick();
                }

                event = self.transport_events.recv() => {
                    let Some((channel, event)) = event else {
                        tracing::info!(peer = %self.spray.id(), "transport event stream closed");
                        return Ok(());
                    };
                    self.spray.handle_channel_event(channel, event);
                }

                command = self.commands.recv() => {
                    let Some(command) = command else {
                        tracing::info!(peer = %self.spray.id(), "all handles dropped");
                        return Ok(());
                    };
                    self.handle_command(command);
                }
            }
            self.publish();
        }
    }

    fn handle_command(&mut self, command: Command) {
        // A dropped reply receiver only means the caller gave up waiting.
        match command {
            Command::Join { contact, reply } => {
                let _ = reply.send(self.spray.join(contact.as_ref()));
            }
            Command::AcceptRendezvous { ticket, reply } => {
                let _ = reply.send(self.spray.accept_rendezvous(ticket));
            }
            Command::Exchange { reply } => {
                let _ = reply.send(self.spray.exchange());
            }
            Command::SendEvent { peer, protocol, name, args, reply } => {
                let _ = reply.send(self.spray.send_event(&peer, protocol, name, args));
            }
            Command::Peers { k, reply } => {
                let _ = reply.send(self.spray.peers(k));
            }
            Command::ViewLen { reply } => {
                let _ = reply.send(self.spray.view().len());
            }
            Command::Leave { reply } => {
                self.spray.leave();
                let _ = reply.send(());
            }
        }
    }

    fn publish(&mut self) {
        while let Some(event) = self.spray.poll_event() {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }
}
