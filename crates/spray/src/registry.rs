//! Routes pass-through `Event` messages to the protocol that owns them.

use std::collections::HashMap;

use anyhow::Result;
use spray_core::wire::PeerId;

/// Application protocol layered on top of the membership overlay.
///
/// The engine calls `on_event` for every `Event` message addressed to the
/// protocol name it was registered under. The engine does not interpret
/// `args`.
pub trait ProtocolHandler: Send {
    fn on_event(&mut self, from: &PeerId, name: &str, args: &serde_json::Value) -> Result<()>;
}

/// Maps protocol names to handlers.
#[derive(Default)]
pub struct ProtocolRegistry {
    handlers: HashMap<String, Box<dyn ProtocolHandler>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Returns the one it replaced, if any.
    pub fn register(
        &mut self,
        protocol: impl Into<String>,
        handler: Box<dyn ProtocolHandler>,
    ) -> Option<Box<dyn ProtocolHandler>> {
        self.handlers.insert(protocol.into(), handler)
    }

    pub fn unregister(&mut self, protocol: &str) -> Option<Box<dyn ProtocolHandler>> {
        self.handlers.remove(protocol)
    }

    pub fn contains(&self, protocol: &str) -> bool {
        self.handlers.contains_key(protocol)
    }

    /// Hand an event to its protocol.
    /// Returns false if no handler is registered under `protocol`.
    pub fn dispatch(
        &mut self,
        from: &PeerId,
        protocol: &str,
        name: &str,
        args: &serde_json::Value,
    ) -> bool {
        let Some(handler) = self.handlers.get_mut(protocol) else {
            return false;
        };
        if let Err(e) = handler.on_event(from, name, args) {
            tracing::warn!(%protocol, %name, %from, error = %e, "protocol event handling failed");
        }
        true
    }
}

impl std::fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolRegistry")
            .field("protocols", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
