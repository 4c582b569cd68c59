//! Chat-client port.
//!
//! The authenticated client lives in an adapter crate. The core only constructs
//! it, tears it down, and consumes its lifecycle events.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::{errors::Error, Result};

/// Lifecycle events raised by a chat client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientEvent {
    /// No valid session: the payload must be shown to the operator as a QR code.
    HandshakeNeeded(String),
    Ready,
    AuthFailure(String),
}

/// An event tagged with the client instance that raised it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientEnvelope {
    pub generation: u64,
    pub event: ClientEvent,
}

/// Sender half handed to a client instance at construction.
#[derive(Clone, Debug)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<ClientEnvelope>,
}

impl EventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<ClientEnvelope>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, event: ClientEvent) -> Result<()> {
        self.tx
            .send(ClientEnvelope {
                generation: self.generation,
                event,
            })
            .map_err(|_| Error::External("client event channel closed".to_string()))
    }
}

#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Start connecting. Lifecycle events follow on the instance's [`EventSink`].
    async fn initialize(&self) -> Result<()>;

    async fn destroy(&self) -> Result<()>;

    /// Send a text message to a chat-client recipient (phone number or chat id).
    async fn send_text(&self, to: &str, text: &str) -> Result<()>;
}

/// Builds a fresh client per connection attempt; instances are never reused
/// after an authentication failure.
pub trait ChatClientFactory: Send + Sync {
    fn create(&self, events: EventSink) -> Result<Arc<dyn ChatClient>>;
}

/// Read-only view of the supervised connection handed to modules.
#[derive(Clone)]
pub struct ClientHandle {
    client: watch::Receiver<Option<Arc<dyn ChatClient>>>,
    ready: watch::Receiver<bool>,
}

impl ClientHandle {
    pub fn new(
        client: watch::Receiver<Option<Arc<dyn ChatClient>>>,
        ready: watch::Receiver<bool>,
    ) -> Self {
        Self { client, ready }
    }

    pub fn current(&self) -> Option<Arc<dyn ChatClient>> {
        self.client.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("has_client", &self.client.borrow().is_some())
            .field("ready", &self.is_ready())
            .finish()
    }
}
