//! The transport contract the engine runs on.
//!
//! A transport is a bidirectional frame channel. The engine only needs to
//! send a [`Message`], ask for a disconnect, and read a stream of
//! [`TransportEvent`]s. A [`Link`] bundles the sending half with its event
//! stream so ownership of the inbound side can be handed from the handshake
//! to the session that ends up owning the transport.

pub mod memory;

use async_trait::async_trait;
use rpclink_core::Message;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Something a transport reports upward.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A decoded JSON frame.
    Recv(serde_json::Value),
    /// The transport is gone; no further events follow.
    Disconnect(Option<String>),
}

/// Inbound side of a transport.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Errors surfaced by a transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,
    #[error("failed to connect to {address}: {reason}")]
    Connect { address: String, reason: String },
    #[error("failed to encode frame: {0}")]
    Encode(String),
    #[error("transport I/O error: {0}")]
    Io(String),
}

/// Sending half of a transport.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, message: &Message) -> Result<(), TransportError>;

    /// Close the transport. Implementations emit
    /// [`TransportEvent::Disconnect`] exactly once, whether the close was
    /// requested locally or by the peer.
    async fn disconnect(&self, reason: Option<&str>) -> Result<(), TransportError>;
}

/// A connected transport together with its event stream.
pub struct Link {
    pub transport: Arc<dyn Transport>,
    pub events: TransportEvents,
}

impl Link {
    pub fn new(transport: Arc<dyn Transport>, events: TransportEvents) -> Self {
        Self { transport, events }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").finish_non_exhaustive()
    }
}

/// Opens client-side transports.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, address: &str) -> Result<Link, TransportError>;
}
