//! Wire types for rpclink.
//!
//! This crate provides the framing shared by both peers: the session
//! envelope, the handshake payload, and the RPC envelope with its tagged
//! value encoding. The engine itself lives in the `rpclink` crate.

mod envelope;
mod error;
mod message;
mod signature;
mod value;

pub use envelope::{RpcAction, RpcEnvelope};
pub use error::WireError;
pub use message::{Action, AuthorizationData, Message, MessageKind, SignalData};
pub use signature::{check_signature, make_signature};
pub use value::{DelegateRef, ErrorFrame, ValueType, WireValue};

use serde_repr::{Deserialize_repr, Serialize_repr};
use std::fmt;

/// Connection lifecycle state of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not connected and not trying to connect.
    Disconnected,
    /// Running the initial open loop.
    Connecting,
    /// Authorized and carrying traffic.
    Connected,
    /// Tearing down.
    Disconnecting,
    /// Transport lost, retrying with the existing session (client only).
    Reconnecting,
}

impl ConnectionState {
    /// Whether an open loop is allowed to keep running in this state.
    pub fn is_opening(self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Disconnecting => "Disconnecting",
            Self::Reconnecting => "Reconnecting",
        };
        f.write_str(name)
    }
}

/// Reason code reported when an endpoint closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum CloseCode {
    /// Closed on request.
    Normal = 0,
    /// Transport lost and reconnecting was disabled.
    Disconnected = 1,
    /// Reconnecting gave up.
    Timeout = 2,
    /// The peer rejected the handshake.
    Unauthorized = 3,
}
