//! Bidirectional RPC over a reconnecting transport.
//!
//! A [`Server`] and a [`Client`] authorize each other, then share a
//! [`Session`] that survives transport loss: unacknowledged transfers are
//! resent after a reconnect and duplicates are dropped. On top of the
//! session a [`Protocol`] lets each side call objects the other published,
//! pass its own objects and callbacks by reference, and receive remote
//! objects as [`Proxy`] handles that are released when dropped.
//!
//! The transport is pluggable through [`Transport`] and [`Connector`]. An
//! in-process pair lives in [`transport::memory`]; WebSockets are provided
//! by the `rpclink-ws` crate.

mod authorization;
mod client;
pub mod config;
mod endpoint;
mod error;
pub mod protocol;
mod recycle;
mod server;
mod session;
pub mod transport;

pub use authorization::{Authorization, Authorized};
pub use client::Client;
pub use config::EndpointOptions;
pub use endpoint::{EndpointContext, EndpointEvent};
pub use error::{AuthError, Error};
pub use protocol::{
    Class, Function, Protocol, Proxy, Reply, Roots, RpcError, Service, Target, TargetKind, Value,
};
pub use recycle::{Recycle, RecycleError};
pub use server::Server;
pub use session::{generate_id, Session, SessionEvent, SessionEvents, SessionMap, SessionOptions};
pub use transport::{Connector, Link, Transport, TransportError, TransportEvent, TransportEvents};

pub use rpclink_core::{CloseCode, ConnectionState};
