//! WebSocket transport for rpclink.
//!
//! Every rpclink frame travels as one JSON text message. Clients dial
//! `<address>/rpc/` through [`WebSocketConnector`]; servers hand accepted
//! sockets to an [`rpclink::Server`] with [`serve`].

mod connector;
mod listener;
mod transport;

pub use connector::{rpc_url, WebSocketConnector};
pub use listener::serve;
pub use transport::{link, WebSocketTransport};
