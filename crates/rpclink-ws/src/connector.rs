use crate::transport::link;
use async_trait::async_trait;
use rpclink::{Connector, Link, TransportError};
use tracing::debug;

/// The endpoint URL rpclink listens on under `address`.
pub fn rpc_url(address: &str) -> String {
    if address.ends_with('/') {
        format!("{address}rpc/")
    } else {
        format!("{address}/rpc/")
    }
}

/// Dials `ws://` and `wss://` addresses.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, address: &str) -> Result<Link, TransportError> {
        let url = rpc_url(address);
        let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect {
                address: url.clone(),
                reason: e.to_string(),
            })?;
        debug!(%url, "websocket connected");
        Ok(link(socket))
    }
}
