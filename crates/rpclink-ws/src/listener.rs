use crate::transport::link;
use rpclink::Server;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, info, warn};

/// Accept WebSocket connections on `listener` and hand each to `server`.
///
/// Runs until accepting fails.
pub async fn serve(listener: TcpListener, server: Server) -> std::io::Result<()> {
    info!(server = %server.name(), addr = ?listener.local_addr().ok(), "listening for websockets");
    loop {
        let (stream, peer) = listener.accept().await?;
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, server).await {
                warn!(%peer, error = %e, "websocket handshake failed");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    server: Server,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let socket = tokio_tungstenite::accept_hdr_async(stream, check_path).await?;
    debug!(%peer, "websocket accepted");
    server.accept(link(socket)).await;
    Ok(())
}

/// Only upgrade requests for the rpc endpoint.
fn check_path(request: &Request, response: Response) -> Result<Response, ErrorResponse> {
    match request.uri().path().trim_end_matches('/') {
        "/rpc" => Ok(response),
        path => {
            debug!(%path, "rejecting websocket upgrade");
            let mut rejection = ErrorResponse::new(Some(format!("no rpc endpoint at {path}")));
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            Err(rejection)
        }
    }
}
