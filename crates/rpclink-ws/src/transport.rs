use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rpclink::{Link, Transport, TransportError, TransportEvent};
use rpclink_core::Message;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

type Events = mpsc::UnboundedSender<TransportEvent>;

/// Sending half of a WebSocket connection.
pub struct WebSocketTransport<S> {
    sink: Mutex<SplitSink<WebSocketStream<S>, WsMessage>>,
    events: Events,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

/// Wrap an established socket as an rpclink [`Link`].
pub fn link<S>(socket: WebSocketStream<S>) -> Link
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = socket.split();
    let (events, inbound) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    let reader = tokio::spawn(read_frames(stream, events.clone(), closed.clone()));
    let transport = WebSocketTransport {
        sink: Mutex::new(sink),
        events,
        closed,
        reader,
    };
    Link::new(Arc::new(transport), inbound)
}

#[async_trait]
impl<S> Transport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, message: &Message) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let text =
            serde_json::to_string(message).map_err(|e| TransportError::Encode(e.to_string()))?;
        self.sink
            .lock()
            .await
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn disconnect(&self, reason: Option<&str>) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.reader.abort();
        let _ = self
            .events
            .send(TransportEvent::Disconnect(reason.map(str::to_string)));
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: reason.unwrap_or_default().to_string().into(),
        };
        let mut sink = self.sink.lock().await;
        let result = sink.send(WsMessage::Close(Some(frame))).await;
        if let Err(err) = sink.close().await {
            debug!(error = %err, "websocket close failed");
        }
        result.map_err(|e| TransportError::Io(e.to_string()))
    }
}

async fn read_frames<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    events: Events,
    closed: Arc<AtomicBool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let reason = loop {
        match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                match serde_json::from_str::<serde_json::Value>(text.as_str()) {
                    Ok(frame) => {
                        if events.send(TransportEvent::Recv(frame)).is_err() {
                            break None;
                        }
                    }
                    Err(err) => warn!(error = %err, "dropping undecodable frame"),
                }
            }
            Some(Ok(WsMessage::Close(frame))) => {
                break frame
                    .map(|frame| frame.reason.as_str().to_string())
                    .filter(|reason| !reason.is_empty());
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                debug!(error = %err, "websocket error");
                break Some(err.to_string());
            }
            None => break None,
        }
    };
    if !closed.swap(true, Ordering::SeqCst) {
        let _ = events.send(TransportEvent::Disconnect(reason));
    }
}
