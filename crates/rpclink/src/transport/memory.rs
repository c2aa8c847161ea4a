//! In-process transport.
//!
//! Frames are passed through channels as JSON values, exactly as a network
//! transport would decode them. Used by the tests and by anything that wants
//! two endpoints in one process.

use super::{Connector, Link, Transport, TransportError, TransportEvent};
use crate::Server;
use async_trait::async_trait;
use rpclink_core::Message;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type Ends = [mpsc::UnboundedSender<TransportEvent>; 2];

struct Wire {
    ends: Mutex<Option<Ends>>,
}

/// One end of an in-process transport.
pub struct MemoryTransport {
    wire: Arc<Wire>,
    side: usize,
}

impl MemoryTransport {
    pub fn is_closed(&self) -> bool {
        self.wire
            .ends
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, message: &Message) -> Result<(), TransportError> {
        let frame =
            serde_json::to_value(message).map_err(|e| TransportError::Encode(e.to_string()))?;
        let ends = self.wire.ends.lock().unwrap_or_else(PoisonError::into_inner);
        match ends.as_ref() {
            Some(ends) => ends[1 - self.side]
                .send(TransportEvent::Recv(frame))
                .map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    async fn disconnect(&self, reason: Option<&str>) -> Result<(), TransportError> {
        let ends = self
            .wire
            .ends
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(ends) = ends {
            for end in ends {
                let _ = end.send(TransportEvent::Disconnect(reason.map(str::to_string)));
            }
        }
        Ok(())
    }
}

/// Two connected in-process transports.
pub fn pair() -> (Link, Link) {
    let (left_tx, left_rx) = mpsc::unbounded_channel();
    let (right_tx, right_rx) = mpsc::unbounded_channel();
    let wire = Arc::new(Wire {
        ends: Mutex::new(Some([left_tx, right_tx])),
    });
    let left = MemoryTransport {
        wire: wire.clone(),
        side: 0,
    };
    let right = MemoryTransport { wire, side: 1 };
    (
        Link::new(Arc::new(left), left_rx),
        Link::new(Arc::new(right), right_rx),
    )
}

/// An in-process connector paired with a [`MemoryListener`].
#[derive(Clone)]
pub struct MemoryConnector {
    incoming: mpsc::UnboundedSender<Link>,
    offline: Arc<AtomicBool>,
}

impl MemoryConnector {
    /// While offline, every connect attempt fails.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, address: &str) -> Result<Link, TransportError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::Connect {
                address: address.to_string(),
                reason: "network is offline".to_string(),
            });
        }
        let (local, remote) = pair();
        self.incoming
            .send(remote)
            .map_err(|_| TransportError::Connect {
                address: address.to_string(),
                reason: "listener is gone".to_string(),
            })?;
        Ok(local)
    }
}

/// Receives the server ends of connections made through a [`MemoryConnector`].
pub struct MemoryListener {
    incoming: mpsc::UnboundedReceiver<Link>,
}

impl MemoryListener {
    pub async fn accept(&mut self) -> Option<Link> {
        self.incoming.recv().await
    }

    /// Hand every incoming connection to `server`.
    pub fn serve(mut self, server: Server) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(link) = self.accept().await {
                let server = server.clone();
                tokio::spawn(async move { server.accept(link).await });
            }
        })
    }
}

/// A connector and the listener it dials.
pub fn network() -> (MemoryConnector, MemoryListener) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MemoryConnector {
            incoming: tx,
            offline: Arc::new(AtomicBool::new(false)),
        },
        MemoryListener { incoming: rx },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpclink_core::Action;

    #[tokio::test]
    async fn frames_cross_to_the_other_end() {
        let (left, mut right) = pair();
        left.transport.send(&Message::bare(Action::Wave)).await.unwrap();
        match right.events.recv().await {
            Some(TransportEvent::Recv(frame)) => assert_eq!(frame["action"], 4),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnect_reaches_both_ends_once() {
        let (mut left, mut right) = pair();
        left.transport.disconnect(Some("bye")).await.unwrap();
        left.transport.disconnect(Some("again")).await.unwrap();

        for events in [&mut left.events, &mut right.events] {
            assert_eq!(
                events.recv().await,
                Some(TransportEvent::Disconnect(Some("bye".into())))
            );
            assert_eq!(events.recv().await, None);
        }
        assert!(matches!(
            right.transport.send(&Message::bare(Action::Wave)).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn offline_connector_fails() {
        let (connector, mut listener) = network();
        connector.set_offline(true);
        assert!(connector.connect("mem").await.is_err());
        connector.set_offline(false);
        let _client = connector.connect("mem").await.unwrap();
        assert!(listener.accept().await.is_some());
    }
}
