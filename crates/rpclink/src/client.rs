//! The initiating endpoint.
//!
//! A client dials its server, runs the handshake, and keeps one session. When
//! the transport drops while connected it reconnects in the background and
//! resumes the same session, so outstanding transfers are resent and remote
//! calls in flight still complete.

use crate::authorization::Authorization;
use crate::config::{EndpointOptions, ReconnectPlan};
use crate::endpoint::{Endpoint, EndpointEvent};
use crate::protocol::{Protocol, Roots, Value};
use crate::session::{Session, SessionEvent, SessionEvents};
use crate::transport::{Connector, Transport};
use crate::Error;
use futures_util::future::{BoxFuture, FutureExt};
use rpclink_core::{CloseCode, ConnectionState, MessageKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reconnect timing in milliseconds, as configured or negotiated.
#[derive(Debug, Clone, Copy, Default)]
struct ReconnectTiming {
    timeout: Option<i64>,
    interval: Option<i64>,
}

struct ClientShared {
    endpoint: Endpoint,
    connector: Box<dyn Connector>,
    session: Mutex<Option<Session>>,
    /// A transport that is connected but not yet authorized.
    unready: Mutex<Option<Arc<dyn Transport>>>,
    reconnect: Mutex<ReconnectTiming>,
    /// Bumped on every close so a pending reconnect task knows it is stale.
    epoch: AtomicU64,
}

/// An RPC client. Clones share the same connection.
#[derive(Clone)]
pub struct Client {
    shared: Arc<ClientShared>,
}

impl Client {
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        connector: impl Connector,
        options: EndpointOptions,
    ) -> Self {
        let reconnect = ReconnectTiming {
            timeout: options.reconnect_timeout,
            interval: options.reconnect_interval,
        };
        Self {
            shared: Arc::new(ClientShared {
                endpoint: Endpoint::new(name, address, options),
                connector: Box::new(connector),
                session: Mutex::new(None),
                unready: Mutex::new(None),
                reconnect: Mutex::new(reconnect),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.shared.endpoint.name()
    }

    pub fn address(&self) -> &str {
        self.shared.endpoint.context().address()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.endpoint.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.endpoint.watch_state()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EndpointEvent> {
        self.shared.endpoint.subscribe()
    }

    /// Make `value` reachable by name from the server.
    pub fn publish(&self, name: impl Into<String>, value: impl Into<Value>) -> Result<(), Error> {
        self.shared.endpoint.publish(name, value)
    }

    pub fn roots(&self) -> &Roots {
        self.shared.endpoint.roots()
    }

    pub fn session(&self) -> Option<Session> {
        lock(&self.shared.session).clone()
    }

    /// RPC access to the server.
    pub fn protocol(&self) -> Option<Protocol> {
        self.session().and_then(|session| session.protocol())
    }

    /// Connect and authorize, trying up to `retry_count` times.
    pub async fn open(&self, retry_count: u32, retry_interval: Duration) -> Result<(), Error> {
        self.shared.endpoint.begin_open(retry_count)?;
        info!(
            client = %self.name(),
            address = %self.address(),
            "opening rpc client"
        );
        match self.shared.open_loop(retry_count, retry_interval).await {
            Ok(()) => {
                self.shared.endpoint.mark_started();
                Ok(())
            }
            Err(err) if err.is_fatal() => {
                self.shared.endpoint.emit(EndpointEvent::Error(err.to_string()));
                self.shared.close(CloseCode::Unauthorized).await;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Say goodbye to the server and shut down.
    pub async fn close(&self) {
        self.shared.close(CloseCode::Normal).await;
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ClientShared {
    async fn open_loop(self: &Arc<Self>, retry_count: u32, retry_interval: Duration) -> Result<(), Error> {
        let shared = self.clone();
        self.endpoint
            .open_loop(retry_count, retry_interval, move || {
                ClientShared::connect_once(shared.clone())
            })
            .await
    }

    /// One connect-and-authorize attempt.
    fn connect_once(self: Arc<Self>) -> BoxFuture<'static, Result<(), Error>> {
        async move {
            let link = self
                .connector
                .connect(self.endpoint.context().address())
                .await?;
            let transport = link.transport.clone();
            *lock(&self.unready) = Some(transport.clone());

            let existing = lock(&self.session).clone();
            let mut authorization = Authorization::new(self.endpoint.context().clone(), link);
            let result = authorization.authorization(existing.as_ref()).await;
            lock(&self.unready).take();
            let authorized = match result {
                Ok(authorized) => authorized,
                Err(err) => {
                    error!(client = %self.endpoint.name(), error = %err, "authorization failed");
                    if let Err(err) = transport.disconnect(Some("authorization failed")).await {
                        debug!(error = %err, "transport disconnect failed");
                    }
                    return Err(err.into());
                }
            };

            let session = authorized.session;
            if let Some(events) = authorized.events {
                {
                    let mut reconnect = lock(&self.reconnect);
                    if !is_set(reconnect.timeout) {
                        reconnect.timeout = authorized.reconnect_timeout;
                    }
                    if !is_set(reconnect.interval) {
                        reconnect.interval = authorized.reconnect_interval;
                    }
                }
                *lock(&self.session) = Some(session.clone());
                tokio::spawn(drive_session(Arc::downgrade(&self), session.clone(), events));
            }
            session.status_sync(MessageKind::Request);
            session.start_keepalive();
            self.endpoint.emit(EndpointEvent::SessionConnected {
                name: session.remote_name().to_string(),
                id: session.id().to_string(),
            });
            Ok(())
        }
        .boxed()
    }

    async fn on_disconnect(self: &Arc<Self>, session: &Session, reason: Option<String>) {
        info!(
            client = %self.endpoint.name(),
            remote = %session.remote_name(),
            reason = reason.as_deref().unwrap_or(""),
            "transport lost"
        );
        self.endpoint.emit(EndpointEvent::SessionDisconnected {
            name: session.remote_name().to_string(),
            reason,
        });
        if self.endpoint.state() != ConnectionState::Connected {
            return;
        }
        let timing = *lock(&self.reconnect);
        let plan = ReconnectPlan::resolve(timing.timeout, timing.interval);
        if plan.attempts == 0 {
            self.close(CloseCode::Disconnected).await;
        } else {
            self.reconnect(plan);
        }
    }

    fn reconnect(self: &Arc<Self>, plan: ReconnectPlan) {
        self.endpoint.set_state(ConnectionState::Reconnecting);
        let epoch = self.epoch.load(Ordering::SeqCst);
        info!(
            client = %self.endpoint.name(),
            attempts = plan.attempts,
            interval_ms = plan.interval.as_millis() as u64,
            "reconnecting"
        );
        let client = Arc::downgrade(self);
        tokio::spawn(async move {
            sleep(plan.interval).await;
            let Some(client) = client.upgrade() else {
                return;
            };
            if client.epoch.load(Ordering::SeqCst) != epoch
                || client.endpoint.state() != ConnectionState::Reconnecting
            {
                return;
            }
            match client.open_loop(plan.attempts, plan.interval).await {
                Ok(()) => info!(client = %client.endpoint.name(), "reconnected"),
                Err(err) if err.is_fatal() => {
                    client.endpoint.emit(EndpointEvent::Error(err.to_string()));
                    client.close(CloseCode::Unauthorized).await;
                }
                Err(err) => {
                    let exhausted = client.epoch.load(Ordering::SeqCst) == epoch
                        && client.endpoint.state() == ConnectionState::Disconnected;
                    if exhausted {
                        warn!(client = %client.endpoint.name(), error = %err, "reconnect gave up");
                        client.teardown(CloseCode::Timeout).await;
                    }
                }
            }
        });
    }

    async fn close(&self, code: CloseCode) {
        if !self.endpoint.begin_close() {
            return;
        }
        info!(client = %self.endpoint.name(), ?code, "closing rpc client");
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let unready = lock(&self.unready).take();
        if let Some(transport) = unready {
            if let Err(err) = transport
                .disconnect(Some("close client unready transport"))
                .await
            {
                debug!(error = %err, "transport disconnect failed");
            }
        }
        self.endpoint.wait_open().await;
        self.teardown(code).await;
    }

    /// Leave the server and finish closing.
    async fn teardown(&self, code: CloseCode) {
        let session = lock(&self.session).take();
        if let Some(session) = session {
            session.wave().await;
            session.disconnect(None).await;
        }
        self.endpoint.finish_close(code);
    }
}

fn is_set(ms: Option<i64>) -> bool {
    ms.is_some_and(|ms| ms != 0)
}

async fn drive_session(client: Weak<ClientShared>, session: Session, mut events: SessionEvents) {
    let Some(protocol) = session.protocol() else {
        return;
    };
    let mut errors = protocol.subscribe_errors();
    drop(protocol);
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                let Some(client) = client.upgrade() else {
                    break;
                };
                match event {
                    SessionEvent::Recv(data) => {
                        if let Some(protocol) = session.protocol() {
                            protocol.handle(data);
                        }
                    }
                    SessionEvent::Disconnect(reason) => client.on_disconnect(&session, reason).await,
                    SessionEvent::Wave => debug!(remote = %session.remote_name(), "peer waved"),
                    SessionEvent::Error(message) => client.endpoint.emit(EndpointEvent::Error(message)),
                }
            }
            Ok(err) = errors.recv() => {
                if let Some(client) = client.upgrade() {
                    client.endpoint.emit(EndpointEvent::Error(err.to_string()));
                }
            }
        }
    }
}
