//! The accepting endpoint.
//!
//! A server takes transports from whatever listener feeds it, runs the
//! responder side of the handshake on each, and keeps one session per peer
//! name. Sessions whose transport dropped stay around for the peer to resume
//! until the sweeper evicts them.

use crate::authorization::Authorization;
use crate::config::EndpointOptions;
use crate::endpoint::{Endpoint, EndpointEvent};
use crate::protocol::{Protocol, Roots, Value};
use crate::session::{Session, SessionEvent, SessionEvents, SessionMap};
use crate::transport::{Link, Transport};
use crate::Error;
use rpclink_core::{CloseCode, ConnectionState};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ServerShared {
    endpoint: Endpoint,
    sessions: SessionMap,
    kick_out: AtomicBool,
    /// Transports still in the handshake.
    unready: Mutex<HashMap<u64, Arc<dyn Transport>>>,
    next_unready: AtomicU64,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// An RPC server. Clones share the same state.
#[derive(Clone)]
pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    pub fn new(name: impl Into<String>, address: impl Into<String>, options: EndpointOptions) -> Self {
        let kick_out = options.kick_out();
        Self {
            shared: Arc::new(ServerShared {
                endpoint: Endpoint::new(name, address, options),
                sessions: SessionMap::default(),
                kick_out: AtomicBool::new(kick_out),
                unready: Mutex::new(HashMap::new()),
                next_unready: AtomicU64::new(0),
                sweeper: Mutex::new(None),
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

    /// Make `value` reachable by name from every client.
    pub fn publish(&self, name: impl Into<String>, value: impl Into<Value>) -> Result<(), Error> {
        self.shared.endpoint.publish(name, value)
    }

    pub fn roots(&self) -> &Roots {
        self.shared.endpoint.roots()
    }

    /// Whether a second login under a taken name replaces the first.
    pub fn set_kick_out(&self, kick_out: bool) {
        self.shared.kick_out.store(kick_out, Ordering::SeqCst);
    }

    pub fn sessions(&self) -> &SessionMap {
        &self.shared.sessions
    }

    pub fn session(&self, name: &str) -> Option<Session> {
        self.shared.sessions.get(name)
    }

    /// RPC access to the client called `name`.
    pub fn protocol(&self, name: &str) -> Option<Protocol> {
        self.session(name).and_then(|session| session.protocol())
    }

    /// RPC access to every connected client, by name.
    pub fn protocols(&self) -> HashMap<String, Protocol> {
        self.shared
            .sessions
            .values()
            .into_iter()
            .filter_map(|session| {
                let protocol = session.protocol()?;
                Some((session.remote_name().to_string(), protocol))
            })
            .collect()
    }

    /// Start accepting sessions.
    pub async fn open(&self, retry_count: u32, retry_interval: Duration) -> Result<(), Error> {
        self.shared.endpoint.begin_open(retry_count)?;
        let shared = self.shared.clone();
        self.shared
            .endpoint
            .open_loop(retry_count, retry_interval, move || {
                let shared = shared.clone();
                async move {
                    ServerShared::start_sweeper(&shared);
                    Ok(())
                }
            })
            .await?;
        self.shared.endpoint.mark_started();
        info!(server = %self.name(), address = %self.address(), "rpc server open");
        Ok(())
    }

    /// Run the handshake on a freshly accepted transport and adopt the
    /// resulting session.
    pub async fn accept(&self, link: Link) {
        let shared = &self.shared;
        if shared.endpoint.state() != ConnectionState::Connected {
            warn!(server = %self.name(), "rejecting transport, server is not open");
            if let Err(err) = link.transport.disconnect(Some("server is not open")).await {
                debug!(error = %err, "transport disconnect failed");
            }
            return;
        }

        let key = shared.next_unready.fetch_add(1, Ordering::SeqCst);
        lock(&shared.unready).insert(key, link.transport.clone());
        let mut authorization = Authorization::new(shared.endpoint.context().clone(), link);
        let result = authorization.wait_authorization(&shared.sessions).await;
        lock(&shared.unready).remove(&key);

        let authorized = match result {
            Ok(authorized) => authorized,
            Err(err) => {
                warn!(server = %self.name(), error = %err, "waitAuthorization failed");
                if let Err(err) = authorization
                    .transport()
                    .disconnect(Some("waitAuthorization failed"))
                    .await
                {
                    debug!(error = %err, "transport disconnect failed");
                }
                shared.endpoint.emit(EndpointEvent::Error(err.to_string()));
                return;
            }
        };

        let session = authorized.session;
        let name = session.remote_name().to_string();
        if let Some(events) = authorized.events {
            let displaced = if shared.kick_out.load(Ordering::SeqCst) {
                shared.sessions.insert(session.clone())
            } else if let Err(existing) = shared.sessions.try_insert(session.clone()) {
                debug!(server = %self.name(), existing = %existing.id(), "name already taken");
                let reason = Error::SessionExists(name.clone()).to_string();
                warn!(server = %self.name(), remote = %name, "duplicate session rejected");
                session.disconnect(Some(&reason)).await;
                shared.endpoint.emit(EndpointEvent::Error(reason));
                return;
            } else {
                None
            };
            if let Some(existing) = displaced.filter(|existing| !existing.ptr_eq(&session)) {
                let reason = format!("session {name} kicked out");
                info!(server = %self.name(), remote = %name, "kicking out previous session");
                existing.disconnect(Some(&reason)).await;
                shared.endpoint.emit(EndpointEvent::SessionDisconnected {
                    name: name.clone(),
                    reason: Some(reason),
                });
            }
            tokio::spawn(drive_session(Arc::downgrade(shared), session.clone(), events));
        }
        shared.endpoint.emit(EndpointEvent::SessionConnected {
            name,
            id: session.id().to_string(),
        });
    }

    /// Stop accepting and disconnect every session.
    pub async fn close(&self) {
        let shared = &self.shared;
        if !shared.endpoint.begin_close() {
            return;
        }
        info!(server = %self.name(), "closing rpc server");
        let unready: Vec<_> = lock(&shared.unready).drain().map(|(_, transport)| transport).collect();
        for transport in unready {
            if let Err(err) = transport
                .disconnect(Some("close server unready transport"))
                .await
            {
                debug!(error = %err, "transport disconnect failed");
            }
        }
        shared.endpoint.wait_open().await;
        if let Some(sweeper) = lock(&shared.sweeper).take() {
            sweeper.abort();
        }
        let reason = format!("server [{}] was closed", self.name());
        for session in shared.sessions.drain() {
            session.disconnect(Some(&reason)).await;
        }
        shared.endpoint.finish_close(CloseCode::Normal);
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("sessions", &self.shared.sessions.len())
            .finish_non_exhaustive()
    }
}

impl ServerShared {
    fn start_sweeper(shared: &Arc<Self>) {
        let period = shared.endpoint.context().options().check_session_interval();
        let weak = Arc::downgrade(shared);
        let sweeper = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            loop {
                ticks.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                shared.sweep(period).await;
            }
        });
        if let Some(previous) = lock(&shared.sweeper).replace(sweeper) {
            previous.abort();
        }
    }

    /// Evict sessions that have been without a transport for longer than
    /// `period`.
    async fn sweep(&self, period: Duration) {
        let stale: Vec<_> = self
            .sessions
            .values()
            .into_iter()
            .filter(|session| {
                session
                    .disconnect_time()
                    .is_some_and(|since| since.elapsed() > period)
            })
            .collect();
        for session in stale {
            info!(
                server = %self.endpoint.name(),
                remote = %session.remote_name(),
                session = %session.id(),
                "evicting expired session"
            );
            session.disconnect(Some("session expired")).await;
            self.sessions.remove(&session);
        }
    }

    async fn on_wave(&self, session: &Session) {
        let reason = "receive wave and disconnect";
        session.disconnect(Some(reason)).await;
        self.sessions.remove(session);
        self.endpoint.emit(EndpointEvent::SessionDisconnected {
            name: session.remote_name().to_string(),
            reason: Some(reason.to_string()),
        });
    }
}

async fn drive_session(server: Weak<ServerShared>, session: Session, mut events: SessionEvents) {
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
                let Some(server) = server.upgrade() else {
                    break;
                };
                match event {
                    SessionEvent::Recv(data) => {
                        if let Some(protocol) = session.protocol() {
                            protocol.handle(data);
                        }
                    }
                    SessionEvent::Disconnect(reason) => {
                        debug!(remote = %session.remote_name(), "session lost its transport");
                        server.endpoint.emit(EndpointEvent::SessionDisconnected {
                            name: session.remote_name().to_string(),
                            reason,
                        });
                    }
                    SessionEvent::Wave => server.on_wave(&session).await,
                    SessionEvent::Error(message) => server.endpoint.emit(EndpointEvent::Error(message)),
                }
            }
            Ok(err) = errors.recv() => {
                if let Some(server) = server.upgrade() {
                    server.endpoint.emit(EndpointEvent::Error(err.to_string()));
                }
            }
        }
    }
}
