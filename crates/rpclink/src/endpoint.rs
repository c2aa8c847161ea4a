//! Lifecycle shared by clients and servers.
//!
//! An endpoint moves through [`ConnectionState`]s. Opening runs an attempt
//! closure until it succeeds, the retry budget runs out, or someone moves
//! the endpoint out of `Connecting`/`Reconnecting`. Only one open loop runs
//! at a time and closing waits for it to finish before tearing down.

use crate::config::EndpointOptions;
use crate::protocol::{Roots, Value};
use crate::Error;
use rpclink_core::{CloseCode, ConnectionState};
use std::future::{pending, Future};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Notifications from an endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum EndpointEvent {
    /// The endpoint shut down after having been opened.
    Closed(CloseCode),
    Error(String),
    SessionConnected {
        name: String,
        id: String,
    },
    SessionDisconnected {
        name: String,
        reason: Option<String>,
    },
}

/// Immutable facts about an endpoint that sessions and handshakes need.
#[derive(Debug)]
pub struct EndpointContext {
    pub(crate) name: String,
    pub(crate) address: String,
    pub(crate) options: EndpointOptions,
    pub(crate) roots: Roots,
}

impl EndpointContext {
    pub(crate) fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        options: EndpointOptions,
        roots: Roots,
    ) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            options,
            roots,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn options(&self) -> &EndpointOptions {
        &self.options
    }
}

pub(crate) struct Endpoint {
    context: Arc<EndpointContext>,
    state: watch::Sender<ConnectionState>,
    started: AtomicBool,
    opening: Mutex<()>,
    events: broadcast::Sender<EndpointEvent>,
}

impl Endpoint {
    pub(crate) fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        options: EndpointOptions,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(256);
        Self {
            context: Arc::new(EndpointContext::new(name, address, options, Roots::new())),
            state,
            started: AtomicBool::new(false),
            opening: Mutex::new(()),
            events,
        }
    }

    pub(crate) fn context(&self) -> &Arc<EndpointContext> {
        &self.context
    }

    pub(crate) fn name(&self) -> &str {
        &self.context.name
    }

    pub(crate) fn roots(&self) -> &Roots {
        &self.context.roots
    }

    pub(crate) fn publish(&self, name: impl Into<String>, value: impl Into<Value>) -> Result<(), Error> {
        self.context.roots.publish(name, value)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    pub(crate) fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<EndpointEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: EndpointEvent) {
        let _ = self.events.send(event);
    }

    /// Move from `Disconnected` to `Connecting`.
    pub(crate) fn begin_open(&self, retry_count: u32) -> Result<(), Error> {
        if retry_count == 0 {
            return Err(Error::InvalidRetryCount);
        }
        let mut current = ConnectionState::Disconnected;
        let moved = self.state.send_if_modified(|state| {
            current = *state;
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if moved {
            Ok(())
        } else {
            Err(Error::NotDisconnected(current))
        }
    }

    /// Run `attempt` until it succeeds or the budget is spent.
    ///
    /// Fatal errors end the loop at once and leave the state for the caller
    /// to resolve. Exhausting the budget sets `Disconnected`. If the state
    /// leaves `Connecting`/`Reconnecting` while an attempt or a pause is in
    /// flight, the loop stops with [`Error::StateChanged`].
    pub(crate) async fn open_loop<F, Fut>(
        &self,
        retry_count: u32,
        retry_interval: Duration,
        mut attempt: F,
    ) -> Result<(), Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), Error>>,
    {
        let _opening = self.opening.lock().await;
        let mut states = self.state.subscribe();
        let mut remaining = retry_count;
        loop {
            let result = tokio::select! {
                result = attempt() => result,
                state = left_opening(&mut states) => Err(Error::StateChanged(state)),
            };
            let state = self.state();
            if !state.is_opening() {
                return Err(match result {
                    Ok(()) => Error::StateChanged(state),
                    Err(err) => err,
                });
            }
            let err = match result {
                Ok(()) => {
                    self.set_state(ConnectionState::Connected);
                    info!(endpoint = %self.name(), "endpoint connected");
                    return Ok(());
                }
                Err(err) => err,
            };
            if err.is_fatal() {
                error!(endpoint = %self.name(), error = %err, "open refused");
                return Err(err);
            }
            remaining = remaining.saturating_sub(1);
            if remaining == 0 {
                error!(endpoint = %self.name(), error = %err, "open failed, giving up");
                self.set_state(ConnectionState::Disconnected);
                self.emit(EndpointEvent::Error(err.to_string()));
                return Err(err);
            }
            warn!(
                endpoint = %self.name(),
                error = %err,
                remaining,
                "open attempt failed, retrying"
            );
            tokio::select! {
                _ = sleep(retry_interval) => {}
                state = left_opening(&mut states) => return Err(Error::StateChanged(state)),
            }
        }
    }

    pub(crate) fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    /// Move to `Disconnecting`. False if already closed or closing.
    pub(crate) fn begin_close(&self) -> bool {
        self.state.send_if_modified(|state| match state {
            ConnectionState::Disconnected | ConnectionState::Disconnecting => false,
            _ => {
                *state = ConnectionState::Disconnecting;
                true
            }
        })
    }

    /// Wait for a running open loop to notice it should stop.
    pub(crate) async fn wait_open(&self) {
        drop(self.opening.lock().await);
    }

    pub(crate) fn finish_close(&self, code: CloseCode) {
        self.set_state(ConnectionState::Disconnected);
        if self.started.swap(false, Ordering::SeqCst) {
            info!(endpoint = %self.name(), ?code, "endpoint closed");
            self.emit(EndpointEvent::Closed(code));
        }
    }
}

async fn left_opening(states: &mut watch::Receiver<ConnectionState>) -> ConnectionState {
    let state = states
        .wait_for(|state| !state.is_opening())
        .await
        .map(|state| *state);
    match state {
        Ok(state) => state,
        Err(_) => pending().await,
    }
}
