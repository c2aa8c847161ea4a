//! The authorization handshake.
//!
//! The initiator sends its name, a signature, and the id of the session it
//! wants to resume, if any. The responder checks the signature, looks the
//! session up, and answers with its own name and signature plus either a
//! session id and its negotiated timing or an error. Whoever ends up owning
//! the session takes the transport over from the handshake.

use crate::config::Keepalive;
use crate::endpoint::EndpointContext;
use crate::session::{generate_id, Session, SessionEvents, SessionMap, SessionOptions};
use crate::transport::{Link, Transport, TransportEvent, TransportEvents};
use crate::AuthError;
use rpclink_core::{
    check_signature, make_signature, Action, AuthorizationData, Message, MessageKind,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// A completed handshake.
pub struct Authorized {
    pub session: Session,
    /// Event stream of a session created by this handshake. `None` when an
    /// existing session was resumed; its owner already holds the stream.
    pub events: Option<SessionEvents>,
    /// Reconnect timing the responder asked for, in milliseconds.
    pub reconnect_timeout: Option<i64>,
    pub reconnect_interval: Option<i64>,
}

impl std::fmt::Debug for Authorized {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authorized")
            .field("session", &self.session)
            .field("resumed", &self.events.is_none())
            .finish_non_exhaustive()
    }
}

pub struct Authorization {
    context: Arc<EndpointContext>,
    transport: Arc<dyn Transport>,
    events: Option<TransportEvents>,
    timeout: Duration,
    pending: bool,
    denied: bool,
}

impl Authorization {
    pub fn new(context: Arc<EndpointContext>, link: Link) -> Self {
        let timeout = context.options.authorization_timeout();
        Self {
            context,
            transport: link.transport,
            events: Some(link.events),
            timeout,
            pending: false,
            denied: false,
        }
    }

    /// Whether the peer actively rejected the handshake.
    pub fn denied(&self) -> bool {
        self.denied
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Stop listening to the transport. It is not closed.
    pub fn destroy(&mut self) {
        self.events = None;
    }

    /// Run the initiator side, resuming `session` if given.
    pub async fn authorization(
        &mut self,
        session: Option<&Session>,
    ) -> Result<Authorized, AuthError> {
        self.begin()?;
        let result = self.request(session).await;
        self.pending = false;
        result
    }

    /// Run the responder side against the endpoint's live `sessions`.
    pub async fn wait_authorization(
        &mut self,
        sessions: &SessionMap,
    ) -> Result<Authorized, AuthError> {
        self.begin()?;
        let result = match timeout(self.timeout, self.next_frame()).await {
            Ok(Ok(request)) => self.respond(request, sessions).await,
            Ok(Err(err)) => Err(err),
            Err(_) => {
                self.destroy();
                Err(AuthError::WaitTimeout)
            }
        };
        self.pending = false;
        result
    }

    fn begin(&mut self) -> Result<(), AuthError> {
        if self.pending {
            return Err(AuthError::Pending);
        }
        if self.events.is_none() {
            return Err(AuthError::Destroyed);
        }
        self.pending = true;
        Ok(())
    }

    async fn request(&mut self, session: Option<&Session>) -> Result<Authorized, AuthError> {
        let request = AuthorizationData::request(
            &self.context.name,
            session.map(|session| session.id().to_string()),
        );
        self.transport
            .send(&Message::with_data(Action::Authorization, &request)?)
            .await?;
        let response = match timeout(self.timeout, self.next_frame()).await {
            Ok(response) => response?,
            Err(_) => {
                self.destroy();
                return Err(AuthError::Timeout);
            }
        };
        self.accept(response, session)
    }

    fn accept(
        &mut self,
        response: AuthorizationData,
        session: Option<&Session>,
    ) -> Result<Authorized, AuthError> {
        if response.kind != MessageKind::Response {
            return Err(AuthError::Malformed(
                "expected an authorization response".into(),
            ));
        }
        if let Some(error) = response.error.filter(|error| !error.is_empty()) {
            self.denied = true;
            return Err(AuthError::Denied(error));
        }
        if !check_signature(&response.name, &response.signature) {
            self.denied = true;
            return Err(AuthError::BadSignature);
        }

        if let Some(session) = session {
            session.reset_transport(Some(self.take_link()?));
            info!(remote = %response.name, session = %session.id(), "session resumed");
            return Ok(Authorized {
                session: session.clone(),
                events: None,
                reconnect_timeout: None,
                reconnect_interval: None,
            });
        }

        let id = response
            .session_id
            .clone()
            .ok_or_else(|| AuthError::Malformed("response carries no session id".into()))?;
        let options = &self.context.options;
        let keepalive = Keepalive::resolve(
            &[options.keepalive_timeout, response.keepalive_timeout],
            &[options.keepalive_interval, response.keepalive_interval],
        );
        let link = self.take_link()?;
        let (session, events) = Session::create(
            SessionOptions {
                id,
                local_name: self.context.name.clone(),
                remote_name: response.name.clone(),
                keepalive,
            },
            Some(link),
            self.context.roots.clone(),
        );
        info!(remote = %response.name, session = %session.id(), "session established");
        Ok(Authorized {
            session,
            events: Some(events),
            reconnect_timeout: response.reconnect_timeout,
            reconnect_interval: response.reconnect_interval,
        })
    }

    async fn respond(
        &mut self,
        request: AuthorizationData,
        sessions: &SessionMap,
    ) -> Result<Authorized, AuthError> {
        if request.kind != MessageKind::Request {
            return Err(AuthError::Malformed(
                "expected an authorization request".into(),
            ));
        }
        let context = self.context.clone();
        let existing = request
            .session_id
            .as_ref()
            .and_then(|_| sessions.get(&request.name));
        let expired = match (&request.session_id, &existing) {
            (Some(id), Some(session)) => session.id() != id,
            (Some(_), None) => true,
            (None, _) => false,
        };
        let passed = check_signature(&request.name, &request.signature);

        let mut reply = AuthorizationData {
            kind: MessageKind::Response,
            name: context.name.clone(),
            signature: make_signature(&context.name),
            ..AuthorizationData::default()
        };

        if !passed || expired {
            let err = if expired {
                AuthError::SessionExpired(request.session_id.clone().unwrap_or_default())
            } else {
                AuthError::BadSignature
            };
            warn!(remote = %request.name, error = %err, "authorization rejected");
            reply.error = Some(err.to_string());
            if let Err(send_err) = self.send_reply(&reply).await {
                debug!(error = %send_err, "rejection not delivered");
            }
            self.denied = true;
            self.destroy();
            return Err(err);
        }

        let options = &context.options;
        let id = existing
            .as_ref()
            .map(|session| session.id().to_string())
            .unwrap_or_else(generate_id);
        reply.session_id = Some(id.clone());
        reply.keepalive_timeout = options.keepalive_timeout.filter(|ms| *ms != 0);
        reply.keepalive_interval = options.keepalive_interval.filter(|ms| *ms != 0);
        reply.reconnect_timeout = options.reconnect_timeout.filter(|ms| *ms != 0);
        reply.reconnect_interval = options.reconnect_interval.filter(|ms| *ms != 0);
        self.send_reply(&reply).await?;
        let link = self.take_link()?;

        if let Some(session) = existing {
            session.reset_transport(Some(link));
            info!(remote = %request.name, session = %id, "session resumed");
            return Ok(Authorized {
                session,
                events: None,
                reconnect_timeout: None,
                reconnect_interval: None,
            });
        }

        let (session, events) = Session::create(
            SessionOptions {
                id,
                local_name: context.name.clone(),
                remote_name: request.name.clone(),
                keepalive: Keepalive::resolve(
                    &[options.keepalive_timeout],
                    &[options.keepalive_interval],
                ),
            },
            Some(link),
            context.roots.clone(),
        );
        info!(remote = %request.name, session = %session.id(), "session established");
        Ok(Authorized {
            session,
            events: Some(events),
            reconnect_timeout: None,
            reconnect_interval: None,
        })
    }

    async fn send_reply(&self, reply: &AuthorizationData) -> Result<(), AuthError> {
        self.transport
            .send(&Message::with_data(Action::Authorization, reply)?)
            .await?;
        Ok(())
    }

    /// Wait for the next handshake frame, skipping anything else.
    async fn next_frame(&mut self) -> Result<AuthorizationData, AuthError> {
        let Some(events) = self.events.as_mut() else {
            return Err(AuthError::Destroyed);
        };
        let result = loop {
            match events.recv().await {
                Some(TransportEvent::Recv(frame)) => {
                    let message = match Message::from_json(frame) {
                        Ok(message) => message,
                        Err(err) => {
                            warn!(error = %err, "malformed frame during handshake");
                            continue;
                        }
                    };
                    if message.action != Action::Authorization {
                        debug!(action = ?message.action, "ignoring frame during handshake");
                        continue;
                    }
                    break message.data_as::<AuthorizationData>().map_err(AuthError::from);
                }
                Some(TransportEvent::Disconnect(_)) | None => break Err(AuthError::Destroyed),
            }
        };
        if matches!(result, Err(AuthError::Destroyed)) {
            self.events = None;
        }
        result
    }

    fn take_link(&mut self) -> Result<Link, AuthError> {
        self.events
            .take()
            .map(|events| Link::new(self.transport.clone(), events))
            .ok_or(AuthError::Destroyed)
    }
}
