//! Sessions: a peer identity that outlives any one transport.
//!
//! Every application payload is sent as a transfer frame with a fresh id and
//! kept until the peer acknowledges it, so a session can be moved to a new
//! transport and resend what was lost. The peer acknowledges by echoing the
//! ids it delivered in the `resolvedRequests` of its next transfer;
//! duplicates are dropped on receipt. Frames are written by a single writer
//! task so they leave in the order they were queued.

use crate::config::Keepalive;
use crate::protocol::{Outbound, Protocol, Roots};
use crate::transport::{Link, Transport, TransportEvent, TransportEvents};
use rand::distributions::Alphanumeric;
use rand::Rng;
use rpclink_core::{Action, Message, MessageKind, SignalData};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

const ID_LENGTH: usize = 12;

/// A random alphanumeric id for sessions and frames.
pub fn generate_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ID_LENGTH)
        .map(char::from)
        .collect()
}

/// What a session reports to the endpoint that owns it.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A transfer payload delivered for the first time.
    Recv(serde_json::Value),
    /// The current transport went away. The session itself survives.
    Disconnect(Option<String>),
    /// The peer is leaving for good.
    Wave,
    Error(String),
}

pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

pub struct SessionOptions {
    pub id: String,
    pub local_name: String,
    pub remote_name: String,
    pub keepalive: Keepalive,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Ledger {
    /// Ids delivered upward and not yet reported back to the peer.
    resolved: Vec<String>,
    /// Transfers sent and not yet acknowledged, in send order.
    pending: Vec<Message>,
}

enum Delivery {
    Fresh,
    /// The peer echoed one of our own pending ids back; send it again.
    Resend(Message),
    Duplicate,
}

impl Ledger {
    /// Decide what to do with an inbound transfer id, recording it if new.
    fn classify(&mut self, id: String) -> Delivery {
        if let Some(sent) = self.pending.iter().find(|sent| sent.id.as_ref() == Some(&id)) {
            return Delivery::Resend(sent.clone());
        }
        // Ids we already acknowledged stay known until the transfer that
        // carried the acknowledgement is itself acknowledged.
        let acknowledged = self.pending.iter().any(|sent| {
            sent.resolved_requests
                .as_ref()
                .is_some_and(|resolved| resolved.contains(&id))
        });
        if acknowledged || self.resolved.contains(&id) {
            return Delivery::Duplicate;
        }
        self.resolved.push(id);
        Delivery::Fresh
    }
}

struct Bound {
    transport: Arc<dyn Transport>,
    pump: JoinHandle<()>,
}

#[derive(Default)]
struct Pinger {
    queue: Vec<String>,
    timer: Option<JoinHandle<()>>,
}

enum Outgoing {
    Frame(Message),
    Flush(oneshot::Sender<()>),
}

pub(crate) struct SessionShared {
    id: String,
    local_name: String,
    remote_name: String,
    keepalive: Mutex<Keepalive>,
    ledger: Mutex<Ledger>,
    bound: Mutex<Option<Bound>>,
    generation: AtomicU64,
    disconnect_time: Mutex<Option<Instant>>,
    pinger: Mutex<Pinger>,
    events: Mutex<Option<mpsc::UnboundedSender<SessionEvent>>>,
    writer: mpsc::UnboundedSender<Outgoing>,
    protocol: Mutex<Option<Protocol>>,
    destroyed: AtomicBool,
}

/// A peer session. Clones share the same session.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    /// A bare session, optionally bound to `link`.
    pub fn new(options: SessionOptions, link: Option<Link>) -> (Self, SessionEvents) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SessionShared {
            id: options.id,
            local_name: options.local_name,
            remote_name: options.remote_name,
            keepalive: Mutex::new(options.keepalive),
            ledger: Mutex::default(),
            bound: Mutex::new(None),
            generation: AtomicU64::new(0),
            disconnect_time: Mutex::new(None),
            pinger: Mutex::default(),
            events: Mutex::new(Some(events_tx)),
            writer: writer_tx,
            protocol: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        });
        tokio::spawn(write_frames(Arc::downgrade(&shared), writer_rx));
        let session = Self { shared };
        if link.is_some() {
            session.reset_transport(link);
        }
        (session, events_rx)
    }

    /// A session with a [`Protocol`] attached that serves `roots`.
    pub fn create(
        options: SessionOptions,
        link: Option<Link>,
        roots: Roots,
    ) -> (Self, SessionEvents) {
        let (session, events) = Self::new(options, link);
        let outbound: Weak<dyn Outbound> = Arc::downgrade(&session.shared) as Weak<dyn Outbound>;
        let protocol = Protocol::new(session.remote_name(), outbound, roots);
        *lock(&session.shared.protocol) = Some(protocol);
        (session, events)
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn local_name(&self) -> &str {
        &self.shared.local_name
    }

    pub fn remote_name(&self) -> &str {
        &self.shared.remote_name
    }

    pub fn protocol(&self) -> Option<Protocol> {
        lock(&self.shared.protocol).clone()
    }

    pub fn keepalive(&self) -> Keepalive {
        *lock(&self.shared.keepalive)
    }

    /// Takes effect the next time the keepalive timer starts.
    pub fn set_keepalive(&self, keepalive: Keepalive) {
        *lock(&self.shared.keepalive) = keepalive;
    }

    /// When the last transport was lost, if the session is currently
    /// without one.
    pub fn disconnect_time(&self) -> Option<Instant> {
        *lock(&self.shared.disconnect_time)
    }

    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        lock(&self.shared.bound)
            .as_ref()
            .map(|bound| bound.transport.clone())
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::SeqCst)
    }

    /// Ids of transfers not yet acknowledged by the peer, in send order.
    pub fn pending_ids(&self) -> Vec<String> {
        lock(&self.shared.ledger)
            .pending
            .iter()
            .filter_map(|message| message.id.clone())
            .collect()
    }

    /// Unanswered keepalive pings.
    pub fn unanswered_pings(&self) -> usize {
        lock(&self.shared.pinger).queue.len()
    }

    pub fn ptr_eq(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Queue `data` for reliable delivery.
    pub fn send(&self, data: serde_json::Value) {
        self.shared.send_transfer(data);
    }

    /// Ask the peer to resend its unacknowledged transfers, or answer such
    /// a request.
    pub fn status_sync(&self, kind: MessageKind) {
        self.shared.status_sync(kind);
    }

    /// Tell the peer we are leaving. Resolves once the frame has been handed
    /// to the transport.
    pub async fn wave(&self) {
        self.shared.enqueue(Message::bare(Action::Wave));
        self.shared.flush().await;
    }

    /// Swap the transport. The previous transport is detached without being
    /// closed; its events are no longer observed.
    pub fn reset_transport(&self, link: Option<Link>) {
        let previous = {
            let mut bound = lock(&self.shared.bound);
            let previous = bound.take();
            if let Some(Link { transport, events }) = link {
                let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
                *lock(&self.shared.disconnect_time) = None;
                let pump = tokio::spawn(pump_events(
                    Arc::downgrade(&self.shared),
                    events,
                    generation,
                ));
                *bound = Some(Bound { transport, pump });
            }
            previous
        };
        if let Some(previous) = previous {
            previous.pump.abort();
        }
    }

    pub fn start_keepalive(&self) {
        SessionShared::start_keepalive(&self.shared);
    }

    pub fn stop_keepalive(&self) {
        self.shared.stop_keepalive();
    }

    /// Destroy the session and close its transport.
    pub async fn disconnect(&self, reason: Option<&str>) {
        info!(
            session = %self.shared.id,
            remote = %self.shared.remote_name,
            reason = reason.unwrap_or(""),
            "disconnecting session"
        );
        let bound = lock(&self.shared.bound).take();
        self.shared.destroy();
        if let Some(bound) = bound {
            bound.pump.abort();
            if let Err(err) = bound.transport.disconnect(reason).await {
                debug!(error = %err, "transport disconnect failed");
            }
        }
    }

    /// Stop all activity without touching the transport.
    pub fn destroy(&self) {
        self.shared.destroy();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("local", &self.shared.local_name)
            .field("remote", &self.shared.remote_name)
            .finish_non_exhaustive()
    }
}

impl Outbound for SessionShared {
    fn send(&self, data: serde_json::Value) {
        self.send_transfer(data);
    }
}

impl SessionShared {
    fn emit(&self, event: SessionEvent) {
        if let Some(events) = lock(&self.events).as_ref() {
            let _ = events.send(event);
        }
    }

    fn enqueue(&self, message: Message) {
        let _ = self.writer.send(Outgoing::Frame(message));
    }

    async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.writer.send(Outgoing::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    fn send_transfer(&self, data: serde_json::Value) {
        if self.destroyed.load(Ordering::SeqCst) {
            debug!(session = %self.id, "dropping transfer on destroyed session");
            return;
        }
        let message = {
            let mut ledger = lock(&self.ledger);
            let message = Message {
                action: Action::Transfer,
                id: Some(generate_id()),
                resolved_requests: Some(std::mem::take(&mut ledger.resolved)),
                data,
            };
            ledger.pending.push(message.clone());
            message
        };
        self.enqueue(message);
    }

    fn status_sync(&self, kind: MessageKind) {
        match Message::with_data(Action::StatusSync, &SignalData { kind }) {
            Ok(message) => self.enqueue(message),
            Err(err) => warn!(error = %err, "failed to encode status sync"),
        }
    }

    fn on_frame(&self, frame: serde_json::Value) {
        let message = match Message::from_json(frame) {
            Ok(message) => message,
            Err(err) => {
                self.emit(SessionEvent::Error(format!("malformed session frame: {err}")));
                return;
            }
        };
        match message.action {
            Action::Transfer => self.on_transfer(message),
            Action::Keepalive => self.on_keepalive(message),
            Action::StatusSync => self.on_status_sync(message),
            Action::Wave => self.emit(SessionEvent::Wave),
            Action::Authorization => {
                debug!(session = %self.id, "ignoring handshake frame on bound session")
            }
            Action::Unknown => self.emit(SessionEvent::Error("unknown session action 0".into())),
        }
    }

    fn on_transfer(&self, message: Message) {
        let Some(id) = message.id else {
            self.emit(SessionEvent::Error("transfer frame without id".into()));
            return;
        };
        let delivery = {
            let mut ledger = lock(&self.ledger);
            if let Some(acknowledged) = &message.resolved_requests {
                ledger
                    .pending
                    .retain(|sent| !sent.id.as_ref().is_some_and(|id| acknowledged.contains(id)));
            }
            ledger.classify(id)
        };
        match delivery {
            Delivery::Fresh => self.emit(SessionEvent::Recv(message.data)),
            Delivery::Resend(sent) => self.enqueue(sent),
            Delivery::Duplicate => debug!(session = %self.id, "dropping duplicate transfer"),
        }
    }

    fn on_keepalive(&self, message: Message) {
        match message.data_as::<SignalData>() {
            Ok(SignalData {
                kind: MessageKind::Request,
            }) => {
                let pong = Message::with_data(Action::Keepalive, &SignalData::response());
                match pong {
                    Ok(mut pong) => {
                        pong.id = message.id;
                        self.enqueue(pong);
                    }
                    Err(err) => warn!(error = %err, "failed to encode keepalive"),
                }
            }
            Ok(SignalData {
                kind: MessageKind::Response,
            }) => lock(&self.pinger).queue.clear(),
            Ok(_) => {}
            Err(err) => self.emit(SessionEvent::Error(format!("malformed keepalive: {err}"))),
        }
    }

    fn on_status_sync(&self, message: Message) {
        let resend = lock(&self.ledger).pending.clone();
        debug!(session = %self.id, count = resend.len(), "resending unacknowledged transfers");
        for message in resend {
            self.enqueue(message);
        }
        if let Ok(SignalData {
            kind: MessageKind::Request,
        }) = message.data_as::<SignalData>()
        {
            self.status_sync(MessageKind::Response);
        }
    }

    fn on_disconnect(&self, reason: Option<String>, generation: u64) {
        if generation != self.generation.load(Ordering::SeqCst) {
            return;
        }
        *lock(&self.disconnect_time) = Some(Instant::now());
        self.stop_keepalive();
        self.emit(SessionEvent::Disconnect(reason));
    }

    fn start_keepalive(shared: &Arc<Self>) {
        shared.stop_keepalive();
        let keepalive = *lock(&shared.keepalive);
        if keepalive.interval.is_zero() {
            return;
        }
        let weak = Arc::downgrade(shared);
        let timer = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + keepalive.interval, keepalive.interval);
            loop {
                ticks.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                if let Some(transport) = shared.ping(keepalive) {
                    warn!(
                        session = %shared.id,
                        remote = %shared.remote_name,
                        "keepalive timeout"
                    );
                    shared.flush().await;
                    let _ = transport.disconnect(Some("keepalive timeout")).await;
                    break;
                }
            }
        });
        lock(&shared.pinger).timer = Some(timer);
    }

    /// Send one ping. Returns the transport to drop if the peer has stopped
    /// answering.
    fn ping(&self, keepalive: Keepalive) -> Option<Arc<dyn Transport>> {
        let id = generate_id();
        let unanswered = {
            let mut pinger = lock(&self.pinger);
            pinger.queue.push(id.clone());
            pinger.queue.len()
        };
        match Message::with_data(Action::Keepalive, &SignalData::request()) {
            Ok(ping) => self.enqueue(ping.id(id)),
            Err(err) => warn!(error = %err, "failed to encode keepalive"),
        }
        match keepalive.threshold() {
            Some(threshold) if unanswered >= threshold => lock(&self.bound)
                .as_ref()
                .map(|bound| bound.transport.clone()),
            _ => None,
        }
    }

    fn stop_keepalive(&self) {
        let mut pinger = lock(&self.pinger);
        pinger.queue.clear();
        if let Some(timer) = pinger.timer.take() {
            timer.abort();
        }
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_keepalive();
        if let Some(protocol) = lock(&self.protocol).take() {
            protocol.destroy();
        }
        *lock(&self.ledger) = Ledger::default();
        lock(&self.events).take();
    }
}

async fn write_frames(session: Weak<SessionShared>, mut frames: mpsc::UnboundedReceiver<Outgoing>) {
    while let Some(outgoing) = frames.recv().await {
        let message = match outgoing {
            Outgoing::Frame(message) => message,
            Outgoing::Flush(done) => {
                let _ = done.send(());
                continue;
            }
        };
        let Some(shared) = session.upgrade() else {
            break;
        };
        let transport = lock(&shared.bound)
            .as_ref()
            .map(|bound| bound.transport.clone());
        drop(shared);
        if let Some(transport) = transport {
            if let Err(err) = transport.send(&message).await {
                debug!(action = ?message.action, error = %err, "frame not sent");
            }
        }
    }
}

async fn pump_events(session: Weak<SessionShared>, mut events: TransportEvents, generation: u64) {
    let reason = loop {
        let Some(event) = events.recv().await else {
            break None;
        };
        let Some(shared) = session.upgrade() else {
            return;
        };
        match event {
            TransportEvent::Recv(frame) => shared.on_frame(frame),
            TransportEvent::Disconnect(reason) => break reason,
        }
    };
    if let Some(shared) = session.upgrade() {
        shared.on_disconnect(reason, generation);
    }
}

/// Live sessions of an endpoint, keyed by peer name.
#[derive(Clone, Default)]
pub struct SessionMap {
    sessions: Arc<Mutex<HashMap<String, Session>>>,
}

impl SessionMap {
    pub fn get(&self, name: &str) -> Option<Session> {
        lock(&self.sessions).get(name).cloned()
    }

    pub fn insert(&self, session: Session) -> Option<Session> {
        lock(&self.sessions).insert(session.remote_name().to_string(), session)
    }

    /// Insert `session` unless its peer already has one, which is returned.
    pub fn try_insert(&self, session: Session) -> Result<(), Session> {
        let mut sessions = lock(&self.sessions);
        match sessions.get(session.remote_name()) {
            Some(existing) => Err(existing.clone()),
            None => {
                sessions.insert(session.remote_name().to_string(), session);
                Ok(())
            }
        }
    }

    /// Remove the entry for `session`'s peer if it is still this session.
    pub fn remove(&self, session: &Session) -> bool {
        let mut sessions = lock(&self.sessions);
        match sessions.get(session.remote_name()) {
            Some(current) if current.ptr_eq(session) => {
                sessions.remove(session.remote_name());
                true
            }
            _ => false,
        }
    }

    pub fn values(&self) -> Vec<Session> {
        lock(&self.sessions).values().cloned().collect()
    }

    pub fn drain(&self) -> Vec<Session> {
        lock(&self.sessions).drain().map(|(_, session)| session).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.sessions).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::pair;
    use serde_json::json;
    use std::time::Duration;

    fn options(keepalive: Keepalive) -> SessionOptions {
        SessionOptions {
            id: generate_id(),
            local_name: "local".into(),
            remote_name: "remote".into(),
            keepalive,
        }
    }

    fn no_keepalive() -> Keepalive {
        Keepalive {
            timeout: Duration::ZERO,
            interval: Duration::ZERO,
        }
    }

    async fn next_frame(events: &mut TransportEvents) -> Message {
        match events.recv().await {
            Some(TransportEvent::Recv(frame)) => Message::from_json(frame).unwrap(),
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    #[test]
    fn ids_are_twelve_alphanumerics() {
        let id = generate_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[tokio::test]
    async fn try_insert_keeps_the_first_session_per_name() {
        let sessions = SessionMap::default();
        let (first, _first_events) = Session::new(options(no_keepalive()), None);
        let (second, _second_events) = Session::new(options(no_keepalive()), None);
        assert!(sessions.try_insert(first.clone()).is_ok());
        let existing = sessions.try_insert(second).unwrap_err();
        assert!(existing.ptr_eq(&first));
        assert_eq!(sessions.len(), 1);
        assert!(sessions.get("remote").unwrap().ptr_eq(&first));
    }

    #[tokio::test]
    async fn transfers_carry_acknowledgements() {
        let (local, mut remote) = pair();
        let (session, mut events) = Session::new(options(no_keepalive()), Some(local));

        remote
            .transport
            .send(&Message::with_data(Action::Transfer, &json!("hello")).unwrap().id("r1"))
            .await
            .unwrap();
        assert_eq!(events.recv().await, Some(SessionEvent::Recv(json!("hello"))));

        session.send(json!("reply"));
        let frame = next_frame(&mut remote.events).await;
        assert_eq!(frame.action, Action::Transfer);
        assert_eq!(frame.resolved_requests, Some(vec!["r1".to_string()]));
        assert_eq!(session.pending_ids(), vec![frame.id.clone().unwrap()]);

        // the next transfer starts a fresh acknowledgement list
        session.send(json!("again"));
        let frame = next_frame(&mut remote.events).await;
        assert_eq!(frame.resolved_requests, Some(vec![]));
    }

    #[tokio::test]
    async fn duplicates_are_dropped_and_acks_clear_pending() {
        let (local, remote) = pair();
        let (session, mut events) = Session::new(options(no_keepalive()), Some(local));
        session.send(json!(1));
        let sent = session.pending_ids();
        assert_eq!(sent.len(), 1);

        let mut frame = Message::with_data(Action::Transfer, &json!("x")).unwrap().id("dup");
        frame.resolved_requests = Some(sent);
        remote.transport.send(&frame).await.unwrap();
        remote.transport.send(&frame).await.unwrap();
        remote
            .transport
            .send(&Message::with_data(Action::Transfer, &json!("y")).unwrap().id("next"))
            .await
            .unwrap();

        assert_eq!(events.recv().await, Some(SessionEvent::Recv(json!("x"))));
        assert_eq!(events.recv().await, Some(SessionEvent::Recv(json!("y"))));
        assert!(session.pending_ids().is_empty());
    }

    #[tokio::test]
    async fn resent_transfer_is_dropped_after_we_acknowledged_it() {
        let (local, mut remote) = pair();
        let (session, mut events) = Session::new(options(no_keepalive()), Some(local));
        let frame = Message::with_data(Action::Transfer, &json!("once")).unwrap().id("r1");
        remote.transport.send(&frame).await.unwrap();
        assert_eq!(events.recv().await, Some(SessionEvent::Recv(json!("once"))));

        // our acknowledgement is still in flight when the peer resends
        session.send(json!("ack"));
        let ack = next_frame(&mut remote.events).await;
        assert_eq!(ack.resolved_requests, Some(vec!["r1".to_string()]));
        remote.transport.send(&frame).await.unwrap();
        remote
            .transport
            .send(&Message::with_data(Action::Transfer, &json!("next")).unwrap().id("r2"))
            .await
            .unwrap();
        assert_eq!(events.recv().await, Some(SessionEvent::Recv(json!("next"))));
    }

    #[tokio::test]
    async fn status_sync_resends_pending_and_answers() {
        let (local, mut remote) = pair();
        let (session, _events) = Session::new(options(no_keepalive()), Some(local));
        session.send(json!("a"));
        session.send(json!("b"));
        let first = next_frame(&mut remote.events).await;
        let second = next_frame(&mut remote.events).await;

        remote
            .transport
            .send(&Message::with_data(Action::StatusSync, &SignalData::request()).unwrap())
            .await
            .unwrap();
        assert_eq!(next_frame(&mut remote.events).await.id, first.id);
        assert_eq!(next_frame(&mut remote.events).await.id, second.id);
        let answer = next_frame(&mut remote.events).await;
        assert_eq!(answer.action, Action::StatusSync);
        assert_eq!(
            answer.data_as::<SignalData>().unwrap().kind,
            MessageKind::Response
        );
    }

    #[tokio::test]
    async fn keepalive_request_is_answered_with_same_id() {
        let (local, mut remote) = pair();
        let (_session, _events) = Session::new(options(no_keepalive()), Some(local));
        remote
            .transport
            .send(
                &Message::with_data(Action::Keepalive, &SignalData::request())
                    .unwrap()
                    .id("ping-1"),
            )
            .await
            .unwrap();
        let pong = next_frame(&mut remote.events).await;
        assert_eq!(pong.action, Action::Keepalive);
        assert_eq!(pong.id.as_deref(), Some("ping-1"));
        assert_eq!(pong.data_as::<SignalData>().unwrap().kind, MessageKind::Response);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_is_dropped_after_timeout() {
        let keepalive = Keepalive {
            timeout: Duration::from_secs(30),
            interval: Duration::from_secs(5),
        };
        let (local, mut remote) = pair();
        let (session, mut events) = Session::new(options(keepalive), Some(local));
        session.start_keepalive();

        let mut pings = 0;
        loop {
            match remote.events.recv().await {
                Some(TransportEvent::Recv(frame)) => {
                    assert_eq!(Message::from_json(frame).unwrap().action, Action::Keepalive);
                    pings += 1;
                }
                Some(TransportEvent::Disconnect(reason)) => {
                    assert_eq!(reason.as_deref(), Some("keepalive timeout"));
                    break;
                }
                None => panic!("transport vanished"),
            }
        }
        assert_eq!(pings, 6);
        assert_eq!(
            events.recv().await,
            Some(SessionEvent::Disconnect(Some("keepalive timeout".into())))
        );
        assert!(session.disconnect_time().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn answered_pings_keep_the_transport() {
        let keepalive = Keepalive {
            timeout: Duration::from_secs(10),
            interval: Duration::from_secs(5),
        };
        let (local, mut remote) = pair();
        let (session, _events) = Session::new(options(keepalive), Some(local));
        session.start_keepalive();

        for _ in 0..5 {
            let ping = next_frame(&mut remote.events).await;
            let mut pong = Message::with_data(Action::Keepalive, &SignalData::response()).unwrap();
            pong.id = ping.id;
            remote.transport.send(&pong).await.unwrap();
        }
        tokio::task::yield_now().await;
        assert!(session.unanswered_pings() <= 1);
        assert!(session.transport().is_some());
    }

    #[tokio::test]
    async fn stale_transport_events_are_ignored() {
        let (first, first_remote) = pair();
        let (session, mut events) = Session::new(options(no_keepalive()), Some(first));
        let (second, mut second_remote) = pair();
        session.reset_transport(Some(second));

        first_remote.transport.disconnect(Some("old")).await.unwrap();
        session.send(json!("still here"));
        let frame = next_frame(&mut second_remote.events).await;
        assert_eq!(frame.data, json!("still here"));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_destroys_and_closes() {
        let (local, mut remote) = pair();
        let (session, mut events) = Session::create(options(no_keepalive()), Some(local), Roots::new());
        let protocol = session.protocol().unwrap();
        session.disconnect(Some("bye")).await;

        assert!(session.is_destroyed());
        assert!(protocol.is_destroyed());
        assert!(session.protocol().is_none());
        assert_eq!(
            remote.events.recv().await,
            Some(TransportEvent::Disconnect(Some("bye".into())))
        );
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn wave_is_flushed_before_returning() {
        let (local, mut remote) = pair();
        let (session, _events) = Session::new(options(no_keepalive()), Some(local));
        session.wave().await;
        session.disconnect(None).await;
        assert_eq!(next_frame(&mut remote.events).await.action, Action::Wave);
    }
}
