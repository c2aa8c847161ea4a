//! RPC over a session.
//!
//! A [`Protocol`] turns [`Value`]s into wire values and back, exports local
//! objects by reference, hands out [`Proxy`] handles for the peer's objects,
//! and matches responses to outstanding calls. It never touches a transport:
//! outgoing envelopes go to an [`Outbound`] (the session), incoming ones
//! arrive through [`Protocol::handle`].

mod error;
mod proxy;
mod roots;
mod target;
mod value;

pub use error::RpcError;
pub use proxy::Proxy;
pub use roots::Roots;
pub use target::{Class, Function, Service, Target, TargetKind};
pub use value::Value;

use crate::recycle::Recycle;
use futures_util::future::{BoxFuture, FutureExt};
use proxy::{failed, ProxyInner};
use rpclink_core::{MessageKind, RpcAction, RpcEnvelope, ValueType, WireValue};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::any::Any;
use std::panic::{AssertUnwindSafe, Location};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{broadcast, oneshot};
use tracing::debug;

/// Outcome of a remote call.
pub type Reply = BoxFuture<'static, Result<Value, RpcError>>;

/// Where a protocol sends its envelopes.
pub trait Outbound: Send + Sync {
    fn send(&self, data: serde_json::Value);
}

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

struct Exported {
    value: Value,
    identity: usize,
}

/// `this`, the called value and the arguments of a request.
type Decoded = (Value, Value, Vec<Value>);

struct Deferred {
    reply: oneshot::Sender<Result<Value, RpcError>>,
    stack: String,
}

#[derive(Default)]
struct State {
    roots: Option<Roots>,
    references: HashMap<u64, Exported>,
    reference_ids: HashMap<usize, u64>,
    deferrals: HashMap<u64, Deferred>,
    disposed: Vec<u64>,
    recycle: Recycle<ProxyInner>,
    destroyed: bool,
}

pub(crate) struct Shared {
    name: String,
    outbound: Weak<dyn Outbound>,
    state: Mutex<State>,
    errors: broadcast::Sender<RpcError>,
}

/// RPC state for one peer.
#[derive(Clone)]
pub struct Protocol {
    shared: Arc<Shared>,
}

impl Protocol {
    /// `name` is the peer's name; it prefixes the stacks of errors the peer
    /// returns.
    pub fn new(name: impl Into<String>, outbound: Weak<dyn Outbound>, roots: Roots) -> Self {
        let (errors, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                outbound,
                state: Mutex::new(State {
                    roots: Some(roots),
                    ..State::default()
                }),
                errors,
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Errors that have no caller to return to: malformed input, unknown
    /// response ids, failed releases.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<RpcError> {
        self.shared.errors.subscribe()
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }

    /// Number of local objects the peer currently holds references to.
    pub fn reference_count(&self) -> usize {
        self.lock().references.len()
    }

    pub fn pending_calls(&self) -> usize {
        self.lock().deferrals.len()
    }

    /// Whether `value` is a proxy received on this protocol.
    pub fn is_proxy(&self, value: &Value) -> bool {
        matches!(value, Value::Proxy(proxy) if proxy.belongs_to(&self.shared))
    }

    /// Read a value the peer has published.
    #[track_caller]
    pub fn get(&self, name: &str) -> Reply {
        let site = Location::caller();
        self.request(
            RpcAction::Call,
            Value::Null,
            Value::String(name.to_string()),
            Vec::new(),
            site,
        )
    }

    /// Call a function the peer has published, or assign a published
    /// property when given exactly one argument.
    #[track_caller]
    pub fn call(&self, name: &str, args: Vec<Value>) -> Reply {
        let site = Location::caller();
        self.request(
            RpcAction::Call,
            Value::Null,
            Value::String(name.to_string()),
            args,
            site,
        )
    }

    /// Release remote objects ahead of their handles being dropped.
    pub fn dispose(&self, proxies: &[Proxy]) -> Result<(), RpcError> {
        let mut state = self.lock();
        for proxy in proxies {
            if !proxy.belongs_to(&self.shared) {
                return Err(RpcError::new("the dispose parameter must be proxy"));
            }
            if proxy.is_disposed() {
                continue;
            }
            let released = if proxy.kind() == ValueType::Delegate {
                let delegate = proxy.wire().delegate()?;
                vec![delegate.kind, delegate.method, delegate.target]
            } else {
                vec![proxy.id()]
            };
            state.recycle.remove(proxy.id())?;
            if !proxy.mark_disposed() {
                state.disposed.extend(released);
            }
        }
        Ok(())
    }

    /// Fail every outstanding call and drop all references.
    pub fn destroy(&self) {
        let (deferrals, references) = {
            let mut state = self.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.roots = None;
            state.recycle.clear();
            state.disposed.clear();
            state.reference_ids.clear();
            (
                std::mem::take(&mut state.deferrals),
                std::mem::take(&mut state.references),
            )
        };
        debug!(
            protocol = %self.shared.name,
            pending = deferrals.len(),
            "destroying protocol"
        );
        for (_, deferred) in deferrals {
            let _ = deferred.reply.send(Err(RpcError::new("protocol destroyed")));
        }
        drop(references);
    }

    /// Process one envelope received from the peer.
    pub fn handle(&self, data: serde_json::Value) {
        let envelope: RpcEnvelope = match serde_json::from_value(data) {
            Ok(envelope) => envelope,
            Err(err) => {
                self.report(RpcError::new(format!("malformed rpc message: {err}")));
                return;
            }
        };
        self.release(&envelope.disposed);
        match envelope.kind {
            MessageKind::Request => {
                // References must resolve before a later frame can release them.
                let decoded = self.decode_request(&envelope).inspect_err(|err| {
                    self.report(err.clone());
                });
                let protocol = self.clone();
                tokio::spawn(async move {
                    protocol
                        .process_request(envelope.id, envelope.action, decoded)
                        .await
                });
            }
            MessageKind::Response => self.process_response(envelope),
            MessageKind::Unknown => self.report(RpcError::new(format!(
                "unknown rpc message type of id {}",
                envelope.id
            ))),
        }
    }

    pub(crate) fn request(
        &self,
        action: RpcAction,
        this: Value,
        value: Value,
        args: Vec<Value>,
        site: &'static Location<'static>,
    ) -> Reply {
        let id = NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        let deferred = Deferred {
            reply,
            stack: format!("at {site}"),
        };
        let sent = self.transmit(
            |protocol, state| {
                let this = match this {
                    Value::Null => None,
                    this => Some(protocol.serialize(state, &this)?),
                };
                let value = protocol.serialize(state, &value)?;
                let args = args
                    .iter()
                    .map(|arg| protocol.serialize(state, arg))
                    .collect::<Result<_, _>>()?;
                Ok(RpcEnvelope::request(id, action, this, value, args))
            },
            Some(deferred),
        );
        if let Err(err) = sent {
            return failed(err);
        }
        async move {
            rx.await
                .unwrap_or_else(|_| Err(RpcError::new("protocol destroyed")))
        }
        .boxed()
    }

    /// Build an envelope under the state lock, attach pending releases and
    /// hand it to the session.
    fn transmit(
        &self,
        build: impl FnOnce(&Self, &mut State) -> Result<RpcEnvelope, RpcError>,
        deferred: Option<Deferred>,
    ) -> Result<(), RpcError> {
        let Some(outbound) = self.shared.outbound.upgrade() else {
            return Err(RpcError::new("session is gone"));
        };
        let data = {
            let mut state = self.lock();
            if state.destroyed {
                return Err(RpcError::new("protocol destroyed"));
            }
            let mut envelope = build(self, &mut *state)?;
            let mut disposed = std::mem::take(&mut state.disposed);
            disposed.extend(state.recycle.collect());
            disposed.sort_unstable();
            disposed.dedup();
            envelope.disposed = disposed;
            let data = match serde_json::to_value(&envelope) {
                Ok(data) => data,
                Err(err) => {
                    state.disposed = envelope.disposed;
                    return Err(RpcError::new(err.to_string()));
                }
            };
            if let Some(deferred) = deferred {
                state.deferrals.insert(envelope.id, deferred);
            }
            data
        };
        outbound.send(data);
        Ok(())
    }

    async fn process_request(
        &self,
        id: u64,
        action: RpcAction,
        decoded: Result<Decoded, RpcError>,
    ) {
        let result = match decoded {
            Ok(decoded) => AssertUnwindSafe(self.evaluate(action, decoded))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(RpcError::new(panic_message(panic.as_ref())))),
            Err(err) => Err(err),
        }
        .unwrap_or_else(Value::Error);
        let sent = self.transmit(
            |protocol, state| {
                let result = match protocol.serialize(state, &result) {
                    Ok(result) => result,
                    Err(err) => protocol.serialize(state, &Value::Error(err))?,
                };
                Ok(RpcEnvelope::response(id, action, result))
            },
            None,
        );
        if let Err(err) = sent {
            debug!(protocol = %self.shared.name, id, error = %err, "response dropped");
        }
    }

    async fn evaluate(&self, action: RpcAction, decoded: Decoded) -> Result<Value, RpcError> {
        let (this, value, args) = decoded;
        match action {
            RpcAction::Call => match value {
                Value::String(method) => self.call_method(this, &method, args).await,
                Value::Local(target) => target.call(this, args).await,
                Value::Proxy(proxy) => proxy.call_with(this, args).await,
                other => Err(RpcError::new(format!(
                    "value can not be of type {} when call",
                    other.type_name()
                ))),
            },
            RpcAction::New => match value {
                Value::Local(target) => target.construct(args).await,
                Value::Proxy(proxy) => proxy.construct(args).await,
                other => Err(RpcError::new(format!(
                    "value can not be of type {} when new",
                    other.type_name()
                ))),
            },
            RpcAction::Unknown => Err(RpcError::new("unknown rpc action")),
        }
    }

    fn decode_request(&self, request: &RpcEnvelope) -> Result<Decoded, RpcError> {
        let mut state = self.lock();
        let this = match &request.this {
            Some(wire) => self.deserialize(&mut state, wire)?,
            None => Value::Null,
        };
        let value = match &request.value {
            Some(wire) => self.deserialize(&mut state, wire)?,
            None => Value::Null,
        };
        let args = request
            .args
            .iter()
            .flatten()
            .map(|wire| self.deserialize(&mut state, wire))
            .collect::<Result<_, _>>()?;
        Ok((this, value, args))
    }

    async fn call_method(
        &self,
        this: Value,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, RpcError> {
        match this {
            Value::Null => self.call_root(method, args).await,
            Value::Local(target) => {
                let camel = to_camel(method);
                let name = if target.has_member(&camel) {
                    camel.as_str()
                } else {
                    method
                };
                target.invoke(name, args).await
            }
            Value::Proxy(proxy) => proxy.invoke(method, args).await,
            _ => Err(no_member(method)),
        }
    }

    async fn call_root(&self, method: &str, mut args: Vec<Value>) -> Result<Value, RpcError> {
        let roots = self.lock().roots.clone();
        let Some(roots) = roots else {
            return Err(RpcError::new("protocol destroyed"));
        };
        let camel = to_camel(method);
        let key = if roots.contains(&camel) {
            camel.as_str()
        } else {
            method
        };
        let Some(entry) = roots.get(key) else {
            return Err(no_member(method));
        };
        match &entry {
            Value::Local(target) if target.kind() == TargetKind::Function => {
                target.call(Value::Null, args).await
            }
            _ if args.is_empty() => Ok(entry),
            _ if args.len() == 1 => {
                roots.set(key, args.pop().unwrap_or_default());
                Ok(Value::Null)
            }
            _ => Err(RpcError::new(format!(
                "{key} is property, but args count is not correct"
            ))),
        }
    }

    fn process_response(&self, response: RpcEnvelope) {
        let (deferred, result) = {
            let mut state = self.lock();
            let deferred = state.deferrals.remove(&response.id);
            let result = match &response.result {
                Some(wire) => self.deserialize(&mut state, wire),
                None => Ok(Value::Null),
            };
            (deferred, result)
        };
        let Some(deferred) = deferred else {
            self.report(RpcError::new(format!(
                "can not find request of id {}",
                response.id
            )));
            return;
        };
        let outcome = match result {
            Ok(Value::Error(mut remote)) => {
                remote.set_stack(format!("{}----{}", self.shared.name, remote.stack()));
                Err(RpcError::wrap(
                    format!("rpc call error: {}", remote.message()),
                    remote,
                    deferred.stack,
                ))
            }
            Ok(value) => Ok(value),
            Err(err) => {
                self.report(err.clone());
                Err(err)
            }
        };
        let _ = deferred.reply.send(outcome);
    }

    /// Drop references the peer no longer needs.
    fn release(&self, ids: &[u64]) {
        if ids.is_empty() {
            return;
        }
        let mut released = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();
        {
            let mut state = self.lock();
            for id in ids {
                match state.references.remove(id) {
                    Some(exported) => {
                        state.reference_ids.remove(&exported.identity);
                        released.push(exported);
                    }
                    None => missing.push(*id),
                }
            }
        }
        drop(released);
        for id in missing {
            self.report(RpcError::new(format!("can not dispose object of {id}")));
        }
    }

    fn serialize(&self, state: &mut State, value: &Value) -> Result<WireValue, RpcError> {
        Ok(match value {
            Value::Null => WireValue::null(),
            Value::Bool(b) => WireValue::boolean(*b),
            Value::Integer(i) => WireValue::integer(*i),
            Value::Float(f) => WireValue::float(*f),
            Value::String(s) => WireValue::string(s.clone()),
            Value::Array(items) => WireValue::array(
                items
                    .iter()
                    .map(|item| self.serialize(state, item))
                    .collect::<Result<_, _>>()?,
            )?,
            Value::Dictionary(entries) => WireValue::dictionary(
                entries
                    .iter()
                    .map(|(key, item)| Ok((key.clone(), self.serialize(state, item)?)))
                    .collect::<Result<BTreeMap<_, _>, RpcError>>()?,
            )?,
            Value::Error(err) => WireValue::error(err.to_frames())?,
            Value::Local(target) => {
                let identity = Arc::as_ptr(target) as *const () as usize;
                let kind = target.kind().value_type();
                WireValue::reference(kind, export(state, value, identity))
            }
            Value::Proxy(proxy) if proxy.belongs_to(&self.shared) => {
                if proxy.is_disposed() {
                    return Err(RpcError::new(format!("proxy {} was disposed", proxy.id())));
                }
                proxy.wire().clone().proxied()
            }
            // A proxy from another peer is forwarded like a local object.
            Value::Proxy(proxy) => {
                let kind = match proxy.kind() {
                    ValueType::Function | ValueType::Delegate => ValueType::Function,
                    ValueType::Class => ValueType::Class,
                    _ => ValueType::Object,
                };
                WireValue::reference(kind, export(state, value, proxy.identity()))
            }
        })
    }

    fn deserialize(&self, state: &mut State, wire: &WireValue) -> Result<Value, RpcError> {
        if wire.proxy {
            if !matches!(
                wire.kind,
                ValueType::Object | ValueType::Function | ValueType::Class
            ) {
                return Err(RpcError::new(format!(
                    "value of type {} can not be a proxy",
                    i8::from(wire.kind)
                )));
            }
            let id = wire.id().ok_or_else(|| malformed(wire))?;
            return state
                .references
                .get(&id)
                .map(|exported| exported.value.clone())
                .ok_or_else(|| RpcError::new(format!("unregistered object {id}")));
        }
        Ok(match wire.kind {
            ValueType::Null => Value::Null,
            ValueType::Boolean => Value::Bool(wire.value.as_bool().ok_or_else(|| malformed(wire))?),
            ValueType::Integer => Value::Integer(
                wire.value
                    .as_i64()
                    .or_else(|| wire.value.as_f64().map(|f| f as i64))
                    .ok_or_else(|| malformed(wire))?,
            ),
            ValueType::Float => Value::Float(wire.value.as_f64().ok_or_else(|| malformed(wire))?),
            ValueType::String => Value::String(
                wire.value
                    .as_str()
                    .ok_or_else(|| malformed(wire))?
                    .to_string(),
            ),
            ValueType::Error => RpcError::from_frames(wire.error_frames()?)
                .map_or(Value::Null, Value::Error),
            ValueType::Array => Value::Array(
                wire.items()?
                    .iter()
                    .map(|item| self.deserialize(state, item))
                    .collect::<Result<_, _>>()?,
            ),
            ValueType::Dictionary => Value::Dictionary(
                wire.entries()?
                    .iter()
                    .map(|(key, item)| Ok((to_camel(key), self.deserialize(state, item)?)))
                    .collect::<Result<_, RpcError>>()?,
            ),
            ValueType::Object | ValueType::Function | ValueType::Class | ValueType::Delegate => {
                Value::Proxy(self.proxy_for(state, wire)?)
            }
            ValueType::Unknown => return Err(RpcError::new("unsupported value type 0")),
        })
    }

    fn proxy_for(&self, state: &mut State, wire: &WireValue) -> Result<Proxy, RpcError> {
        let key = match wire.kind {
            ValueType::Delegate => wire.delegate()?.kind,
            _ => wire.id().ok_or_else(|| malformed(wire))?,
        };
        if let Some(inner) = state.recycle.get(key) {
            return Ok(Proxy::from_inner(inner));
        }
        let inner = Arc::new(ProxyInner::new(
            Arc::downgrade(&self.shared),
            wire.clone(),
            key,
        ));
        state.recycle.add(key, &inner)?;
        Ok(Proxy::from_inner(inner))
    }

    fn report(&self, err: RpcError) {
        tracing::error!(protocol = %self.shared.name, error = %err, "rpc protocol error");
        let _ = self.shared.errors.send(err);
    }
}

impl fmt::Debug for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Protocol")
            .field("name", &self.shared.name)
            .finish_non_exhaustive()
    }
}

/// Register `value` for export, reusing the id it already has.
fn export(state: &mut State, value: &Value, identity: usize) -> u64 {
    if let Some(id) = state.reference_ids.get(&identity) {
        return *id;
    }
    let id = NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed);
    state.references.insert(
        id,
        Exported {
            value: value.clone(),
            identity,
        },
    );
    state.reference_ids.insert(identity, id);
    id
}

fn to_camel(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown cause");
    format!("target panicked: {detail}")
}

#[track_caller]
fn no_member(method: &str) -> RpcError {
    RpcError::new(format!("there is no property or method {method} in object"))
}

#[track_caller]
fn malformed(wire: &WireValue) -> RpcError {
    RpcError::new(format!(
        "malformed value of type {}: {}",
        i8::from(wire.kind),
        wire.value
    ))
}
