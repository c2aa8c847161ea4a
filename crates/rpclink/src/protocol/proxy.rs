use super::{Protocol, Reply, RpcError, Shared, Value};
use futures_util::future::{self, FutureExt};
use rpclink_core::{RpcAction, ValueType, WireValue};
use std::fmt;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

pub(crate) struct ProxyInner {
    protocol: Weak<Shared>,
    wire: WireValue,
    key: u64,
    disposed: AtomicBool,
}

impl ProxyInner {
    pub(crate) fn new(protocol: Weak<Shared>, mut wire: WireValue, key: u64) -> Self {
        wire.proxy = false;
        Self {
            protocol,
            wire,
            key,
            disposed: AtomicBool::new(false),
        }
    }
}

/// Handle to an object owned by the peer.
///
/// Clones share one identity. Receiving the same remote object twice yields
/// handles that compare equal with [`Proxy::ptr_eq`] for as long as any of
/// them is alive; once every handle is dropped the peer is told it may
/// release the object.
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<ProxyInner>,
}

impl Proxy {
    pub(crate) fn from_inner(inner: Arc<ProxyInner>) -> Self {
        Self { inner }
    }

    pub fn kind(&self) -> ValueType {
        self.inner.wire.kind
    }

    /// The peer's reference id.
    pub fn id(&self) -> u64 {
        self.inner.key
    }

    pub fn ptr_eq(&self, other: &Proxy) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Mark disposed. Returns whether it already was.
    pub(crate) fn mark_disposed(&self) -> bool {
        self.inner.disposed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn wire(&self) -> &WireValue {
        &self.inner.wire
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    pub(crate) fn belongs_to(&self, shared: &Arc<Shared>) -> bool {
        std::ptr::eq(self.inner.protocol.as_ptr(), Arc::as_ptr(shared))
    }

    /// The protocol this proxy was received on, if it still exists.
    pub fn protocol(&self) -> Option<Protocol> {
        self.inner.protocol.upgrade().map(Protocol::from_shared)
    }

    /// Call a remote function.
    #[track_caller]
    pub fn call(&self, args: Vec<Value>) -> Reply {
        self.call_with(Value::Null, args)
    }

    /// Call a remote function with an explicit receiver.
    #[track_caller]
    pub fn call_with(&self, this: Value, args: Vec<Value>) -> Reply {
        let site = Location::caller();
        match self.kind() {
            ValueType::Function | ValueType::Delegate => {
                self.request(RpcAction::Call, this, Value::Proxy(self.clone()), args, site)
            }
            other => failed(RpcError::new(format!(
                "type {} is not supported for apply",
                i8::from(other)
            ))),
        }
    }

    /// Construct an instance of a remote class or function.
    #[track_caller]
    pub fn construct(&self, args: Vec<Value>) -> Reply {
        let site = Location::caller();
        match self.kind() {
            ValueType::Function | ValueType::Class => {
                self.request(RpcAction::New, Value::Null, Value::Proxy(self.clone()), args, site)
            }
            other => failed(RpcError::new(format!(
                "type {} is not supported for new",
                i8::from(other)
            ))),
        }
    }

    /// Call method `method` of the remote object.
    #[track_caller]
    pub fn invoke(&self, method: &str, args: Vec<Value>) -> Reply {
        let site = Location::caller();
        match self.kind() {
            ValueType::Object | ValueType::Function | ValueType::Class => self.request(
                RpcAction::Call,
                Value::Proxy(self.clone()),
                Value::String(method.to_string()),
                args,
                site,
            ),
            other => failed(RpcError::new(format!(
                "get property on object of type {} is not allowed",
                i8::from(other)
            ))),
        }
    }

    /// Release the remote object now instead of waiting for the last handle
    /// to drop.
    pub fn dispose(&self) -> Result<(), RpcError> {
        match self.protocol() {
            Some(protocol) => protocol.dispose(std::slice::from_ref(self)),
            None => Err(RpcError::new("protocol destroyed")),
        }
    }

    fn request(
        &self,
        action: RpcAction,
        this: Value,
        value: Value,
        args: Vec<Value>,
        site: &'static Location<'static>,
    ) -> Reply {
        if self.is_disposed() {
            return failed(RpcError::new(format!("proxy {} was disposed", self.id())));
        }
        match self.protocol() {
            Some(protocol) => protocol.request(action, this, value, args, site),
            None => failed(RpcError::new("protocol destroyed")),
        }
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("kind", &self.kind())
            .field("id", &self.id())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

pub(crate) fn failed(err: RpcError) -> Reply {
    future::ready(Err(err)).boxed()
}
