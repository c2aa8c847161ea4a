//! Local objects that can be exported to a peer.

use super::{RpcError, Value};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use rpclink_core::ValueType;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// How an exported object presents itself on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    Object,
    Function,
    Class,
}

impl TargetKind {
    pub(crate) fn value_type(self) -> ValueType {
        match self {
            Self::Object => ValueType::Object,
            Self::Function => ValueType::Function,
            Self::Class => ValueType::Class,
        }
    }
}

/// An object the peer can call into through a proxy.
#[async_trait]
pub trait Target: Send + Sync + 'static {
    fn kind(&self) -> TargetKind {
        TargetKind::Object
    }

    /// Whether `name` resolves to a method or property.
    fn has_member(&self, _name: &str) -> bool {
        false
    }

    async fn invoke(&self, method: &str, _args: Vec<Value>) -> Result<Value, RpcError> {
        Err(RpcError::new(format!(
            "there is no property or method {method} in object"
        )))
    }

    /// Call the object itself.
    async fn call(&self, _this: Value, _args: Vec<Value>) -> Result<Value, RpcError> {
        Err(RpcError::new("target is not callable"))
    }

    async fn construct(&self, _args: Vec<Value>) -> Result<Value, RpcError> {
        Err(RpcError::new("target is not constructible"))
    }
}

type Method = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync>;

fn method<F, Fut>(f: F) -> Method
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    Arc::new(move |args| f(args).boxed())
}

/// An object built from named async closures.
///
/// ```ignore
/// let service = Service::new().method("add", |args| async move {
///     Ok(Value::Integer(Value::int_arg(&args, 0)? + Value::int_arg(&args, 1)?))
/// });
/// ```
#[derive(Clone, Default)]
pub struct Service {
    members: HashMap<String, Method>,
}

impl Service {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.members.insert(name.into(), method(f));
        self
    }

    pub fn into_value(self) -> Value {
        Value::local(self)
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.members.keys()).finish()
    }
}

#[async_trait]
impl Target for Service {
    fn has_member(&self, name: &str) -> bool {
        self.members.contains_key(name)
    }

    async fn invoke(&self, name: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        match self.members.get(name) {
            Some(method) => method(args).await,
            None => Err(RpcError::new(format!(
                "there is no property or method {name} in object"
            ))),
        }
    }
}

/// A callable exported by reference.
#[derive(Clone)]
pub struct Function {
    body: Method,
}

impl Function {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        Self { body: method(f) }
    }

    pub fn into_value(self) -> Value {
        Value::local(self)
    }
}

#[async_trait]
impl Target for Function {
    fn kind(&self) -> TargetKind {
        TargetKind::Function
    }

    async fn call(&self, _this: Value, args: Vec<Value>) -> Result<Value, RpcError> {
        (self.body)(args).await
    }
}

/// A constructor plus static members.
#[derive(Clone)]
pub struct Class {
    constructor: Method,
    statics: Service,
}

impl Class {
    pub fn new<F, Fut>(constructor: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        Self {
            constructor: method(constructor),
            statics: Service::new(),
        }
    }

    pub fn with_static<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.statics = self.statics.method(name, f);
        self
    }

    pub fn into_value(self) -> Value {
        Value::local(self)
    }
}

#[async_trait]
impl Target for Class {
    fn kind(&self) -> TargetKind {
        TargetKind::Class
    }

    fn has_member(&self, name: &str) -> bool {
        self.statics.has_member(name)
    }

    async fn invoke(&self, name: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        self.statics.invoke(name, args).await
    }

    async fn construct(&self, args: Vec<Value>) -> Result<Value, RpcError> {
        (self.constructor)(args).await
    }
}
