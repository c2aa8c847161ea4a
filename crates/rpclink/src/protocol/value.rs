use super::{Proxy, RpcError, Target, TargetKind};
use rpclink_core::ValueType;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A value passed to or returned from a remote call.
///
/// Plain data is copied across. [`Value::Local`] objects stay where they are
/// and the peer receives a [`Proxy`] to them; a proxy sent back to its owner
/// arrives as the original local object.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Dictionary(BTreeMap<String, Value>),
    Error(RpcError),
    Local(Arc<dyn Target>),
    Proxy(Proxy),
}

impl Value {
    /// Wrap an object so it is exported by reference.
    pub fn local(target: impl Target) -> Self {
        Self::Local(Arc::new(target))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Integers widen to floats.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dictionary(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Dictionary(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn as_proxy(&self) -> Option<&Proxy> {
        match self {
            Self::Proxy(proxy) => Some(proxy),
            _ => None,
        }
    }

    pub fn into_proxy(self) -> Option<Proxy> {
        match self {
            Self::Proxy(proxy) => Some(proxy),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&RpcError> {
        match self {
            Self::Error(err) => Some(err),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Array(_) => "array",
            Self::Dictionary(_) => "dictionary",
            Self::Error(_) => "error",
            Self::Local(target) => match target.kind() {
                TargetKind::Object => "object",
                TargetKind::Function => "function",
                TargetKind::Class => "class",
            },
            Self::Proxy(proxy) => match proxy.kind() {
                ValueType::Function | ValueType::Delegate => "function",
                ValueType::Class => "class",
                _ => "object",
            },
        }
    }

    /// Positional argument `index` as an integer.
    #[track_caller]
    pub fn int_arg(args: &[Value], index: usize) -> Result<i64, RpcError> {
        args.get(index)
            .and_then(Value::as_i64)
            .ok_or_else(|| RpcError::new(format!("argument {index} must be an integer")))
    }

    /// Positional argument `index` as a string.
    #[track_caller]
    pub fn str_arg(args: &[Value], index: usize) -> Result<&str, RpcError> {
        args.get(index)
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::new(format!("argument {index} must be a string")))
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("Null"),
            Self::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            Self::Integer(i) => f.debug_tuple("Integer").field(i).finish(),
            Self::Float(x) => f.debug_tuple("Float").field(x).finish(),
            Self::String(s) => f.debug_tuple("String").field(s).finish(),
            Self::Array(items) => f.debug_tuple("Array").field(items).finish(),
            Self::Dictionary(entries) => f.debug_tuple("Dictionary").field(entries).finish(),
            Self::Error(err) => f.debug_tuple("Error").field(err).finish(),
            Self::Local(target) => f.debug_tuple("Local").field(&target.kind()).finish(),
            Self::Proxy(proxy) => fmt::Debug::fmt(proxy, f),
        }
    }
}

impl PartialEq for Value {
    /// Data compares by value, objects and proxies by identity.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            (Self::Dictionary(a), Self::Dictionary(b)) => a == b,
            (Self::Error(a), Self::Error(b)) => a == b,
            (Self::Local(a), Self::Local(b)) => Arc::ptr_eq(a, b),
            (Self::Proxy(a), Self::Proxy(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Integer(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::Array(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(entries: BTreeMap<String, Value>) -> Self {
        Self::Dictionary(entries)
    }
}

impl From<RpcError> for Value {
    fn from(err: RpcError) -> Self {
        Self::Error(err)
    }
}

impl From<Proxy> for Value {
    fn from(proxy: Proxy) -> Self {
        Self::Proxy(proxy)
    }
}

impl From<Arc<dyn Target>> for Value {
    fn from(target: Arc<dyn Target>) -> Self {
        Self::Local(target)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}
