//! Tagged values carried by the RPC envelope.
//!
//! A [`WireValue`] is `{type, value, proxy}`. Plain data is encoded inline;
//! objects, functions, classes and delegates are encoded as numeric
//! reference ids. `proxy: true` means the id names an object owned by the
//! *receiver* (a reference travelling back home); `proxy: false` on a
//! reference means the id names an object owned by the *sender*.

use crate::WireError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Type tag of a [`WireValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i8", into = "i8")]
pub enum ValueType {
    Error,
    Unknown,
    Null,
    Boolean,
    Integer,
    Float,
    String,
    Object,
    Function,
    /// A bound method: `{type, method, target}` ids.
    Delegate,
    Class,
    Array,
    Dictionary,
}

impl ValueType {
    /// Whether values of this type are passed by reference.
    pub fn is_reference(self) -> bool {
        matches!(
            self,
            Self::Object | Self::Function | Self::Delegate | Self::Class
        )
    }
}

impl TryFrom<i8> for ValueType {
    type Error = WireError;

    fn try_from(code: i8) -> Result<Self, WireError> {
        Ok(match code {
            -1 => Self::Error,
            0 => Self::Unknown,
            1 => Self::Null,
            2 => Self::Boolean,
            3 => Self::Integer,
            4 => Self::Float,
            5 => Self::String,
            6 => Self::Object,
            7 => Self::Function,
            8 => Self::Delegate,
            9 => Self::Class,
            10 => Self::Array,
            11 => Self::Dictionary,
            other => return Err(WireError::UnsupportedValueType(other)),
        })
    }
}

impl From<ValueType> for i8 {
    fn from(kind: ValueType) -> Self {
        match kind {
            ValueType::Error => -1,
            ValueType::Unknown => 0,
            ValueType::Null => 1,
            ValueType::Boolean => 2,
            ValueType::Integer => 3,
            ValueType::Float => 4,
            ValueType::String => 5,
            ValueType::Object => 6,
            ValueType::Function => 7,
            ValueType::Delegate => 8,
            ValueType::Class => 9,
            ValueType::Array => 10,
            ValueType::Dictionary => 11,
        }
    }
}

/// One hop of a serialized error chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub message: String,
    #[serde(default)]
    pub stack: String,
}

/// Reference ids making up a delegate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegateRef {
    #[serde(rename = "type")]
    pub kind: u64,
    pub method: u64,
    pub target: u64,
}

/// A tagged RPC value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireValue {
    #[serde(rename = "type")]
    pub kind: ValueType,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default)]
    pub proxy: bool,
}

impl WireValue {
    fn inline(kind: ValueType, value: serde_json::Value) -> Self {
        Self {
            kind,
            value,
            proxy: false,
        }
    }

    pub fn null() -> Self {
        Self::inline(ValueType::Null, serde_json::Value::Null)
    }

    pub fn boolean(value: bool) -> Self {
        Self::inline(ValueType::Boolean, value.into())
    }

    pub fn integer(value: i64) -> Self {
        Self::inline(ValueType::Integer, value.into())
    }

    /// Non-finite floats have no JSON form and travel as `null`.
    pub fn float(value: f64) -> Self {
        Self::inline(ValueType::Float, value.into())
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::inline(ValueType::String, serde_json::Value::String(value.into()))
    }

    pub fn array(items: Vec<WireValue>) -> Result<Self, WireError> {
        Ok(Self::inline(ValueType::Array, serde_json::to_value(items)?))
    }

    pub fn dictionary(entries: BTreeMap<String, WireValue>) -> Result<Self, WireError> {
        Ok(Self::inline(
            ValueType::Dictionary,
            serde_json::to_value(entries)?,
        ))
    }

    /// An error chain, innermost hop first.
    pub fn error(frames: Vec<ErrorFrame>) -> Result<Self, WireError> {
        Ok(Self::inline(ValueType::Error, serde_json::to_value(frames)?))
    }

    /// A reference to an object owned by the sender.
    pub fn reference(kind: ValueType, id: u64) -> Self {
        Self::inline(kind, id.into())
    }

    /// The same value, flagged as pointing back at the receiver's object.
    pub fn proxied(mut self) -> Self {
        self.proxy = true;
        self
    }

    /// The reference id, if the value is a plain numeric reference.
    pub fn id(&self) -> Option<u64> {
        self.value.as_u64()
    }

    pub fn delegate(&self) -> Result<DelegateRef, WireError> {
        Ok(serde_json::from_value(self.value.clone())?)
    }

    pub fn items(&self) -> Result<Vec<WireValue>, WireError> {
        Ok(serde_json::from_value(self.value.clone())?)
    }

    pub fn entries(&self) -> Result<BTreeMap<String, WireValue>, WireError> {
        Ok(serde_json::from_value(self.value.clone())?)
    }

    pub fn error_frames(&self) -> Result<Vec<ErrorFrame>, WireError> {
        Ok(serde_json::from_value(self.value.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn type_codes_match_the_wire() {
        assert_eq!(i8::from(ValueType::Error), -1);
        assert_eq!(i8::from(ValueType::Dictionary), 11);
        assert_eq!(ValueType::try_from(8).unwrap(), ValueType::Delegate);
    }

    #[test]
    fn unknown_type_code_fails_to_decode() {
        let err = serde_json::from_value::<WireValue>(json!({"type": 42, "value": null}))
            .unwrap_err();
        assert!(err.to_string().contains("unsupported value type 42"));
    }

    #[test]
    fn reference_encoding() {
        let value = WireValue::reference(ValueType::Object, 7).proxied();
        assert_eq!(
            serde_json::to_value(&value).unwrap(),
            json!({"type": 6, "value": 7, "proxy": true})
        );
        assert_eq!(value.id(), Some(7));
    }

    #[test]
    fn nested_containers_decode() {
        let raw = json!({
            "type": 11,
            "value": {"list": {"type": 10, "value": [{"type": 3, "value": 1}], "proxy": false}},
            "proxy": false
        });
        let value: WireValue = serde_json::from_value(raw).unwrap();
        let entries = value.entries().unwrap();
        let list = entries["list"].items().unwrap();
        assert_eq!(list, vec![WireValue::integer(1)]);
    }

    #[test]
    fn delegate_ids_decode() {
        let value: WireValue = serde_json::from_value(json!({
            "type": 8,
            "value": {"type": 1, "method": 2, "target": 3}
        }))
        .unwrap();
        assert_eq!(
            value.delegate().unwrap(),
            DelegateRef {
                kind: 1,
                method: 2,
                target: 3
            }
        );
        assert!(!value.proxy);
    }
}
