//! RPC request/response envelope.
//!
//! Carried as the `data` of a transfer frame. Requests and responses share a
//! single flat shape so that either can be decoded before its `type` is
//! known.

use crate::{MessageKind, WireValue};
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

/// What a request asks the peer to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum RpcAction {
    Unknown = 0,
    /// Call a function, or a method named by `value` on `self`.
    Call = 1,
    /// Construct an instance of the function or class in `value`.
    New = 2,
}

/// An RPC request or response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcEnvelope {
    /// Correlates a response with its request.
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub action: RpcAction,
    /// Receiver of a call; `null` addresses the published roots.
    #[serde(rename = "self", default)]
    pub this: Option<WireValue>,
    /// The function, class or method name being invoked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<WireValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<WireValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<WireValue>,
    /// Reference ids the sender no longer needs.
    #[serde(default)]
    pub disposed: Vec<u64>,
}

impl RpcEnvelope {
    pub fn request(
        id: u64,
        action: RpcAction,
        this: Option<WireValue>,
        value: WireValue,
        args: Vec<WireValue>,
    ) -> Self {
        Self {
            id,
            kind: MessageKind::Request,
            action,
            this,
            value: Some(value),
            args: Some(args),
            result: None,
            disposed: Vec::new(),
        }
    }

    pub fn response(id: u64, action: RpcAction, result: WireValue) -> Self {
        Self {
            id,
            kind: MessageKind::Response,
            action,
            this: None,
            value: None,
            args: None,
            result: Some(result),
            disposed: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ValueType;
    use serde_json::json;

    #[test]
    fn root_call_sends_null_self() {
        let request = RpcEnvelope::request(
            3,
            RpcAction::Call,
            None,
            WireValue::string("service"),
            vec![],
        );
        let encoded = serde_json::to_value(&request).unwrap();
        assert_eq!(encoded["type"], 1);
        assert_eq!(encoded["action"], 1);
        assert!(encoded["self"].is_null());
        assert_eq!(encoded["value"], json!({"type": 5, "value": "service", "proxy": false}));
        assert_eq!(encoded["args"], json!([]));
        assert_eq!(encoded["disposed"], json!([]));
    }

    #[test]
    fn method_call_carries_self() {
        let request = RpcEnvelope::request(
            4,
            RpcAction::Call,
            Some(WireValue::reference(ValueType::Object, 9).proxied()),
            WireValue::string("add"),
            vec![WireValue::integer(2), WireValue::integer(3)],
        );
        let decoded: RpcEnvelope =
            serde_json::from_str(&serde_json::to_string(&request).unwrap()).unwrap();
        assert_eq!(decoded.this.as_ref().and_then(WireValue::id), Some(9));
        assert_eq!(decoded.args.map(|a| a.len()), Some(2));
    }

    #[test]
    fn response_decodes_without_request_fields() {
        let decoded: RpcEnvelope = serde_json::from_value(json!({
            "id": 4,
            "type": 2,
            "action": 1,
            "result": {"type": 3, "value": 5, "proxy": false},
            "disposed": [1, 2]
        }))
        .unwrap();
        assert_eq!(decoded.kind, MessageKind::Response);
        assert_eq!(decoded.result, Some(WireValue::integer(5)));
        assert_eq!(decoded.disposed, vec![1, 2]);
        assert!(decoded.this.is_none());
    }
}
