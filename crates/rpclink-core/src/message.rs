//! Session-level messages.
//!
//! Every frame on the transport is one [`Message`]. The `data` payload is
//! interpreted according to `action`: handshake data for
//! [`Action::Authorization`], an RPC envelope for [`Action::Transfer`], and a
//! bare request/response marker for keepalive and status sync.

use crate::WireError;
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

/// What a session frame is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum Action {
    Unknown = 0,
    /// Handshake request or response.
    Authorization = 1,
    /// Application payload with reliable delivery.
    Transfer = 2,
    /// Liveness ping or pong.
    Keepalive = 3,
    /// The sender is leaving for good and will not reconnect.
    Wave = 4,
    /// Ask the peer to retransmit everything it has not seen acknowledged.
    StatusSync = 5,
}

/// Distinguishes the two halves of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum MessageKind {
    #[default]
    Unknown = 0,
    Request = 1,
    Response = 2,
}

/// A session frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Ids the sender has delivered upward since its previous transfer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_requests: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl Message {
    /// A frame with no id and no payload.
    pub fn bare(action: Action) -> Self {
        Self {
            action,
            id: None,
            resolved_requests: None,
            data: serde_json::Value::Null,
        }
    }

    /// A frame carrying a typed payload.
    pub fn with_data<T: Serialize>(action: Action, data: &T) -> Result<Self, WireError> {
        Ok(Self {
            data: serde_json::to_value(data)?,
            ..Self::bare(action)
        })
    }

    /// Set the frame id.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Decode a frame received from a transport.
    pub fn from_json(value: serde_json::Value) -> Result<Self, WireError> {
        Ok(serde_json::from_value(value)?)
    }

    /// Decode the payload as `T`.
    pub fn data_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T, WireError> {
        if self.data.is_null() {
            return Err(WireError::MissingData(self.action));
        }
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

/// Handshake payload for [`Action::Authorization`].
///
/// Durations are milliseconds. A responder fills in the negotiated values it
/// has configured; zero or absent means "use your own default", a negative
/// value disables the feature.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationData {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub name: String,
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keepalive_timeout: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keepalive_interval: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect_timeout: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect_interval: Option<i64>,
}

impl AuthorizationData {
    /// A signed handshake request for `name`.
    pub fn request(name: &str, session_id: Option<String>) -> Self {
        Self {
            kind: MessageKind::Request,
            name: name.to_string(),
            signature: crate::make_signature(name),
            session_id,
            ..Self::default()
        }
    }
}

/// Payload of keepalive and status-sync frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalData {
    #[serde(rename = "type")]
    pub kind: MessageKind,
}

impl SignalData {
    pub fn request() -> Self {
        Self {
            kind: MessageKind::Request,
        }
    }

    pub fn response() -> Self {
        Self {
            kind: MessageKind::Response,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn transfer_frame_uses_camel_case() {
        let mut message = Message::with_data(Action::Transfer, &json!({"x": 1}))
            .unwrap()
            .id("abc");
        message.resolved_requests = Some(vec!["r1".into()]);

        let encoded = serde_json::to_value(&message).unwrap();
        assert_eq!(
            encoded,
            json!({"action": 2, "id": "abc", "resolvedRequests": ["r1"], "data": {"x": 1}})
        );
    }

    #[test]
    fn wave_frame_is_just_the_action() {
        let encoded = serde_json::to_string(&Message::bare(Action::Wave)).unwrap();
        assert_eq!(encoded, r#"{"action":4}"#);
    }

    #[test]
    fn unknown_action_code_is_rejected() {
        assert!(Message::from_json(json!({"action": 9})).is_err());
    }

    #[test]
    fn authorization_request_is_signed() {
        let data = AuthorizationData::request("A", Some("s1".into()));
        let encoded = serde_json::to_value(&data).unwrap();
        assert_eq!(encoded["type"], 1);
        assert_eq!(encoded["sessionId"], "s1");
        assert!(crate::check_signature(&data.name, &data.signature));
        assert!(encoded.get("keepaliveTimeout").is_none());
    }

    #[test]
    fn missing_payload_is_reported() {
        let message = Message::bare(Action::Keepalive);
        assert!(matches!(
            message.data_as::<SignalData>(),
            Err(WireError::MissingData(Action::Keepalive))
        ));
    }
}
