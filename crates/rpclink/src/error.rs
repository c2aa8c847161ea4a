use crate::transport::TransportError;
use rpclink_core::{ConnectionState, WireError};

/// Errors from the authorization handshake.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    #[error("signature is not correct")]
    BadSignature,
    #[error("session {0} expired")]
    SessionExpired(String),
    /// The peer refused the handshake with this message.
    #[error("{0}")]
    Denied(String),
    #[error("rpc authorization timeout")]
    Timeout,
    #[error("rpc waitAuthorization timeout")]
    WaitTimeout,
    #[error("authorization destroyed")]
    Destroyed,
    #[error("the last authorization has not been completed")]
    Pending,
    #[error("malformed authorization frame: {0}")]
    Malformed(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl AuthError {
    /// Whether the peer actively rejected us. Retrying cannot help.
    pub fn is_denied(&self) -> bool {
        matches!(
            self,
            Self::BadSignature | Self::SessionExpired(_) | Self::Denied(_)
        )
    }
}

impl From<WireError> for AuthError {
    fn from(err: WireError) -> Self {
        Self::Malformed(err.to_string())
    }
}

/// Errors from endpoint lifecycle operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("cannot open an endpoint in the {0} state")]
    NotDisconnected(ConnectionState),
    #[error("retry count must be greater than 0")]
    InvalidRetryCount,
    #[error("open aborted, endpoint is now {0}")]
    StateChanged(ConnectionState),
    #[error("object {0} has been published")]
    AlreadyPublished(String),
    #[error("session {0} was exists")]
    SessionExists(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl Error {
    /// Errors that end an open loop immediately instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(err) if err.is_denied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_denials_are_fatal() {
        assert!(Error::Auth(AuthError::BadSignature).is_fatal());
        assert!(Error::Auth(AuthError::Denied("nope".into())).is_fatal());
        assert!(!Error::Auth(AuthError::Timeout).is_fatal());
        assert!(!Error::Transport(TransportError::Closed).is_fatal());
    }

    #[test]
    fn messages_match_the_wire_text() {
        assert_eq!(AuthError::BadSignature.to_string(), "signature is not correct");
        assert_eq!(
            AuthError::SessionExpired("abc".into()).to_string(),
            "session abc expired"
        );
        assert_eq!(
            Error::SessionExists("A".into()).to_string(),
            "session A was exists"
        );
    }
}
