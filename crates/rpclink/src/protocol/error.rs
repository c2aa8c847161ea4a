use rpclink_core::ErrorFrame;
use std::fmt;
use std::panic::Location;

/// An error raised by, or returned through, a remote call.
///
/// Errors that cross the wire keep their chain: a failed remote call
/// resolves to an error whose [`inner`](Self::inner) is the error the peer
/// returned, which may itself wrap errors from further hops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    message: String,
    code: i32,
    stack: String,
    inner: Option<Box<RpcError>>,
}

impl RpcError {
    /// A new error whose stack is the caller's source location.
    #[track_caller]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: -1,
            stack: format!("at {}", Location::caller()),
            inner: None,
        }
    }

    pub(crate) fn wrap(message: impl Into<String>, inner: RpcError, stack: String) -> Self {
        Self {
            message: message.into(),
            code: -1,
            stack,
            inner: Some(Box::new(inner)),
        }
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.code = code;
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn stack(&self) -> &str {
        &self.stack
    }

    pub(crate) fn set_stack(&mut self, stack: String) {
        self.stack = stack;
    }

    pub fn inner(&self) -> Option<&RpcError> {
        self.inner.as_deref()
    }

    /// The innermost error of the chain.
    pub fn original(&self) -> &RpcError {
        let mut current = self;
        while let Some(inner) = current.inner() {
            current = inner;
        }
        current
    }

    /// Stacks of the whole chain, innermost first.
    pub fn stack_trace(&self) -> String {
        match self.inner() {
            Some(inner) => format!("{}\r\n{}", inner.stack_trace(), self.stack),
            None => self.stack.clone(),
        }
    }

    /// The chain as wire frames, innermost first.
    pub fn to_frames(&self) -> Vec<ErrorFrame> {
        let mut frames = self.inner().map(Self::to_frames).unwrap_or_default();
        frames.push(ErrorFrame {
            message: self.message.clone(),
            stack: self.stack.clone(),
        });
        frames
    }

    /// Rebuild a chain from wire frames. `None` if there are none.
    pub fn from_frames(frames: Vec<ErrorFrame>) -> Option<Self> {
        frames.into_iter().fold(None, |inner, frame| {
            Some(Self {
                message: frame.message,
                code: -1,
                stack: frame.stack,
                inner: inner.map(Box::new),
            })
        })
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner
            .as_deref()
            .map(|inner| inner as &(dyn std::error::Error + 'static))
    }
}

impl From<crate::recycle::RecycleError> for RpcError {
    #[track_caller]
    fn from(err: crate::recycle::RecycleError) -> Self {
        Self::new(err.to_string())
    }
}

impl From<rpclink_core::WireError> for RpcError {
    #[track_caller]
    fn from(err: rpclink_core::WireError) -> Self {
        Self::new(err.to_string())
    }
}
