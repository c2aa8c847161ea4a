use crate::Action;

/// A frame that could not be encoded or decoded.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0:?} frame carries no data")]
    MissingData(Action),
    #[error("unsupported value type {0}")]
    UnsupportedValueType(i8),
}
