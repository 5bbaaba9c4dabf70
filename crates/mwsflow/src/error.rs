use std::time::Duration;

use thiserror::Error;

use crate::jobs::store::StoreError;

/// Returned synchronously by `queue_report` / `queue_feed`. Nothing is
/// written to the store when enqueueing fails validation.
#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("invalid job parameters: {0}")]
    InvalidParams(String),

    #[error("no callback handler registered under {0:?}")]
    UnknownHandler(String),

    #[error("handler {handler:?} expects argument type {expected}, got {actual}")]
    ArgumentTypeMismatch {
        handler: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("callback argument could not be serialized: {0}")]
    Argument(#[source] serde_json::Error),

    #[error("job parameters could not be serialized: {0}")]
    Payload(#[source] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why a callback delivery did not complete. Every variant bumps the
/// entry's invoke counter.
#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("no callback handler registered under {0:?}")]
    UnknownHandler(String),

    #[error("handler {handler:?} is registered for {registered}, entry carries {persisted}")]
    ArgumentTypeMismatch {
        handler: String,
        registered: &'static str,
        persisted: String,
    },

    #[error("argument for handler {handler:?} failed to deserialize: {source}")]
    BadArgument {
        handler: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("handler {handler:?} timed out after {}ms", .after.as_millis())]
    Timeout { handler: String, after: Duration },

    #[error("handler {handler:?} failed: {message}")]
    Failed { handler: String, message: String },

    #[error("handler {handler:?} panicked")]
    Panicked { handler: String },
}

impl CallbackError {
    /// Stable code stored in `last_error`.
    pub fn code(&self) -> &'static str {
        match self {
            CallbackError::UnknownHandler(_) => "UNKNOWN_HANDLER",
            CallbackError::ArgumentTypeMismatch { .. } => "ARGUMENT_TYPE_MISMATCH",
            CallbackError::BadArgument { .. } => "BAD_ARGUMENT",
            CallbackError::Timeout { .. } => "TIMEOUT",
            CallbackError::Failed { .. } => "HANDLER_ERROR",
            CallbackError::Panicked { .. } => "HANDLER_PANIC",
        }
    }
}
