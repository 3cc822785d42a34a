use serde::{Deserialize, Serialize};

use crate::session::SessionId;

/// Errors returned by SDK operations.
///
/// RPC failures keep transport, timeout and backend-reported conditions apart
/// so callers can tell "backend unreachable" from "backend slow" from "backend
/// said no". Lookup failures are local and recoverable.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum FlowError {
    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("timeout: {method}")]
    Timeout { method: String },

    #[error("backend error: {message}")]
    Backend { message: String },

    #[error("protocol error: {message}")]
    Protocol { message: String },

    #[error("unknown session: {sid}")]
    UnknownSession { sid: SessionId },

    #[error("no current session")]
    NoCurrentSession,

    #[error("no callback registered for notification type '{event_type}'")]
    CallbackNotRegistered { event_type: String },

    #[error("handler for '{event_type}' failed: {message}")]
    Handler { event_type: String, message: String },

    #[error("invalid state: {message}")]
    InvalidState { message: String },

    #[error("backend process error: {message}")]
    Process { message: String },

    #[error("config error: {message}")]
    Config { message: String },
}

impl FlowError {
    /// Returns `true` for transient errors that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout { .. })
    }

    /// Returns `true` for local lookup failures.
    pub fn is_lookup(&self) -> bool {
        matches!(
            self,
            Self::UnknownSession { .. }
                | Self::NoCurrentSession
                | Self::CallbackNotRegistered { .. }
        )
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into() }
    }

    pub fn timeout(method: impl Into<String>) -> Self {
        Self::Timeout { method: method.into() }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend { message: message.into() }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol { message: message.into() }
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::Process { message: message.into() }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState { message: message.into() }
    }

    pub fn callback_not_registered(event_type: impl Into<String>) -> Self {
        Self::CallbackNotRegistered { event_type: event_type.into() }
    }
}
