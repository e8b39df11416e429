use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ConnectionState;

/// Broad error category used for logging and retry decisions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CourierErrorCategory {
    /// Invalid input, unsupported state, or other configuration issue.
    Config,
    /// The remote endpoint rejected or revoked this identity.
    Auth,
    /// Transient network failure.
    Network,
    /// Transport-level protocol failure reported by the transport library.
    Transport,
    /// Credential store or other local persistence failure.
    Storage,
    /// Serialization/deserialization failure.
    Serialization,
    /// A downstream event handler failed.
    Handler,
    /// Internal bug or invariant break.
    Internal,
}

/// Stable error payload shared by every courier crate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct CourierError {
    /// High-level error category.
    pub category: CourierErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl CourierError {
    /// Construct a new error.
    pub fn new(
        category: CourierErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: ConnectionState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            CourierErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while connection is in state {current:?}"),
        )
    }

    pub fn handler(message: impl Into<String>) -> Self {
        Self::new(CourierErrorCategory::Handler, "handler_failed", message)
    }

    pub fn network(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(CourierErrorCategory::Network, code, message)
    }
}

/// Classified transport close status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The remote endpoint explicitly logged this identity out.
    LoggedOut,
    Forbidden,
    /// The connection was lost or timed out.
    ConnectionLost,
    MultideviceMismatch,
    ConnectionClosed,
    /// Another session for the same identity took over.
    ConnectionReplaced,
    BadSession,
    UnavailableService,
    RestartRequired,
    Unknown(u16),
}

impl DisconnectReason {
    /// Map a transport close status code.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => Self::LoggedOut,
            403 => Self::Forbidden,
            408 => Self::ConnectionLost,
            411 => Self::MultideviceMismatch,
            428 => Self::ConnectionClosed,
            440 => Self::ConnectionReplaced,
            500 => Self::BadSession,
            503 => Self::UnavailableService,
            515 => Self::RestartRequired,
            other => Self::Unknown(other),
        }
    }

    pub fn is_recoverable(self) -> bool {
        !matches!(self, Self::LoggedOut)
    }
}
