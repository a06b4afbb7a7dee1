//! Error taxonomy shared across the flotilla layers

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Flotilla error kinds
///
/// Every variant carries a human-readable context string. Errors at
/// operation scope end only that operation; framing, session and
/// flow-control violations end the terminal; ship and crane-scope session
/// failures end the crane.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum Error {
    /// Unexpected internal state
    #[error("internal error: {0}")]
    Internal(String),

    /// Data could not be parsed
    #[error("malformed data: {0}")]
    MalformedData(String),

    /// Authenticity or integrity check failed
    #[error("integrity violated: {0}")]
    Integrity(String),

    /// Caller lacks the required terminal permission
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Protocol misuse by the peer or caller
    #[error("incorrect usage: {0}")]
    IncorrectUsage(String),

    /// Local send queue exceeded its ceiling
    #[error("queue overflow: {0}")]
    QueueOverflow(String),

    /// Deadline exceeded
    #[error("timed out: {0}")]
    Timeout(String),

    /// Component is shutting down
    #[error("stopping: {0}")]
    Stopping(String),

    /// Resource is exhausted right now, retry later
    #[error("try again later: {0}")]
    TryAgainLater(String),

    /// No crane is assigned to the requested hub
    #[error("hub unavailable: {0}")]
    HubUnavailable(String),

    /// Received data is older than what is already stored
    #[error("outdated data: {0}")]
    OldData(String),

    /// The underlying transport failed
    #[error("ship sunk: {0}")]
    ShipSunk(String),
}

impl Error {
    /// Prefix the context with another layer of information.
    #[must_use]
    pub fn wrap(self, context: impl AsRef<str>) -> Self {
        let combine = |inner: String| format!("{}: {}", context.as_ref(), inner);
        match self {
            Self::Internal(c) => Self::Internal(combine(c)),
            Self::MalformedData(c) => Self::MalformedData(combine(c)),
            Self::Integrity(c) => Self::Integrity(combine(c)),
            Self::PermissionDenied(c) => Self::PermissionDenied(combine(c)),
            Self::IncorrectUsage(c) => Self::IncorrectUsage(combine(c)),
            Self::QueueOverflow(c) => Self::QueueOverflow(combine(c)),
            Self::Timeout(c) => Self::Timeout(combine(c)),
            Self::Stopping(c) => Self::Stopping(combine(c)),
            Self::TryAgainLater(c) => Self::TryAgainLater(combine(c)),
            Self::HubUnavailable(c) => Self::HubUnavailable(combine(c)),
            Self::OldData(c) => Self::OldData(combine(c)),
            Self::ShipSunk(c) => Self::ShipSunk(combine(c)),
        }
    }

    /// Whether this error only means orderly shutdown.
    pub fn is_stopping(&self) -> bool {
        matches!(self, Self::Stopping(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::ShipSunk(err.to_string())
    }
}
