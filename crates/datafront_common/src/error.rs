use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Machine-readable failure class carried in a response's `error.kind`.
///
/// Unknown kinds coming from the server are folded into [`ErrorKind::Internal`],
/// which is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "&'static str")]
pub enum ErrorKind {
    /// Transport down or request lost with the connection.
    Network,
    /// No response within the request deadline.
    Timeout,
    /// Server-declared transient failure.
    Transient,
    /// Rejected payload; surfaced verbatim for field-level messaging.
    Validation,
    /// Idempotency or state conflict; needs fresh input.
    Conflict,
    /// Target entity does not exist (any more).
    NotFound,
    /// Anything else, including malformed responses.
    Internal,
}

impl ErrorKind {
    /// Whether the same request may be sent again unchanged.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Network | ErrorKind::Timeout | ErrorKind::Transient)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Transient => "transient",
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotFound => "notFound",
            ErrorKind::Internal => "internal",
        }
    }
}

impl From<String> for ErrorKind {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            "network" => ErrorKind::Network,
            "timeout" => ErrorKind::Timeout,
            "transient" | "serverTransient" => ErrorKind::Transient,
            "validation" => ErrorKind::Validation,
            "conflict" => ErrorKind::Conflict,
            "notFound" => ErrorKind::NotFound,
            _ => ErrorKind::Internal,
        }
    }
}

impl From<ErrorKind> for &'static str {
    fn from(kind: ErrorKind) -> Self {
        kind.as_str()
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure as observed by views: the wire `error` object of a response, or
/// one synthesized locally (lost connection, timeout, malformed data).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind} error: {message}")]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    #[serde(default)]
    pub message: String,
    /// Extra structured detail, e.g. per-field validation messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Errors produced while framing or parsing wire messages.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame needs {needed} bytes but only {available} are left")]
    Truncated { needed: usize, available: usize },

    #[error("invalid JSON message: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classification_follows_the_taxonomy() {
        assert!(ErrorKind::Network.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::Transient.is_retryable());
        assert!(!ErrorKind::Validation.is_retryable());
        assert!(!ErrorKind::Conflict.is_retryable());
        assert!(!ErrorKind::NotFound.is_retryable());
        assert!(!ErrorKind::Internal.is_retryable());
    }

    #[test]
    fn unknown_server_kind_is_terminal() {
        let info: ErrorInfo =
            serde_json::from_value(json!({ "kind": "quotaExceeded", "message": "nope" })).unwrap();
        assert_eq!(info.kind, ErrorKind::Internal);
        assert!(!info.is_retryable());
    }

    #[test]
    fn validation_details_survive_parsing() {
        let info: ErrorInfo = serde_json::from_value(json!({
            "kind": "validation",
            "message": "bad name",
            "details": { "name": "too long" }
        }))
        .unwrap();
        assert_eq!(info.kind, ErrorKind::Validation);
        assert_eq!(info.details, Some(json!({ "name": "too long" })));
        assert_eq!(info.to_string(), "validation error: bad name");
    }
}
