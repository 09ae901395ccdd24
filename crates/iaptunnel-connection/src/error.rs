//! Relay connection errors

use iaptunnel_proto::{CloseCode, CodecError};
use iaptunnel_transport::TransportError;
use thiserror::Error;

/// Errors surfaced by relay connections and probes
///
/// `Clone` so a single fault can be reported to both halves of a split
/// connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// The relay refused the credential, certificate or destination
    #[error("Unauthorized by relay ({code}): {reason}")]
    Unauthorized { code: CloseCode, reason: String },

    /// The local peer is not allowed to use the tunnel
    #[error("Local peer rejected by relay policy")]
    RelayPolicyViolation,

    #[error("Transport fault: {0}")]
    TransportFault(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Operation timed out")]
    Timeout,

    /// The relay no longer knows the session, so it cannot be resumed
    #[error("Session expired ({code}): {reason}")]
    SessionExpired { code: CloseCode, reason: String },

    /// The relay ended the session with a non-normal close code
    #[error("Relay closed the session ({code}): {reason}")]
    Remote { code: CloseCode, reason: String },

    #[error("Connection closed")]
    Closed,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RelayError {
    /// Classify a CONNECT_FAIL or CLOSE received from the relay
    pub fn from_close(code: CloseCode, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        if code.is_session_expired() {
            RelayError::SessionExpired { code, reason }
        } else if code.is_authorization_failure() {
            RelayError::Unauthorized { code, reason }
        } else {
            RelayError::Remote { code, reason }
        }
    }

    /// Transport faults and timeouts are retried by the reconnect loop
    pub fn is_retryable(&self) -> bool {
        matches!(self, RelayError::TransportFault(_) | RelayError::Timeout)
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, RelayError::Unauthorized { .. })
    }

    /// Close code to report to the relay when this error ends a session
    pub fn close_code(&self) -> CloseCode {
        match self {
            RelayError::ProtocolViolation(_) => CloseCode::INVALID_DATA,
            RelayError::Closed => CloseCode::NORMAL,
            _ => CloseCode::ERROR_UNKNOWN,
        }
    }
}

impl From<TransportError> for RelayError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => RelayError::Timeout,
            other => RelayError::TransportFault(other.to_string()),
        }
    }
}

impl From<CodecError> for RelayError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) => RelayError::TransportFault(e.to_string()),
            other => RelayError::ProtocolViolation(other.to_string()),
        }
    }
}
