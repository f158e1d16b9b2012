//! Transport and protocol errors

use thiserror::Error;
use trionic_core::ErrorKind;

use crate::nrc::NegativeResponseCode;

/// CAN link errors. `Clone` so one failure can be fanned out to every waiter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CanError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed")]
    ConnectionClosed,

    /// The adapter lost its link to the bus
    #[error("Bus error: {0}")]
    BusError(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    /// The adapter refused the frame (bad id, oversized payload, ...)
    #[error("Frame rejected: {0}")]
    Rejected(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Transport not supported: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl CanError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CanError::Timeout(_) | CanError::Codec(_) | CanError::SendFailed(_) | CanError::Rejected(_) => {
                ErrorKind::Retryable
            }
            CanError::ConnectionFailed(_)
            | CanError::ConnectionClosed
            | CanError::BusError(_)
            | CanError::InvalidConfig(_)
            | CanError::Unsupported(_) => ErrorKind::Fatal,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CanError::Timeout(_))
    }
}

/// Serial-command framing errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Corrupt frame '{command}': checksum 0x{expected:02X}, computed 0x{computed:02X}")]
    Corrupt {
        command: char,
        expected: u8,
        computed: u8,
    },

    #[error("Payload of {len} bytes exceeds limit of {max}")]
    Overrun { len: usize, max: usize },
}

/// Diagnostic protocol errors shared by the KWP2000, GMLAN and T5 clients
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error(transparent)]
    Transport(#[from] CanError),

    #[error("{context}: service 0x{service:02X} rejected: {code}")]
    Negative {
        service: u8,
        code: NegativeResponseCode,
        context: String,
    },

    #[error("{context}: unexpected response {response}")]
    UnexpectedResponse { context: String, response: String },

    #[error("Expected {expected} bytes, got {got}")]
    LengthMismatch { expected: usize, got: usize },

    #[error("Security access was not granted")]
    SecurityDenied,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ProtocolError {
    pub fn negative(service: u8, code: u8, context: impl Into<String>) -> Self {
        ProtocolError::Negative {
            service,
            code: NegativeResponseCode::from(code),
            context: context.into(),
        }
    }

    pub fn unexpected(context: impl Into<String>, response: impl std::fmt::Display) -> Self {
        ProtocolError::UnexpectedResponse {
            context: context.into(),
            response: response.to_string(),
        }
    }

    /// Raw negative response code, if this is a negative response
    pub fn code(&self) -> Option<u8> {
        match self {
            ProtocolError::Negative { code, .. } => Some((*code).into()),
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::Transport(e) => e.kind(),
            ProtocolError::SecurityDenied => ErrorKind::Fatal,
            ProtocolError::InvalidRequest(_) => ErrorKind::PerRequest,
            ProtocolError::Negative { .. }
            | ProtocolError::UnexpectedResponse { .. }
            | ProtocolError::LengthMismatch { .. } => ErrorKind::Retryable,
        }
    }
}

pub type Result<T, E = ProtocolError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(CanError::Timeout("x".into()).kind(), ErrorKind::Retryable);
        assert_eq!(CanError::BusError("gone".into()).kind(), ErrorKind::Fatal);
        assert_eq!(ProtocolError::SecurityDenied.kind(), ErrorKind::Fatal);
        assert_eq!(
            ProtocolError::from(CanError::Timeout("x".into())).kind(),
            ErrorKind::Retryable
        );
    }

    #[test]
    fn test_negative_display() {
        let err = ProtocolError::negative(0x27, 0x35, "SecurityAccess");
        assert_eq!(err.code(), Some(0x35));
        assert_eq!(
            err.to_string(),
            "SecurityAccess: service 0x27 rejected: Invalid key supplied (0x35)"
        );
    }
}
