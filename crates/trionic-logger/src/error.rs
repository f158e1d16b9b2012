//! Logger errors

use thiserror::Error;
use trionic_can::{CanError, ProtocolError};
use trionic_core::{DecodeError, ErrorKind};
use trionic_wbl::WblError;

#[derive(Debug, Error)]
pub enum LoggerError {
    /// A request of the same kind is already queued
    #[error("pending")]
    Pending,

    #[error("Event bus queue full, dropped '{0}'")]
    PublishFull(String),

    #[error("Event bus closed")]
    BusClosed,

    #[error("Request cancelled")]
    Cancelled,

    #[error("{0}")]
    RequestTimeout(String),

    #[error("Address 0x{address:X}+{length} outside the RAM window")]
    AddressOutOfRange { address: u32, length: u32 },

    #[error("expected {expected} bytes, got {got}")]
    PayloadLength { expected: usize, got: usize },

    #[error("txbridge error 0x{0:02X}")]
    Bridge(u8),

    #[error("too many errors per second")]
    TooManyErrors,

    #[error("No logging session running")]
    NotRunning,

    #[error("Logging session already running")]
    AlreadyRunning,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Log file {path}: line {line}: {reason}")]
    Parse { path: String, line: usize, reason: String },

    #[error("Engine task failed: {0}")]
    Aborted(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Wbl(#[from] WblError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CanError> for LoggerError {
    fn from(e: CanError) -> Self {
        LoggerError::Protocol(ProtocolError::Transport(e))
    }
}

impl LoggerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LoggerError::Pending | LoggerError::PublishFull(_) => ErrorKind::Backpressure,
            LoggerError::Cancelled
            | LoggerError::RequestTimeout(_)
            | LoggerError::AddressOutOfRange { .. }
            | LoggerError::NotRunning => ErrorKind::PerRequest,
            LoggerError::PayloadLength { .. } | LoggerError::Bridge(_) => ErrorKind::Retryable,
            LoggerError::Io(_) => ErrorKind::PartialIo,
            LoggerError::Protocol(e) => e.kind(),
            LoggerError::Decode(e) => e.kind(),
            LoggerError::Wbl(WblError::Transport(e)) => e.kind(),
            LoggerError::Wbl(WblError::InvalidConfig(_) | WblError::UnknownKind(_) | WblError::Unsupported(_)) => {
                ErrorKind::Fatal
            }
            LoggerError::Wbl(_) => ErrorKind::Retryable,
            LoggerError::BusClosed
            | LoggerError::TooManyErrors
            | LoggerError::AlreadyRunning
            | LoggerError::Config(_)
            | LoggerError::Unsupported(_)
            | LoggerError::Parse { .. }
            | LoggerError::Aborted(_) => ErrorKind::Fatal,
        }
    }
}

pub type Result<T, E = LoggerError> = std::result::Result<T, E>;
