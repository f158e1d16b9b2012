//! Wideband errors

use thiserror::Error;
use trionic_can::CanError;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum WblError {
    #[error("Data is too short to decode, expected at least {expected} bytes, got {got}")]
    DataTooShort { expected: usize, got: usize },

    #[error("Unknown identifier 0x{0:03X}")]
    UnknownIdentifier(u32),

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("Unknown WBL type: {0}")]
    UnknownKind(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serial port error: {0}")]
    Serial(String),

    #[error("Not supported: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Transport(#[from] CanError),
}

pub type Result<T, E = WblError> = std::result::Result<T, E>;
