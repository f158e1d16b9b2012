//! Firmware and symbol decoding errors

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How the acquisition engine reacts to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Session cannot start or must stop now
    Fatal,
    /// Counted against the per-second error budget
    Retryable,
    /// Reported on the completion channel of one RAM request
    PerRequest,
    /// Caller should try again later
    Backpressure,
    /// Log sink failure, counted like a retryable error
    PartialIo,
}

/// Errors raised while parsing or rewriting a firmware image
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FirmwareError {
    #[error("File has incorrect length: {0} bytes")]
    InvalidLength(usize),

    #[error("File does not seem to be a Trionic 7 binary")]
    NotTrionic7,

    #[error("File does not seem to be a Trionic 8 binary")]
    NotTrionic8,

    #[error("Symbol table missing: {0}")]
    SymbolTableMissing(String),

    #[error("Symbol name table is Blowfish encrypted")]
    SymbolTableEncrypted,

    #[error("Address table missing: {0}")]
    AddressTableMissing(String),

    #[error("Offset out of range: 0x{0:X}")]
    OffsetOutOfRange(usize),

    #[error("Address 0x{address:X}+{length} outside the RAM window")]
    AddressOutOfRange { address: u32, length: u16 },

    #[error("Trailer field 0x{0:02X} missing")]
    TrailerFieldMissing(u8),

    #[error("No symbol name table for software version '{0}'")]
    VersionUnknown(String),

    #[error("LZHUF decode failed: {0}")]
    Lzhuf(String),

    #[error("Checksum area not found")]
    ChecksumAreaMissing,

    #[error("Checksum mismatch in {field}: stored 0x{stored:08X}, computed 0x{computed:08X}")]
    ChecksumMismatch {
        field: &'static str,
        stored: u32,
        computed: u32,
    },

    #[error("I/O error: {0}")]
    Io(String),
}

impl FirmwareError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FirmwareError::ChecksumMismatch { .. } => ErrorKind::Retryable,
            FirmwareError::Io(_) => ErrorKind::PartialIo,
            _ => ErrorKind::Fatal,
        }
    }
}

impl From<std::io::Error> for FirmwareError {
    fn from(err: std::io::Error) -> Self {
        FirmwareError::Io(err.to_string())
    }
}

/// Per-symbol failure. The decoder records these and keeps going.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{name}: slice 0x{offset:X}+{length} outside image of {image_len} bytes")]
    OutOfBounds {
        name: String,
        offset: u64,
        length: u16,
        image_len: usize,
    },

    #[error("{name}: wanted {wanted} bytes, {available} available")]
    ShortRead {
        name: String,
        wanted: usize,
        available: usize,
    },
}

impl DecodeError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Retryable
    }
}
