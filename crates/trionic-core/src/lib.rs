//! trionic-core - firmware and symbol model for Saab Trionic 5/7/8 ECUs
//!
//! This crate knows how to turn a flash image into a [`SymbolCollection`]
//! and how to keep a modified T7 image bootable by rewriting its checksums.
//! It has no I/O beyond what the caller hands it as a byte slice.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       firmware                           │
//! │                                                          │
//! │  ┌───────────┐   ┌───────────┐   ┌────────────────────┐  │
//! │  │ Trailer   │   │  LZHUF    │   │ XML name tables    │  │
//! │  │ (TLV)     │   │ (names)   │   │ (fallback)         │  │
//! │  └─────┬─────┘   └─────┬─────┘   └─────────┬──────────┘  │
//! │        └───────────────┼───────────────────┘             │
//! │                ┌───────┴───────┐                         │
//! │                │ T7File/T8File │──── checksum engine     │
//! │                └───────┬───────┘                         │
//! └────────────────────────┼─────────────────────────────────┘
//!                          │
//!                 ┌────────┴─────────┐
//!                 │ SymbolCollection │
//!                 └──────────────────┘
//! ```

pub mod dtc;
pub mod error;
pub mod firmware;
pub mod symbol;

pub use dtc::Dtc;
pub use error::{DecodeError, ErrorKind, FirmwareError};
pub use firmware::{load_firmware, ChecksumReport, DecodeOptions, Firmware, T7File, T8File, Trailer};
pub use symbol::{correction_factor, unit_for, Symbol, SymbolCollection, SymbolType};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Trionic engine control unit generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EcuKind {
    T5,
    T7,
    T8,
}

impl EcuKind {
    /// Extension used for pipe-delimited log files of this ECU
    pub fn log_extension(&self) -> &'static str {
        match self {
            EcuKind::T5 => "t5l",
            EcuKind::T7 => "t7l",
            EcuKind::T8 => "t8l",
        }
    }

    /// ASCII selector sent to the txbridge before configuring symbols
    pub fn bridge_selector(&self) -> u8 {
        match self {
            EcuKind::T5 => b'5',
            EcuKind::T7 => b'7',
            EcuKind::T8 => b'8',
        }
    }
}

impl fmt::Display for EcuKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EcuKind::T5 => "T5",
            EcuKind::T7 => "T7",
            EcuKind::T8 => "T8",
        };
        f.write_str(s)
    }
}

impl FromStr for EcuKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "t5" | "trionic5" | "trionic 5" => Ok(EcuKind::T5),
            "t7" | "trionic7" | "trionic 7" => Ok(EcuKind::T7),
            "t8" | "trionic8" | "trionic 8" => Ok(EcuKind::T8),
            other => Err(format!("unknown ECU kind '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ecu_kind_parse() {
        assert_eq!("T7".parse::<EcuKind>().unwrap(), EcuKind::T7);
        assert_eq!("trionic 8".parse::<EcuKind>().unwrap(), EcuKind::T8);
        assert!("t9".parse::<EcuKind>().is_err());
        assert_eq!(EcuKind::T5.log_extension(), "t5l");
    }
}
