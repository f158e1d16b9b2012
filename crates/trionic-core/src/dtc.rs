//! Diagnostic trouble codes

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::EcuKind;

/// Status bit names, bit 0 first
const STATUS_FLAGS: [&str; 8] = [
    "test failed",
    "test failed this monitoring cycle",
    "pending",
    "confirmed",
    "test not completed since last clear",
    "test failed since last clear",
    "test not completed this monitoring cycle",
    "warning indicator requested",
];

/// Known T7 codes: (code, title, hint)
const T7_CODES: [(&str, &str, &str); 4] = [
    (
        "P1230",
        "Throttle Position Sensor 1 and 2 Circuit. Sum Out of Range",
        "Faulty signal from throttle disc position sensor",
    ),
    (
        "P1231",
        "Throttle Position Sensor 1 and 2 Circuit. Sum Out of Range (No Limp Home)",
        "Brief disturbances in throttle valve control that cause the engine to jerk",
    ),
    (
        "P1460",
        "Immobilizer Active",
        "If new T7, MIU or TWICE module, program code in TWICE",
    ),
    (
        "P1530",
        "Pedal Position Sensor 1 and 2 Circuit. Sum Out of Range",
        "",
    ),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dtc {
    pub ecu: EcuKind,
    pub code: String,
    pub status: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtcInfo {
    pub title: &'static str,
    pub hint: &'static str,
}

impl Dtc {
    pub fn new(ecu: EcuKind, code: impl Into<String>, status: u8) -> Self {
        Self {
            ecu,
            code: code.into(),
            status,
        }
    }

    /// Decode the two-byte SAE J2012 form, e.g. `[0x12, 0x30]` → `P1230`
    pub fn from_bytes(ecu: EcuKind, raw: [u8; 2], status: u8) -> Self {
        let system = ['P', 'C', 'B', 'U'][(raw[0] >> 6) as usize];
        let code = format!("{}{}{:01X}{:02X}", system, (raw[0] >> 4) & 0x03, raw[0] & 0x0F, raw[1]);
        Self::new(ecu, code, status)
    }

    /// Names of the status bits that are set, lowest bit first
    pub fn status_flags(&self) -> Vec<&'static str> {
        status_flags(self.status)
    }

    pub fn info(&self) -> Option<DtcInfo> {
        match self.ecu {
            EcuKind::T7 => T7_CODES
                .iter()
                .find(|(code, _, _)| *code == self.code)
                .map(|(_, title, hint)| DtcInfo { title, hint }),
            EcuKind::T5 | EcuKind::T8 => None,
        }
    }

    /// Warning lamp requested
    pub fn mil(&self) -> bool {
        self.status & 0x80 != 0
    }
}

pub fn status_flags(status: u8) -> Vec<&'static str> {
    STATUS_FLAGS
        .iter()
        .enumerate()
        .filter(|(bit, _)| status & (1 << bit) != 0)
        .map(|(_, name)| *name)
        .collect()
}

impl fmt::Display for Dtc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        if let Some(info) = self.info() {
            write!(f, " {}", info.title)?;
        }
        Ok(())
    }
}
