//! PLX iMFD serial protocol
//!
//! A packet is `0x80`, then one or more 5-byte sensor records
//! `[addr_hi, addr_lo, instance, data_hi, data_lo]` carrying 6 bits each,
//! then `0x40`.

use std::collections::HashMap;

use crate::error::{Result, WblError};

pub const PRODUCT: &str = "PLX iMFD";

pub const BAUD_RATE: u32 = 19_200;

const START: u8 = 0x80;
const STOP: u8 = 0x40;
const DATA_MASK: u8 = 0x3F;
const RECORD: usize = 5;

/// Sensor address of a wideband AFR module
pub const WIDEBAND_AIR_FUEL: u16 = 0;

/// Reported before the first wideband record
const DEFAULT_LAMBDA: f64 = 0.5;

#[derive(Debug, Default)]
pub struct Imfd {
    buffer: Vec<u8>,
    parsing: bool,
    /// (sensor address, instance) → value
    values: HashMap<(u16, u8), f64>,
}

impl Imfd {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lambda(&self) -> f64 {
        self.sensor(WIDEBAND_AIR_FUEL, 0).unwrap_or(DEFAULT_LAMBDA)
    }

    /// Converted wideband values, raw 12-bit readings for other sensors
    pub fn sensor(&self, address: u16, instance: u8) -> Option<f64> {
        self.values.get(&(address, instance)).copied()
    }

    pub(crate) fn set_lambda(&mut self, lambda: f64) {
        self.values.insert((WIDEBAND_AIR_FUEL, 0), lambda);
    }

    pub fn feed(&mut self, data: &[u8]) -> Result<()> {
        for &b in data {
            match b {
                START => {
                    self.buffer.clear();
                    self.parsing = true;
                }
                STOP => {
                    self.parsing = false;
                    let records = std::mem::take(&mut self.buffer);
                    self.parse_records(&records)?;
                }
                _ if self.parsing => self.buffer.push(b),
                _ => {}
            }
        }
        Ok(())
    }

    fn parse_records(&mut self, data: &[u8]) -> Result<()> {
        if data.len() % RECORD != 0 {
            return Err(WblError::InvalidPacket(format!("iMFD payload of {} bytes", data.len())));
        }
        for record in data.chunks_exact(RECORD) {
            let address = u16::from(record[0] & DATA_MASK) << 6 | u16::from(record[1] & DATA_MASK);
            let instance = record[2] & DATA_MASK;
            let raw = u16::from(record[3] & DATA_MASK) << 6 | u16::from(record[4] & DATA_MASK);
            self.values.insert((address, instance), convert(address, raw));
        }
        Ok(())
    }
}

fn convert(address: u16, raw: u16) -> f64 {
    match address {
        WIDEBAND_AIR_FUEL => (f64::from(raw) / 3.75 + 68.0) / 100.0,
        _ => f64::from(raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wideband_record() {
        let mut imfd = Imfd::new();
        assert_eq!(imfd.lambda(), 0.5);
        // raw 120: (120 / 3.75 + 68) / 100 = 1.0
        imfd.feed(&[0x80, 0x00, 0x00, 0x00, 0x01, 0x38, 0x40]).unwrap();
        assert!((imfd.lambda() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_multiple_records_and_noise() {
        let mut imfd = Imfd::new();
        // noise before start, then wideband #0 and EGT #1
        imfd.feed(&[0x11, 0x80, 0, 0, 0, 0x01, 0x38, 0x00, 0x01, 0x01, 0x0F, 0x3F]).unwrap();
        imfd.feed(&[0x40]).unwrap();
        assert!((imfd.lambda() - 1.0).abs() < 1e-9);
        assert_eq!(imfd.sensor(1, 1), Some(f64::from(0x0F << 6 | 0x3F)));
    }

    #[test]
    fn test_truncated_packet() {
        let mut imfd = Imfd::new();
        assert!(imfd.feed(&[0x80, 0x00, 0x00, 0x40]).is_err());
    }
}
