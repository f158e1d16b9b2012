//! Symbol model
//!
//! A symbol is a named region of ECU memory. Firmware decoding produces
//! them with `raw` filled from the flash image; the acquisition engine
//! refills `raw` from live reads.

mod collection;
mod factors;

pub use collection::SymbolCollection;
pub use factors::{correction_factor, t5_correction_factor, unit_for};

use std::fmt;

use bytes::Buf;
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// Symbols with a number at or below this are bridge ADC channels
pub const ADC_NUMBER_BASE: i32 = -1000;

/// Type bitfield as stored in the address table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SymbolType(pub u8);

impl SymbolType {
    pub const SIGNED: u8 = 0x01;
    pub const CONST: u8 = 0x02;
    pub const CHAR: u8 = 0x04;
    pub const LONG: u8 = 0x08;
    pub const BITFIELD: u8 = 0x10;
    pub const STRUCT: u8 = 0x20;

    pub fn is_signed(&self) -> bool {
        self.0 & Self::SIGNED != 0
    }

    pub fn is_const(&self) -> bool {
        self.0 & Self::CONST != 0
    }

    pub fn is_char(&self) -> bool {
        self.0 & Self::CHAR != 0
    }

    pub fn is_long(&self) -> bool {
        self.0 & Self::LONG != 0
    }

    pub fn is_bitfield(&self) -> bool {
        self.0 & Self::BITFIELD != 0
    }

    pub fn is_struct(&self) -> bool {
        self.0 & Self::STRUCT != 0
    }
}

/// A named, addressable region in ECU memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    /// Index into the firmware address table, -1 for synthetic symbols
    pub number: i32,
    pub address: u32,
    #[serde(default)]
    pub sram_offset: u32,
    pub length: u16,
    #[serde(default)]
    pub mask: u16,
    #[serde(rename = "type", default)]
    pub symbol_type: SymbolType,
    #[serde(default)]
    pub extended_type: u8,
    #[serde(default = "default_correction_factor")]
    pub correction_factor: f64,
    #[serde(default)]
    pub unit: String,
    /// Another source already supplies this name
    #[serde(skip)]
    pub skip: bool,
    #[serde(skip)]
    raw: Vec<u8>,
}

fn default_correction_factor() -> f64 {
    1.0
}

impl Symbol {
    pub fn new(name: impl Into<String>, number: i32, address: u32, length: u16) -> Self {
        let name = name.into();
        Self {
            correction_factor: correction_factor(&name),
            unit: unit_for(&name).to_string(),
            name,
            number,
            address,
            sram_offset: 0,
            length,
            mask: 0,
            symbol_type: SymbolType::default(),
            extended_type: 0,
            skip: false,
            raw: Vec::new(),
        }
    }

    /// Rename and refresh correction factor and unit from the name tables
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.correction_factor = correction_factor(&self.name);
        self.unit = unit_for(&self.name).to_string();
    }

    pub fn with_type(mut self, symbol_type: u8) -> Self {
        self.symbol_type = SymbolType(symbol_type);
        self
    }

    pub fn with_correction_factor(mut self, factor: f64) -> Self {
        self.correction_factor = factor;
        self
    }

    pub fn is_adc(&self) -> bool {
        self.number <= ADC_NUMBER_BASE
    }

    /// Bridge ADC channel for ADC pseudo symbols
    pub fn adc_channel(&self) -> Option<u8> {
        if self.is_adc() {
            u8::try_from(-(self.number - ADC_NUMBER_BASE)).ok()
        } else {
            None
        }
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn set_raw(&mut self, raw: impl Into<Vec<u8>>) {
        self.raw = raw.into();
    }

    pub fn has_data(&self) -> bool {
        !self.raw.is_empty()
    }

    /// Consume `length` bytes from a composite payload into `raw`
    pub fn read(&mut self, buf: &mut impl Buf) -> Result<(), DecodeError> {
        let wanted = self.length as usize;
        if buf.remaining() < wanted {
            return Err(DecodeError::ShortRead {
                name: self.name.clone(),
                wanted,
                available: buf.remaining(),
            });
        }
        self.raw.clear();
        self.raw.resize(wanted, 0);
        buf.copy_to_slice(&mut self.raw);
        Ok(())
    }

    /// Scalar value with the correction factor applied.
    ///
    /// 1, 2 and 4 byte symbols decode as a single big-endian integer; longer
    /// symbols decode their first 16-bit word.
    pub fn float64(&self) -> f64 {
        let signed = self.symbol_type.is_signed();
        let raw = &self.raw;
        let value = match raw.len() {
            0 => 0.0,
            1 => {
                if signed {
                    raw[0] as i8 as f64
                } else {
                    raw[0] as f64
                }
            }
            4 => {
                let v = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
                if signed {
                    v as i32 as f64
                } else {
                    v as f64
                }
            }
            _ => {
                let v = u16::from_be_bytes([raw[0], raw[1]]);
                if signed {
                    v as i16 as f64
                } else {
                    v as f64
                }
            }
        };
        value * self.correction_factor
    }

    pub fn u8s(&self) -> Vec<u8> {
        self.raw.clone()
    }

    pub fn i8s(&self) -> Vec<i8> {
        self.raw.iter().map(|b| *b as i8).collect()
    }

    pub fn u16s(&self) -> Vec<u16> {
        self.raw
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect()
    }

    pub fn i16s(&self) -> Vec<i16> {
        self.u16s().into_iter().map(|v| v as i16).collect()
    }

    pub fn u32s(&self) -> Vec<u32> {
        self.raw
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    pub fn i32s(&self) -> Vec<i32> {
        self.u32s().into_iter().map(|v| v as i32).collect()
    }

    /// Element-wise values honouring sign and correction factor.
    /// Element width follows the long/char type bits, defaulting to 16 bits.
    pub fn float64s(&self) -> Vec<f64> {
        let cf = self.correction_factor;
        let signed = self.symbol_type.is_signed();
        if self.symbol_type.is_long() {
            if signed {
                self.i32s().into_iter().map(|v| v as f64 * cf).collect()
            } else {
                self.u32s().into_iter().map(|v| v as f64 * cf).collect()
            }
        } else if self.symbol_type.is_char() || self.raw.len() == 1 {
            if signed {
                self.i8s().into_iter().map(|v| v as f64 * cf).collect()
            } else {
                self.raw.iter().map(|v| *v as f64 * cf).collect()
            }
        } else if signed {
            self.i16s().into_iter().map(|v| v as f64 * cf).collect()
        } else {
            self.u16s().into_iter().map(|v| v as f64 * cf).collect()
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} #{} @{:08X} type: {:02X} len: {}",
            self.name, self.number, self.address, self.symbol_type.0, self.length
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_read_consumes_length() {
        let mut a = Symbol::new("In.v_Vehicle", 1, 0xF0_0000, 2);
        let mut b = Symbol::new("Unknown.Value", 2, 0xF0_0010, 4);
        let mut buf = Bytes::from_static(&[0x01, 0x2C, 0x00, 0x00, 0x12, 0x34]);

        a.read(&mut buf).unwrap();
        b.read(&mut buf).unwrap();

        assert!((a.float64() - 30.0).abs() < 1e-9);
        assert_eq!(b.float64(), 4660.0);
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_short_read() {
        let mut s = Symbol::new("x", 1, 0, 4);
        let mut buf = Bytes::from_static(&[0x01, 0x02]);
        let err = s.read(&mut buf).unwrap_err();
        assert_eq!(
            err,
            DecodeError::ShortRead {
                name: "x".into(),
                wanted: 4,
                available: 2
            }
        );
    }

    #[test]
    fn test_signed_values() {
        let mut s = Symbol::new("x", 1, 0, 2).with_type(SymbolType::SIGNED);
        s.set_raw(vec![0xFF, 0xFE]);
        assert_eq!(s.float64(), -2.0);

        let mut c = Symbol::new("y", 1, 0, 1).with_type(SymbolType::SIGNED);
        c.set_raw(vec![0x80]);
        assert_eq!(c.float64(), -128.0);
    }

    #[test]
    fn test_array_views() {
        let mut s = Symbol::new("Map", 1, 0, 4);
        s.set_raw(vec![0x00, 0x01, 0xFF, 0xFF]);
        assert_eq!(s.u16s(), vec![1, 0xFFFF]);
        assert_eq!(s.i16s(), vec![1, -1]);
        assert_eq!(s.u32s(), vec![0x0001_FFFF]);
        assert_eq!(s.float64s(), vec![1.0, 65535.0]);
    }

    #[test]
    fn test_adc_channel() {
        let s = Symbol::new("ADC1", -1003, 0, 2);
        assert!(s.is_adc());
        assert_eq!(s.adc_channel(), Some(3));
        assert_eq!(Symbol::new("x", 4, 0, 2).adc_channel(), None);
    }
}
