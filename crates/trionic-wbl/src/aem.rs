//! AEM X-Series UEGO
//!
//! The gauge prints AFR-scaled readings as ASCII lines on its serial port,
//! or broadcasts an extended CAN frame on 0x180.

use tracing::debug;

use crate::error::{Result, WblError};

pub const PRODUCT: &str = "AEM Uego";

pub const CAN_ID: u32 = 0x180;
pub const BAUD_RATE: u32 = 9600;

const LINE_MAX: usize = 8;

#[derive(Debug, Default)]
pub struct AemUego {
    lambda: f64,
    /// %
    oxygen: f64,
    /// V
    voltage: f64,
    line: Vec<u8>,
}

impl AemUego {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    pub fn oxygen(&self) -> f64 {
        self.oxygen
    }

    pub fn voltage(&self) -> f64 {
        self.voltage
    }

    pub(crate) fn set_lambda(&mut self, lambda: f64) {
        self.lambda = lambda;
    }

    /// Serial stream: `value\r\n` lines, λ = value / 10
    pub fn feed(&mut self, data: &[u8]) {
        for &b in data {
            match b {
                b'\r' => {}
                b'\n' => {
                    let text = String::from_utf8_lossy(&self.line);
                    match text.trim().parse::<f64>() {
                        Ok(value) => self.lambda = value / 10.0,
                        Err(e) => debug!(line = %text, %e, "AEM: unparsable line"),
                    }
                    self.line.clear();
                }
                _ => {
                    if self.line.len() == LINE_MAX {
                        self.line.clear();
                    }
                    self.line.push(b);
                }
            }
        }
    }

    /// CAN frame on 0x180: lambda BE16 × 0.0001, oxygen BE16 × 0.001 %,
    /// system volts × 0.1
    pub fn decode_can(&mut self, data: &[u8]) -> Result<()> {
        if data.len() < 5 {
            return Err(WblError::DataTooShort {
                expected: 5,
                got: data.len(),
            });
        }
        self.lambda = f64::from(u16::from_be_bytes([data[0], data[1]])) * 0.0001;
        self.oxygen = f64::from(i16::from_be_bytes([data[2], data[3]])) * 0.001;
        self.voltage = f64::from(data[4]) * 0.1;
        Ok(())
    }
}
