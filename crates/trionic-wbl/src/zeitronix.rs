//! Zeitronix ZT-2 serial stream
//!
//! Fixed 14-byte packets, little-endian words:
//!
//! ```text
//!  0  1  2   3    4..6  6..8  8..10  10   11     12    13
//! 00 01 02  AFR   EGT   RPM   MAP    TPS  USER1  CFG1  CFG2
//! ```
//!
//! The AFR byte is λ × 100.

use std::fmt;

use crate::error::{Result, WblError};

pub const PRODUCT: &str = "Zeitronix ZT-2";

pub const BAUD_RATE: u32 = 9600;

pub const PACKET_LEN: usize = 14;

const HEADER: [u8; 3] = [0x00, 0x01, 0x02];

#[derive(Debug, Default)]
pub struct Zt2 {
    packet: [u8; PACKET_LEN],
    step: usize,
    lambda: f64,
    egt: u16,
    rpm: u16,
    map: u16,
}

impl Zt2 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    pub fn egt(&self) -> u16 {
        self.egt
    }

    pub fn rpm(&self) -> u16 {
        self.rpm
    }

    pub fn map(&self) -> u16 {
        self.map
    }

    pub(crate) fn set_lambda(&mut self, lambda: f64) {
        self.lambda = lambda;
    }

    /// Bytes off the serial line; packets may span calls
    pub fn feed(&mut self, data: &[u8]) {
        for &b in data {
            if self.step < HEADER.len() {
                if b == HEADER[self.step] {
                    self.packet[self.step] = b;
                    self.step += 1;
                } else {
                    self.step = usize::from(b == HEADER[0]);
                }
                continue;
            }
            self.packet[self.step] = b;
            self.step += 1;
            if self.step == PACKET_LEN {
                self.step = 0;
                let packet = self.packet;
                // header already matched, length is fixed
                let _ = self.decode(&packet);
            }
        }
    }

    /// One complete packet, as the txbridge relays it
    pub fn decode(&mut self, data: &[u8]) -> Result<()> {
        if data.len() < PACKET_LEN {
            return Err(WblError::DataTooShort {
                expected: PACKET_LEN,
                got: data.len(),
            });
        }
        if data[..3] != HEADER {
            return Err(WblError::InvalidPacket(format!("ZT-2 header {:02X?}", &data[..3])));
        }
        self.lambda = f64::from(data[3]) * 0.01;
        self.egt = u16::from_le_bytes([data[4], data[5]]);
        self.rpm = u16::from_le_bytes([data[6], data[7]]);
        self.map = u16::from_le_bytes([data[8], data[9]]);
        Ok(())
    }
}

impl fmt::Display for Zt2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Lambda: {:.3}, EGT: {}, RPM: {}, MAP: {}",
            self.lambda, self.egt, self.rpm, self.map
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // λ 0.98, EGT 850, 3000 rpm, MAP 1200
    const PACKET: [u8; PACKET_LEN] = [0x00, 0x01, 0x02, 98, 0x52, 0x03, 0xB8, 0x0B, 0xB0, 0x04, 0x40, 0x00, 0x00, 0x00];

    #[test]
    fn test_decode_packet() {
        let mut zt = Zt2::new();
        zt.decode(&PACKET).unwrap();
        assert!((zt.lambda() - 0.98).abs() < 1e-9);
        assert_eq!(zt.egt(), 850);
        assert_eq!(zt.rpm(), 3000);
        assert_eq!(zt.map(), 1200);
        assert_eq!(zt.to_string(), "Lambda: 0.980, EGT: 850, RPM: 3000, MAP: 1200");
    }

    #[test]
    fn test_stream_resyncs_and_spans_reads() {
        let mut zt = Zt2::new();
        // line noise, a false start, then a packet split over two reads
        zt.feed(&[0x55, 0x00, 0x07, 0x00, 0x00]);
        zt.feed(&PACKET[1..8]);
        assert_eq!(zt.lambda(), 0.0);
        zt.feed(&PACKET[8..]);
        assert!((zt.lambda() - 0.98).abs() < 1e-9);
        assert_eq!(zt.rpm(), 3000);
    }

    #[test]
    fn test_rejects_bad_packets() {
        let mut zt = Zt2::new();
        assert_eq!(
            zt.decode(&PACKET[..10]),
            Err(WblError::DataTooShort {
                expected: PACKET_LEN,
                got: 10
            })
        );
        let mut bad = PACKET;
        bad[2] = 0x03;
        assert!(matches!(zt.decode(&bad), Err(WblError::InvalidPacket(_))));
        assert_eq!(zt.lambda(), 0.0);
    }
}
