//! Innovate Serial Protocol v2 (LC-1, LC-2, MTX-L)
//!
//! Packets are 16-bit words. The header word carries `0xA280` in its fixed
//! bits plus the number of words that follow; the first two words after the
//! header are the lambda status and the lambda value.

use serde::Serialize;
use tracing::warn;

pub const PRODUCT: &str = "Innovate Serial Protocol v2";

/// Serial line rate for a directly attached controller
pub const BAUD_RATE: u32 = 19_200;

const HEADER_BITS: u16 = 0xA280;
const LAMBDA_OFFSET: u16 = 500;
const LAMBDA_DIVISOR: f64 = 1000.0;
/// Longer packets are a desync
const MAX_WORDS: usize = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum LambdaStatus {
    #[default]
    Normal,
    /// Lambda word holds O₂ in 1/10 %
    O2,
    Calibrating,
    NeedCalibration,
    WarmingUp,
    HeaterCalibrating,
    Error,
    Reserved,
}

impl LambdaStatus {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            0 => LambdaStatus::Normal,
            1 => LambdaStatus::O2,
            2 => LambdaStatus::Calibrating,
            3 => LambdaStatus::NeedCalibration,
            4 => LambdaStatus::WarmingUp,
            5 => LambdaStatus::HeaterCalibrating,
            6 => LambdaStatus::Error,
            _ => LambdaStatus::Reserved,
        }
    }

    /// Placeholder lambda reported while the value is not a real reading
    fn sentinel(&self) -> Option<f64> {
        match self {
            LambdaStatus::Normal => None,
            LambdaStatus::O2 => Some(1.5),
            LambdaStatus::Calibrating => Some(0.502),
            LambdaStatus::NeedCalibration => Some(0.503),
            LambdaStatus::WarmingUp => Some(0.504),
            LambdaStatus::HeaterCalibrating => Some(0.505),
            LambdaStatus::Error => Some(0.506),
            LambdaStatus::Reserved => Some(0.507),
        }
    }
}

/// Streaming ISP2 decoder
#[derive(Debug, Default)]
pub struct Isp2 {
    sync: Vec<u8>,
    status: Option<LambdaStatus>,
    lambda: f64,
    afr_multiplier: f64,
    afr: f64,
}

impl Isp2 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lambda, or the sentinel for the current status. 0.666 before the
    /// first packet.
    pub fn lambda(&self) -> f64 {
        match self.status {
            Some(status) => status.sentinel().unwrap_or(self.lambda),
            None => 0.666,
        }
    }

    pub fn status(&self) -> Option<LambdaStatus> {
        self.status
    }

    pub fn afr(&self) -> f64 {
        self.afr
    }

    pub fn afr_multiplier(&self) -> f64 {
        self.afr_multiplier
    }

    pub(crate) fn set_lambda(&mut self, lambda: f64) {
        self.status = Some(LambdaStatus::Normal);
        self.lambda = lambda;
    }

    /// Append received bytes and decode every complete packet
    pub fn feed(&mut self, data: &[u8]) {
        self.sync.extend_from_slice(data);

        while self.sync.len() >= 2 {
            let header = u16::from_be_bytes([self.sync[0], self.sync[1]]);
            if header & HEADER_BITS != HEADER_BITS {
                self.sync.remove(0);
                continue;
            }
            if self.sync.len() < 6 {
                return;
            }
            let words = (usize::from(self.sync[0] & 0x01) << 7) | usize::from(self.sync[1] & 0x7F);
            if words > MAX_WORDS {
                warn!(words, "ISP2 invalid word length");
                self.sync.remove(0);
                continue;
            }
            let total = words * 2 + 2;
            if self.sync.len() < total {
                return;
            }
            let packet: Vec<u8> = self.sync.drain(..total).collect();
            self.process(&packet);
        }
    }

    fn process(&mut self, packet: &[u8]) {
        for (index, word) in packet.chunks_exact(2).enumerate() {
            match index {
                1 => {
                    self.status = Some(LambdaStatus::from_bits(word[0] >> 2));
                    self.afr_multiplier =
                        f64::from((u16::from(word[0] & 0x01) << 7) | u16::from(word[1] & 0x7F)) * 0.1;
                }
                2 => {
                    let raw = (u16::from(word[0]) << 7)
                        .wrapping_add(u16::from(word[1]))
                        .wrapping_add(LAMBDA_OFFSET);
                    self.lambda = (f64::from(raw) / LAMBDA_DIVISOR).clamp(0.5, 1.5);
                    self.afr = self.lambda * self.afr_multiplier;
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    // header A2 82 (2 words), status 0x43 0x13 (normal, AFR 14.7), lambda
    fn packet(status_hi: u8, lambda: [u8; 2]) -> Vec<u8> {
        vec![0xA2, 0x82, status_hi, 0x13, lambda[0], lambda[1]]
    }

    #[test]
    fn test_normal_reading() {
        let mut isp2 = Isp2::new();
        assert_eq!(isp2.lambda(), 0.666);
        // (3 << 7) + 116 + 500 = 1000
        isp2.feed(&packet(0x43, [0x03, 0x74]));
        assert_eq!(isp2.status(), Some(LambdaStatus::Normal));
        assert_eq!(isp2.lambda(), 1.0);
        assert!((isp2.afr_multiplier() - 14.7).abs() < 1e-9);
        assert!((isp2.afr() - 14.7).abs() < 1e-9);
    }

    #[rstest]
    #[case(0x04, 1.5)]
    #[case(0x08, 0.502)]
    #[case(0x0C, 0.503)]
    #[case(0x10, 0.504)]
    #[case(0x14, 0.505)]
    #[case(0x18, 0.506)]
    #[case(0x1C, 0.507)]
    fn test_status_sentinels(#[case] status_hi: u8, #[case] expected: f64) {
        let mut isp2 = Isp2::new();
        isp2.feed(&packet(status_hi, [0x03, 0x74]));
        assert_eq!(isp2.lambda(), expected);
    }

    #[test]
    fn test_resync_and_split_delivery() {
        let mut isp2 = Isp2::new();
        let mut stream = vec![0x00, 0x13, 0x55];
        // (2 << 7) + 0x58 + 500 = 844
        stream.extend(packet(0x43, [0x02, 0x58]));
        let (a, b) = stream.split_at(5);
        isp2.feed(a);
        assert_eq!(isp2.status(), None);
        isp2.feed(b);
        assert_eq!(isp2.lambda(), 0.844);
    }

    #[test]
    fn test_lambda_is_clamped() {
        let mut isp2 = Isp2::new();
        isp2.feed(&packet(0x43, [0x7F, 0x7F]));
        assert_eq!(isp2.lambda(), 1.5);
        isp2.feed(&packet(0x43, [0x00, 0x00]));
        assert_eq!(isp2.lambda(), 0.5);
    }
}
