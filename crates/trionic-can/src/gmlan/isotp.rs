//! ISO 15765-2 segmentation for GMLAN

use bytes::Bytes;

use crate::error::{ProtocolError, Result};

pub const SINGLE_FRAME: u8 = 0x00;
pub const FIRST_FRAME: u8 = 0x10;
pub const CONSECUTIVE_FRAME: u8 = 0x20;
pub const FLOW_CONTROL: u8 = 0x30;

/// Largest message a first frame can announce
pub const MAX_MESSAGE: usize = 0xFFF;

const PAD: u8 = 0x00;

/// Flow control status from the receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    ContinueToSend { block_size: u8, st_min: u8 },
    Wait,
    Overflow,
}

impl FlowStatus {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.first()? & 0xF0 != FLOW_CONTROL {
            return None;
        }
        match data[0] & 0x0F {
            0 => Some(FlowStatus::ContinueToSend {
                block_size: data.get(1).copied().unwrap_or(0),
                st_min: data.get(2).copied().unwrap_or(0),
            }),
            1 => Some(FlowStatus::Wait),
            _ => Some(FlowStatus::Overflow),
        }
    }
}

/// Separation time in milliseconds. Sub-millisecond codes round up to 1.
pub fn st_min_millis(st_min: u8) -> u64 {
    match st_min {
        0x00..=0x7F => st_min as u64,
        0xF1..=0xF9 => 1,
        _ => 127,
    }
}

/// `[0x30, block_size, st_min]` padded to 8 bytes
pub fn flow_control(block_size: u8, st_min: u8) -> Bytes {
    Bytes::from(vec![FLOW_CONTROL, block_size, st_min, PAD, PAD, PAD, PAD, PAD])
}

fn padded(mut frame: Vec<u8>) -> Bytes {
    frame.resize(8, PAD);
    Bytes::from(frame)
}

/// Cut `payload` into a single frame, or a first frame followed by
/// consecutive frames.
pub fn segment(payload: &[u8]) -> Result<Vec<Bytes>> {
    if payload.is_empty() || payload.len() > MAX_MESSAGE {
        return Err(ProtocolError::InvalidRequest(format!(
            "ISO-TP payload of {} bytes",
            payload.len()
        )));
    }
    if payload.len() <= 7 {
        let mut frame = vec![SINGLE_FRAME | payload.len() as u8];
        frame.extend_from_slice(payload);
        return Ok(vec![padded(frame)]);
    }

    let len = payload.len();
    let mut frames = Vec::with_capacity(1 + (len - 6).div_ceil(7));
    let mut first = vec![FIRST_FRAME | (len >> 8) as u8, len as u8];
    first.extend_from_slice(&payload[..6]);
    frames.push(Bytes::from(first));

    for (i, chunk) in payload[6..].chunks(7).enumerate() {
        let mut frame = vec![CONSECUTIVE_FRAME | ((i + 1) & 0x0F) as u8];
        frame.extend_from_slice(chunk);
        frames.push(padded(frame));
    }
    Ok(frames)
}

/// What the caller should do after feeding a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembly {
    /// Complete message
    Done(Vec<u8>),
    /// First frame accepted, send flow control now
    SendFlowControl,
    /// Keep reading
    More,
}

/// Receive-side state for one message
#[derive(Debug, Default)]
pub struct Reassembler {
    expected: usize,
    next_sn: u8,
    buf: Vec<u8>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &[u8]) -> Result<Reassembly> {
        let pci = *data
            .first()
            .ok_or_else(|| ProtocolError::unexpected("ISO-TP", "empty frame"))?;
        match pci & 0xF0 {
            SINGLE_FRAME => {
                let len = (pci & 0x0F) as usize;
                if len == 0 || data.len() < 1 + len {
                    return Err(ProtocolError::unexpected("ISO-TP", hex::encode_upper(data)));
                }
                Ok(Reassembly::Done(data[1..1 + len].to_vec()))
            }
            FIRST_FRAME => {
                if data.len() < 8 {
                    return Err(ProtocolError::unexpected("ISO-TP", hex::encode_upper(data)));
                }
                self.expected = ((pci & 0x0F) as usize) << 8 | data[1] as usize;
                self.buf = data[2..8].to_vec();
                self.next_sn = 1;
                Ok(Reassembly::SendFlowControl)
            }
            CONSECUTIVE_FRAME => {
                if self.expected == 0 {
                    return Err(ProtocolError::unexpected("ISO-TP", "consecutive frame without first frame"));
                }
                let sn = pci & 0x0F;
                if sn != self.next_sn {
                    let expected = self.next_sn;
                    *self = Self::default();
                    return Err(ProtocolError::unexpected(
                        "ISO-TP",
                        format!("sequence number {} where {} was due", sn, expected),
                    ));
                }
                self.next_sn = (self.next_sn + 1) & 0x0F;
                let take = (self.expected - self.buf.len()).min(data.len() - 1);
                self.buf.extend_from_slice(&data[1..1 + take]);
                if self.buf.len() >= self.expected {
                    self.expected = 0;
                    return Ok(Reassembly::Done(std::mem::take(&mut self.buf)));
                }
                Ok(Reassembly::More)
            }
            _ => Err(ProtocolError::unexpected("ISO-TP", hex::encode_upper(data))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_single_frame() {
        let frames = segment(&[0x3E, 0x80]).unwrap();
        assert_eq!(frames, vec![Bytes::from_static(&[0x02, 0x3E, 0x80, 0, 0, 0, 0, 0])]);
        let mut r = Reassembler::new();
        assert_eq!(r.feed(&frames[0]).unwrap(), Reassembly::Done(vec![0x3E, 0x80]));
    }

    #[test]
    fn test_first_and_consecutive() {
        let payload: Vec<u8> = (0..20).collect();
        let frames = segment(&payload).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[0][..2], &[0x10, 20]);
        assert_eq!(frames[1][0], 0x21);
        assert_eq!(frames[2][0], 0x22);

        let mut r = Reassembler::new();
        assert_eq!(r.feed(&frames[0]).unwrap(), Reassembly::SendFlowControl);
        assert_eq!(r.feed(&frames[1]).unwrap(), Reassembly::More);
        assert_eq!(r.feed(&frames[2]).unwrap(), Reassembly::Done(payload));
    }

    #[test]
    fn test_sequence_gap_rejected() {
        let payload: Vec<u8> = (0..30).collect();
        let frames = segment(&payload).unwrap();
        let mut r = Reassembler::new();
        r.feed(&frames[0]).unwrap();
        assert!(r.feed(&frames[2]).is_err());
    }

    #[test]
    fn test_flow_status() {
        assert_eq!(
            FlowStatus::parse(&[0x30, 0x00, 0x05]),
            Some(FlowStatus::ContinueToSend { block_size: 0, st_min: 5 })
        );
        assert_eq!(FlowStatus::parse(&[0x31]), Some(FlowStatus::Wait));
        assert_eq!(FlowStatus::parse(&[0x21]), None);
        assert_eq!(st_min_millis(0xF3), 1);
    }

    proptest! {
        #[test]
        fn segment_then_reassemble(payload in proptest::collection::vec(any::<u8>(), 1..=600)) {
            let frames = segment(&payload).unwrap();
            let mut r = Reassembler::new();
            let mut out = None;
            for f in &frames {
                if let Reassembly::Done(data) = r.feed(f).unwrap() {
                    out = Some(data);
                }
            }
            prop_assert_eq!(out, Some(payload));
        }
    }
}
