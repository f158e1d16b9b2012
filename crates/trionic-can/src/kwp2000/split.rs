//! Trionic multi-frame encoding
//!
//! A KWP message longer than one frame travels as a chain of 8-byte CAN
//! frames. Byte 0 of every frame is a flag byte:
//!
//! | bits  | meaning                                       |
//! |-------|-----------------------------------------------|
//! | 0x40  | first frame of the chain                      |
//! | 0x80  | sender wants a confirmation for this frame    |
//! | 0x3F  | number of frames still to come                |
//!
//! Byte 1 is 0xA1 from the tester and 0xBF from the ECU.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{CanFrame, FrameKind};

pub(crate) const CHUNK: usize = 6;
pub(crate) const TESTER_MARK: u8 = 0xA1;
pub(crate) const ECU_MARK: u8 = 0xBF;

pub(crate) const FIRST: u8 = 0x40;
pub(crate) const CONFIRM: u8 = 0x80;
pub(crate) const REMAINING: u8 = 0x3F;

fn chunk_count(len: usize) -> usize {
    len.div_ceil(CHUNK)
}

/// Split `payload` into tester frames on `id`.
///
/// Every frame except the last asks for a confirmation. The last frame is
/// `ResponseRequired` when `response_required` is set, else `Outgoing`.
pub fn split_request(id: u32, payload: &[u8], response_required: bool) -> Vec<CanFrame> {
    let count = chunk_count(payload.len());
    payload
        .chunks(CHUNK)
        .enumerate()
        .map(|(i, chunk)| {
            let mut flag = 0;
            if i == 0 {
                flag |= FIRST;
            }
            if i != count - 1 {
                flag |= CONFIRM;
            }
            let mut data = BytesMut::with_capacity(2 + chunk.len());
            data.put_u8(flag | ((count - i - 1) as u8 & REMAINING));
            data.put_u8(TESTER_MARK);
            data.put_slice(chunk);
            let kind = if flag & CONFIRM != 0 || response_required {
                FrameKind::ResponseRequired
            } else {
                FrameKind::Outgoing
            };
            CanFrame::new(id, data.freeze()).with_kind(kind)
        })
        .collect()
}

/// Variant used by the flash loader: no confirmation bit, intermediate
/// frames are `Outgoing` and only the last one expects a reply.
pub fn split_request2(id: u32, payload: &[u8]) -> Vec<CanFrame> {
    let count = chunk_count(payload.len());
    payload
        .chunks(CHUNK)
        .enumerate()
        .map(|(i, chunk)| {
            let flag = if i == 0 { FIRST } else { 0 };
            let mut data = BytesMut::with_capacity(2 + chunk.len());
            data.put_u8(flag | ((count - i - 1) as u8 & REMAINING));
            data.put_u8(TESTER_MARK);
            data.put_slice(chunk);
            let kind = if i == count - 1 {
                FrameKind::ResponseRequired
            } else {
                FrameKind::Outgoing
            };
            CanFrame::new(id, data.freeze()).with_kind(kind)
        })
        .collect()
}

/// Encode `message` the way the ECU answers: `[len][message]` cut into
/// 6-byte chunks behind `{flags, 0xBF}`, each frame padded to 8 bytes.
/// The last frame carries 0x80.
pub fn split_response(message: &[u8]) -> Vec<Bytes> {
    let mut stream = Vec::with_capacity(message.len() + 1);
    stream.push(message.len() as u8);
    stream.extend_from_slice(message);

    let count = chunk_count(stream.len());
    stream
        .chunks(CHUNK)
        .enumerate()
        .map(|(i, chunk)| {
            let mut flag = (count - i - 1) as u8 & REMAINING;
            if i == 0 {
                flag |= FIRST;
            }
            if i == count - 1 {
                flag |= CONFIRM;
            }
            let mut data = BytesMut::with_capacity(8);
            data.put_u8(flag);
            data.put_u8(ECU_MARK);
            data.put_slice(chunk);
            data.resize(8, 0);
            data.freeze()
        })
        .collect()
}

/// Frames still to come after `flag`
pub fn remaining(flag: u8) -> u8 {
    flag & REMAINING
}

/// True for the final frame of an ECU chain
pub fn is_last(flag: u8) -> bool {
    flag == 0x80 || flag == 0xC0
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_split_ddli_define() {
        // F0 03 00 00 80 01 2C behind {len, 0x2C}
        let message = [0x08, 0x2C, 0xF0, 0x03, 0x00, 0x00, 0x80, 0x01, 0x2C];
        let frames = split_request(0x242, &message, false);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data.as_ref(), &[0xC1, 0xA1, 0x08, 0x2C, 0xF0, 0x03, 0x00, 0x00]);
        assert_eq!(frames[0].kind, FrameKind::ResponseRequired);
        assert_eq!(frames[1].data.as_ref(), &[0x00, 0xA1, 0x80, 0x01, 0x2C]);
        assert_eq!(frames[1].kind, FrameKind::Outgoing);
    }

    #[test]
    fn test_split_request2_has_no_confirm_bit() {
        let message = [0x08, 0x34, 0x00, 0x00, 0x00, 0x00, 0x07, 0xFF, 0xFF];
        let frames = split_request2(0x242, &message);
        assert_eq!(frames[0].data[0], 0x41);
        assert_eq!(frames[0].kind, FrameKind::Outgoing);
        assert_eq!(frames[1].data[0], 0x00);
        assert_eq!(frames[1].kind, FrameKind::ResponseRequired);
    }

    #[test]
    fn test_single_frame_response() {
        let frames = split_response(&[0x7E]);
        assert_eq!(frames, vec![Bytes::from_static(&[0xC0, 0xBF, 0x01, 0x7E, 0, 0, 0, 0])]);
        assert!(is_last(frames[0][0]));
    }

    #[test]
    fn test_chained_response_flags() {
        let frames = split_response(&[0x61, 0xF0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0][0], 0x41);
        assert_eq!(remaining(frames[0][0]), 1);
        assert_eq!(frames[1][0], 0x80);
        assert_eq!(&frames[1][2..5], &[4, 5, 6]);
    }

    fn reassemble(frames: &[CanFrame]) -> Vec<u8> {
        frames.iter().flat_map(|f| f.data[2..].to_vec()).collect()
    }

    proptest! {
        #[test]
        fn split_then_reassemble_is_identity(payload in proptest::collection::vec(any::<u8>(), 1..=4096)) {
            let frames = split_request(0x242, &payload, true);
            prop_assert_eq!(reassemble(&frames), payload.clone());
            prop_assert_eq!(frames[0].data[0] & FIRST, FIRST);
            let last = frames.last().unwrap();
            prop_assert_eq!(last.data[0] & CONFIRM, 0);
            prop_assert!(last.expects_response());

            let frames = split_request2(0x242, &payload);
            prop_assert_eq!(reassemble(&frames), payload);
        }
    }
}
