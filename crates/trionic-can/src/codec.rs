//! txbridge serial-command framing
//!
//! Every command on the wire is `[cmd:1][len:1][data:len][checksum:1]`,
//! where the checksum is the sum of the data bytes modulo 256.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::CodecError;

/// Oldest bridge firmware this host speaks to
pub const MIN_BRIDGE_FIRMWARE: &str = "1.0.8";

/// Largest payload a single command can carry
pub const MAX_PAYLOAD: usize = u8::MAX as usize;

/// Host → bridge: transmit a CAN frame, `[id:4LE][data]`
pub const CMD_CAN_TX: u8 = b't';
/// Bridge → host: received CAN frame, `[id:4LE][data]`
pub const CMD_CAN_RX: u8 = b'c';
/// Bridge → host: push-mode sample
pub const CMD_PUSH_DATA: u8 = b'D';
/// RAM read (host request and bridge reply)
pub const CMD_READ_RAM: u8 = b'R';
/// RAM write (host request and bridge reply)
pub const CMD_WRITE_RAM: u8 = b'W';
/// Bridge → host: wideband reading
pub const CMD_WBL_READING: u8 = b'w';
/// Bridge → host: error report
pub const CMD_ERROR: u8 = b'e';
/// Firmware version query and reply
pub const CMD_VERSION: u8 = b'v';
/// Host → bridge: configure the push-mode symbol list
pub const CMD_SYMBOL_LIST: u8 = b'd';
/// Host → bridge: sample analogue input
pub const CMD_ADC: u8 = b'a';
/// Host → bridge: firmware update chunk
pub const CMD_OTA_CHUNK: u8 = b'U';
/// Host → bridge: finalize firmware update
pub const CMD_OTA_FINALIZE: u8 = b'F';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialCommand {
    pub command: u8,
    pub data: Bytes,
}

impl SerialCommand {
    pub fn new(command: u8, data: impl Into<Bytes>) -> Self {
        Self {
            command,
            data: data.into(),
        }
    }

    pub fn checksum(data: &[u8]) -> u8 {
        data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
    }

    pub fn encode(&self) -> Result<Bytes, CodecError> {
        if self.data.len() > MAX_PAYLOAD {
            return Err(CodecError::Overrun {
                len: self.data.len(),
                max: MAX_PAYLOAD,
            });
        }
        let mut buf = BytesMut::with_capacity(self.data.len() + 3);
        buf.put_u8(self.command);
        buf.put_u8(self.data.len() as u8);
        buf.put_slice(&self.data);
        buf.put_u8(Self::checksum(&self.data));
        Ok(buf.freeze())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Command,
    Length,
    Body,
}

/// Incremental decoder for a byte stream of serial commands
#[derive(Debug)]
pub struct CommandDecoder {
    state: State,
    command: u8,
    len: usize,
    max_payload: usize,
    body: BytesMut,
}

impl Default for CommandDecoder {
    fn default() -> Self {
        Self::new(MAX_PAYLOAD)
    }
}

impl CommandDecoder {
    pub fn new(max_payload: usize) -> Self {
        Self {
            state: State::Command,
            command: 0,
            len: 0,
            max_payload,
            body: BytesMut::new(),
        }
    }

    /// Feed one byte. Returns a command once its checksum byte arrives.
    /// On error the decoder resynchronises on the next byte.
    pub fn feed(&mut self, byte: u8) -> Result<Option<SerialCommand>, CodecError> {
        match self.state {
            State::Command => {
                self.command = byte;
                self.state = State::Length;
                Ok(None)
            }
            State::Length => {
                let len = byte as usize;
                if len > self.max_payload {
                    self.state = State::Command;
                    return Err(CodecError::Overrun {
                        len,
                        max: self.max_payload,
                    });
                }
                self.len = len;
                self.body = BytesMut::with_capacity(len);
                self.state = State::Body;
                Ok(None)
            }
            State::Body if self.body.len() < self.len => {
                self.body.put_u8(byte);
                Ok(None)
            }
            State::Body => {
                self.state = State::Command;
                let data = self.body.split().freeze();
                let computed = SerialCommand::checksum(&data);
                if computed != byte {
                    return Err(CodecError::Corrupt {
                        command: self.command as char,
                        expected: byte,
                        computed,
                    });
                }
                Ok(Some(SerialCommand::new(self.command, data)))
            }
        }
    }

    /// Feed a chunk, collecting every complete command and every error
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<Result<SerialCommand, CodecError>> {
        chunk
            .iter()
            .filter_map(|b| self.feed(*b).transpose())
            .collect()
    }
}

/// True when `version` (e.g. "1.0.9") is at least [`MIN_BRIDGE_FIRMWARE`]
pub fn bridge_version_ok(version: &str) -> bool {
    match (parse_version(version), parse_version(MIN_BRIDGE_FIRMWARE)) {
        (Some(have), Some(want)) => have >= want,
        _ => false,
    }
}

fn parse_version(s: &str) -> Option<(u32, u32, u32)> {
    let s = s.trim().trim_start_matches('v');
    let mut parts = s.split('.').map(|p| p.trim().parse::<u32>());
    let major = parts.next()?.ok()?;
    let minor = parts.next().unwrap_or(Ok(0)).ok()?;
    let patch = parts.next().unwrap_or(Ok(0)).ok()?;
    Some((major, minor, patch))
}
