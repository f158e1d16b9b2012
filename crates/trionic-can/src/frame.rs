//! CAN frame type and bridge pseudo-identifiers

use std::fmt;

use bytes::Bytes;

/// Bridge control traffic uses identifiers above the 29-bit range so they
/// can never collide with bus traffic.
pub const SYSTEM_MSG: u32 = 0x8000_0001;
/// Push-mode sample frames (`[timestamp:4LE][payload]`)
pub const SYSTEM_MSG_DATA_RESPONSE: u32 = 0x8000_0002;
/// Reply to a bridge RAM read (`'R'`)
pub const SYSTEM_MSG_DATA_REQUEST: u32 = 0x8000_0003;
/// Reply to a bridge RAM write (`'W'`)
pub const SYSTEM_MSG_WRITE_RESPONSE: u32 = 0x8000_0004;
/// Wideband reading forwarded by the bridge (LE f32 lambda)
pub const SYSTEM_MSG_WBL_READING: u32 = 0x8000_0005;
/// Bridge-side failure, first byte is the error code
pub const SYSTEM_MSG_ERROR: u32 = 0x8000_0006;

const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;
const MAX_STANDARD_ID: u32 = 0x7FF;

/// Delivery hint for adapters that care whether a reply is expected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameKind {
    #[default]
    Outgoing,
    ResponseRequired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    pub id: u32,
    pub data: Bytes,
    pub extended: bool,
    pub kind: FrameKind,
}

impl CanFrame {
    pub fn new(id: u32, data: impl Into<Bytes>) -> Self {
        Self {
            id,
            data: data.into(),
            extended: id > MAX_STANDARD_ID && id <= MAX_EXTENDED_ID,
            kind: FrameKind::Outgoing,
        }
    }

    pub fn response_required(id: u32, data: impl Into<Bytes>) -> Self {
        Self::new(id, data).with_kind(FrameKind::ResponseRequired)
    }

    pub fn with_kind(mut self, kind: FrameKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn extended(mut self) -> Self {
        self.extended = true;
        self
    }

    /// Data length code
    pub fn dlc(&self) -> u8 {
        self.data.len().min(u8::MAX as usize) as u8
    }

    pub fn is_system(&self) -> bool {
        self.id > MAX_EXTENDED_ID
    }

    pub fn expects_response(&self) -> bool {
        self.kind == FrameKind::ResponseRequired
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_system() {
            write!(f, "SYS{:X}", self.id & 0xFF)?;
        } else if self.extended {
            write!(f, "{:08X}", self.id)?;
        } else {
            write!(f, "{:03X}", self.id)?;
        }
        write!(f, " [{}]", self.dlc())?;
        for b in self.data.iter() {
            write!(f, " {:02X}", b)?;
        }
        Ok(())
    }
}
