//! TLV trailer laid out backwards from the end of a flash image
//!
//! Each field is `[payload][id][length]` read from the end towards the
//! start. Payload bytes are stored reversed, so `data[0]` is the byte just
//! below the id.

use std::fmt;

use tracing::debug;

/// Scan window from the end of the image
const TRAILER_SCAN: usize = 0x1FF;

pub const CHASSIS_ID: u8 = 0x90;
pub const VEHICLE_ID: u8 = 0x91;
pub const IMMOBILIZER_ID: u8 = 0x92;
pub const HARDWARE_NR: u8 = 0x93;
pub const PART_NUMBER: u8 = 0x94;
pub const SOFTWARE_VERSION: u8 = 0x95;
pub const CAR_DESCRIPTION: u8 = 0x97;
pub const ENGINE_TYPE: u8 = 0x98;
pub const TEST_SERIAL: u8 = 0x99;
pub const DATE_MODIFIED: u8 = 0x9A;
pub const SYMBOL_TABLE: u8 = 0x9B;
pub const SRAM_OFFSET: u8 = 0x9C;
pub const CHECKSUM_F2: u8 = 0xF2;
pub const CHECKSUM_FB: u8 = 0xFB;
pub const BOTTOM_OF_FLASH: u8 = 0xFC;
pub const ROM_CHECKSUM_TYPE: u8 = 0xFD;
pub const FW_LENGTH: u8 = 0xFE;
pub const LAST_MODIFIED_BY: u8 = 0xFA;
pub const ROM_CHECKSUM_ERROR: u8 = 0xF9;

/// Order fields are written back in, from the end of the image
const WRITE_ORDER: [u8; 23] = [
    VEHICLE_ID,
    PART_NUMBER,
    SOFTWARE_VERSION,
    CAR_DESCRIPTION,
    DATE_MODIFIED,
    SRAM_OFFSET,
    SYMBOL_TABLE,
    CHECKSUM_F2,
    CHECKSUM_FB,
    BOTTOM_OF_FLASH,
    ROM_CHECKSUM_TYPE,
    FW_LENGTH,
    LAST_MODIFIED_BY,
    IMMOBILIZER_ID,
    HARDWARE_NR,
    0xF8,
    0xF7,
    0xF6,
    0xF5,
    CHASSIS_ID,
    TEST_SERIAL,
    ENGINE_TYPE,
    ROM_CHECKSUM_ERROR,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrailerField {
    pub id: u8,
    pub data: Vec<u8>,
}

impl TrailerField {
    pub fn new(id: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            data: data.into(),
        }
    }

    /// Text up to the first NUL
    pub fn as_string(&self) -> String {
        let end = self
            .data
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(self.data.len());
        String::from_utf8_lossy(&self.data[..end]).trim().to_string()
    }

    /// Integer written most-significant byte first in image order
    pub fn u32_le(&self) -> Option<u32> {
        let b = self.data.get(..4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Integer stored in reading order (checksum style fields)
    pub fn u32_be(&self) -> Option<u32> {
        let b = self.data.get(..4)?;
        Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u16_le(&self) -> Option<u16> {
        let b = self.data.get(..2)?;
        Some(u16::from_le_bytes([b[0], b[1]]))
    }
}

impl fmt::Display for TrailerField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.data.len() {
            4 => write!(f, "0x{:02X}> 0x{}", self.id, hex::encode_upper(&self.data)),
            _ => write!(f, "0x{:02X}> {}", self.id, self.as_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Trailer {
    fields: Vec<TrailerField>,
}

impl Trailer {
    /// Scan fields from the end of the image until a 0x00/0xFF length byte
    pub fn parse(image: &[u8]) -> Self {
        let mut fields = Vec::new();
        if image.len() < 2 {
            return Self { fields };
        }
        let floor = image.len().saturating_sub(TRAILER_SCAN);
        let mut addr = image.len() - 1;

        while addr > floor {
            let len = image[addr] as usize;
            if len == 0x00 || len == 0xFF || addr < len + 1 {
                break;
            }
            let id = image[addr - 1];
            let mut data = Vec::with_capacity(len);
            let mut p = addr - 2;
            for _ in 0..len {
                data.push(image[p]);
                p = p.saturating_sub(1);
            }
            fields.push(TrailerField { id, data });
            match addr.checked_sub(len + 2) {
                Some(next) => addr = next,
                None => break,
            }
        }

        debug!(fields = fields.len(), "Parsed firmware trailer");
        Self { fields }
    }

    pub fn fields(&self) -> &[TrailerField] {
        &self.fields
    }

    pub fn get(&self, id: u8) -> Option<&TrailerField> {
        self.fields.iter().find(|f| f.id == id)
    }

    pub fn get_string(&self, id: u8) -> Option<String> {
        self.get(id).map(TrailerField::as_string)
    }

    pub fn count(&self, id: u8) -> usize {
        self.fields.iter().filter(|f| f.id == id).count()
    }

    pub fn contains(&self, id: u8) -> bool {
        self.get(id).is_some()
    }

    /// Replace the first field with this id, or append it
    pub fn set(&mut self, id: u8, data: impl Into<Vec<u8>>) {
        let data = data.into();
        match self.fields.iter_mut().find(|f| f.id == id) {
            Some(field) => field.data = data,
            None => self.fields.push(TrailerField { id, data }),
        }
    }

    pub fn set_u32_be(&mut self, id: u8, value: u32) {
        self.set(id, value.to_be_bytes().to_vec());
    }

    /// Encoded size in bytes
    pub fn encoded_len(&self) -> usize {
        self.fields.iter().map(|f| f.data.len() + 2).sum()
    }

    /// Fill `image[wipe_from..]` with 0xFF and write fields back from the end.
    ///
    /// Known ids go first in their canonical order, unknown ids follow in
    /// the order they were parsed.
    pub fn write(&self, image: &mut [u8], wipe_from: usize) -> Result<(), crate::FirmwareError> {
        if wipe_from >= image.len() || image.len() - wipe_from < self.encoded_len() {
            return Err(crate::FirmwareError::OffsetOutOfRange(wipe_from));
        }
        image[wipe_from..].fill(0xFF);

        let mut ordered: Vec<&TrailerField> = Vec::with_capacity(self.fields.len());
        for id in WRITE_ORDER {
            ordered.extend(self.fields.iter().filter(|f| f.id == id));
        }
        ordered.extend(self.fields.iter().filter(|f| !WRITE_ORDER.contains(&f.id)));

        let mut pos = image.len() - 1;
        for field in ordered {
            let len = field.data.len();
            if len == 0 || len > 0xFE {
                continue;
            }
            image[pos] = len as u8;
            image[pos - 1] = field.id;
            for (i, b) in field.data.iter().enumerate() {
                image[pos - 2 - i] = *b;
            }
            pos -= len + 2;
        }
        Ok(())
    }
}
