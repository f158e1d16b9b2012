//! T7 checksum engine
//!
//! Three values guard a T7 image:
//!
//! - **FW**: sum over up to sixteen regions listed by the boot code,
//!   stored at the address loaded by the `B0 B9` (cmp.l) instruction
//! - **F2**: xor-keyed word sum over the first `fw_length` bytes, stored in
//!   trailer field 0xF2 when the image has one
//! - **FB**: plain word sum over the first `fw_length` bytes, stored in
//!   trailer field 0xFB

use serde::Serialize;
use tracing::{debug, info};

use super::search::{be32, find_masked};
use super::t7::T7File;
use super::trailer;
use crate::error::FirmwareError;

const AREA_PATTERN: [u8; 24] = [
    0x48, 0xE7, 0x00, 0x3C, 0x24, 0x7C, 0x00, 0xF0, 0x00, 0x00, 0x26, 0x7C, 0x00, 0x00, 0x00, 0x00,
    0x28, 0x7C, 0x00, 0xF0, 0x00, 0x00, 0x2A, 0x7C,
];
const AREA_MASK: [bool; 24] = [
    true, true, true, true, true, true, true, true, false, false, true, true, true, false, false,
    false, true, true, true, true, false, false, true, true,
];

const MAX_AREAS: usize = 16;

/// Checksums only cover the image below this offset
const CHECKSUM_END: usize = 0x7FFFF;

/// Trailer is rebuilt from here to the end of the image
pub const TRAILER_START: usize = 0x7FE00;

const F2_KEYS: [u32; 8] = [
    0x8118_4224,
    0x2442_1881,
    0xC33C_6666,
    0x3CC3_C3C3,
    0x1188_2244,
    0x1824_1824,
    0x8421_1248,
    0x1234_5678,
];

/// A region contributing to the FW checksum
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChecksumArea {
    pub address: u32,
    pub length: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChecksumPair {
    pub stored: u32,
    pub computed: u32,
}

impl ChecksumPair {
    pub fn is_valid(&self) -> bool {
        self.stored == self.computed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChecksumReport {
    pub fw: ChecksumPair,
    /// Absent on images without an 0xF2 trailer field
    pub f2: Option<ChecksumPair>,
    pub fb: ChecksumPair,
    pub fw_length: u32,
    pub areas: Vec<ChecksumArea>,
}

impl ChecksumReport {
    pub fn is_valid(&self) -> bool {
        self.fw.is_valid() && self.fb.is_valid() && self.f2.map_or(true, |p| p.is_valid())
    }

    /// First mismatching checksum as a typed error
    pub fn mismatch(&self) -> Option<FirmwareError> {
        let pairs = [("FW", Some(self.fw)), ("F2", self.f2), ("FB", Some(self.fb))];
        pairs.into_iter().find_map(|(field, pair)| {
            pair.filter(|p| !p.is_valid())
                .map(|p| FirmwareError::ChecksumMismatch {
                    field,
                    stored: p.stored,
                    computed: p.computed,
                })
        })
    }
}

/// Where the FW checksum lives and what it covers
struct FwLayout {
    location: usize,
    areas: Vec<ChecksumArea>,
}

impl T7File {
    /// Stored and computed FW, F2 and FB checksums
    pub fn checksums(&self) -> Result<ChecksumReport, FirmwareError> {
        let layout = self.fw_layout()?;
        let stored_fw = be32(&self.data, layout.location)
            .ok_or(FirmwareError::OffsetOutOfRange(layout.location))?;
        let fw_length = self.fw_length()?;

        let f2 = match self.trailer.get(trailer::CHECKSUM_F2) {
            Some(field) => Some(ChecksumPair {
                stored: field.u32_be().unwrap_or_default(),
                computed: f2_checksum(&self.data, fw_length as usize),
            }),
            None => None,
        };
        let fb_stored = self
            .trailer
            .get(trailer::CHECKSUM_FB)
            .and_then(|f| f.u32_be())
            .ok_or(FirmwareError::TrailerFieldMissing(trailer::CHECKSUM_FB))?;

        Ok(ChecksumReport {
            fw: ChecksumPair {
                stored: stored_fw,
                computed: fw_checksum(&self.data, &layout.areas),
            },
            f2,
            fb: ChecksumPair {
                stored: fb_stored,
                computed: region_sum(&self.data, 0, fw_length as usize),
            },
            fw_length,
            areas: layout.areas,
        })
    }

    /// Fail with the first mismatching checksum
    pub fn verify(&self) -> Result<(), FirmwareError> {
        match self.checksums()?.mismatch() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Recompute every checksum and rebuild the trailer
    pub fn update_checksum(&mut self) -> Result<ChecksumReport, FirmwareError> {
        let layout = self.fw_layout()?;
        let fw = fw_checksum(&self.data, &layout.areas);
        self.data[layout.location..layout.location + 4].copy_from_slice(&fw.to_be_bytes());

        let fw_length = self.fw_length()? as usize;
        if self.trailer.contains(trailer::CHECKSUM_F2) {
            let f2 = f2_checksum(&self.data, fw_length);
            self.trailer.set_u32_be(trailer::CHECKSUM_F2, f2);
        }
        let fb = region_sum(&self.data, 0, fw_length);
        self.trailer.set_u32_be(trailer::CHECKSUM_FB, fb);

        self.trailer.write(&mut self.data, TRAILER_START)?;
        info!(
            fw = %format!("0x{:08X}", fw),
            fb = %format!("0x{:08X}", fb),
            "Updated T7 checksums"
        );
        self.checksums()
    }

    fn fw_length(&self) -> Result<u32, FirmwareError> {
        self.trailer
            .get(trailer::FW_LENGTH)
            .and_then(|f| f.u32_be())
            .ok_or(FirmwareError::TrailerFieldMissing(trailer::FW_LENGTH))
    }

    /// Decode the region table that follows the checksum routine prologue
    fn fw_layout(&self) -> Result<FwLayout, FirmwareError> {
        let data = &self.data;
        let start = find_masked(data, &AREA_PATTERN, &AREA_MASK, 0)
            .ok_or(FirmwareError::ChecksumAreaMissing)?;

        let mut areas = [ChecksumArea::default(); MAX_AREAS];
        let mut count = 0usize;
        let mut base: u32 = 0;
        let mut pos = start + 22;
        let limit = data.len().min(CHECKSUM_END);

        while pos + 6 <= limit {
            match (data[pos], data[pos + 1]) {
                (0x48, 0x6D) => {
                    // pea (d16, a5): base relative
                    let address = base.wrapping_add((data[pos + 2] as u32) << 8) | data[pos + 3] as u32;
                    if count < MAX_AREAS {
                        areas[count].address = address;
                    }
                    count += 1;
                    pos += 4;
                }
                (0x48, 0x78) => {
                    let length = i16::from_be_bytes([data[pos + 2], data[pos + 3]]);
                    if count < MAX_AREAS {
                        areas[count].length = length as i32 as u32;
                    }
                    pos += 4;
                }
                (0x48, 0x79) => {
                    let address = be32(data, pos + 2).unwrap_or_default();
                    if count < MAX_AREAS {
                        areas[count].address = address;
                    }
                    count += 1;
                    pos += 6;
                }
                (0x48, _) => pos += 2,
                (0x2A, 0x7C) => {
                    let value = be32(data, pos + 2).unwrap_or_default();
                    if value < 0xF0_0000 {
                        base = value;
                    }
                    pos += 6;
                }
                (0xB0, 0xB9) => {
                    let address = be32(data, pos + 2).unwrap_or_default();
                    let location = self.image_offset(address)?;
                    let areas = areas[..count.min(MAX_AREAS)].to_vec();
                    debug!(
                        routine = %format!("0x{:X}", start),
                        location = %format!("0x{:X}", location),
                        areas = areas.len(),
                        "Found FW checksum"
                    );
                    return Ok(FwLayout { location, areas });
                }
                _ => pos += 2,
            }
        }
        Err(FirmwareError::ChecksumAreaMissing)
    }

    /// Flash offset for an address that may be in RAM space
    fn image_offset(&self, address: u32) -> Result<usize, FirmwareError> {
        let offset = if address as usize >= self.data.len() {
            address.wrapping_sub(self.sram_offset) as usize
        } else {
            address as usize
        };
        if offset + 4 > self.data.len() {
            return Err(FirmwareError::OffsetOutOfRange(offset));
        }
        Ok(offset)
    }
}

/// Big-endian word sum plus a byte sum of the tail, bounded by the checksum window
pub(crate) fn region_sum(data: &[u8], start: usize, length: usize) -> u32 {
    let end = data.len().min(CHECKSUM_END);
    let mut sum: u32 = 0;
    let mut pos = start;
    let mut count = 0;

    while count < length >> 2 && pos < end {
        match be32(data, pos) {
            Some(word) => sum = sum.wrapping_add(word),
            None => break,
        }
        count += 1;
        pos += 4;
    }

    let mut tail: u8 = 0;
    count <<= 2;
    while count < length && pos < end {
        tail = tail.wrapping_add(data[pos]);
        count += 1;
        pos += 1;
    }
    sum.wrapping_add(tail as u32)
}

pub(crate) fn fw_checksum(data: &[u8], areas: &[ChecksumArea]) -> u32 {
    areas.iter().fold(0u32, |acc, area| {
        acc.wrapping_add(region_sum(data, area.address as usize, area.length as usize))
    })
}

pub(crate) fn f2_checksum(data: &[u8], length: usize) -> u32 {
    let mut sum: u32 = 0;
    let mut key = 1;
    let mut pos = 0;
    while pos < length && pos + 3 < data.len() {
        let word = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
        sum = sum.wrapping_add(word ^ F2_KEYS[key]);
        key = (key + 1) % F2_KEYS.len();
        pos += 4;
    }
    (sum ^ 0x4031_4081).wrapping_sub(0x7FEF_DFD0)
}
