//! Flash image decoding
//!
//! [`load_firmware`] detects the generation from the image size and hands
//! off to [`T7File`] or [`T8File`]. Both produce a [`SymbolCollection`]
//! with `raw` filled from the image wherever the symbol lives in flash, plus
//! a list of per-symbol [`DecodeError`]s for symbols that could not be
//! sliced out.

mod checksum;
pub mod lzhuf;
mod search;
mod t7;
mod t8;
pub mod trailer;
mod xml;

pub use checksum::{ChecksumArea, ChecksumPair, ChecksumReport};
pub use t7::{T7File, T7Layout, T7_LENGTH};
pub use t8::{T8File, T8_LENGTH, T8_RAM_END, T8_RAM_START};
pub use trailer::{Trailer, TrailerField};

use std::path::PathBuf;

use tracing::warn;

use crate::error::{DecodeError, FirmwareError};
use crate::symbol::{Symbol, SymbolCollection};
use crate::EcuKind;

/// Prefix of a Blowfish encrypted name table
pub const BLOWFISH_MAGIC: [u8; 8] = [0xF1, 0x1A, 0x06, 0x5B, 0xA2, 0x6B, 0xCC, 0x6F];

/// Name tables shorter than this are treated as absent
pub const MIN_NAME_TABLE: usize = 0x1000;

#[derive(Debug, Clone, Default)]
pub struct DecodeOptions {
    /// Directory holding `<software version>.xml` name tables
    pub xml_dir: Option<PathBuf>,
}

/// A decoded flash image of either generation
#[derive(Debug, Clone)]
pub enum Firmware {
    T7(T7File),
    T8(T8File),
}

impl Firmware {
    pub fn kind(&self) -> EcuKind {
        match self {
            Firmware::T7(_) => EcuKind::T7,
            Firmware::T8(_) => EcuKind::T8,
        }
    }

    pub fn symbols(&self) -> &SymbolCollection {
        match self {
            Firmware::T7(f) => f.symbols(),
            Firmware::T8(f) => f.symbols(),
        }
    }

    pub fn decode_errors(&self) -> &[DecodeError] {
        match self {
            Firmware::T7(f) => f.decode_errors(),
            Firmware::T8(f) => f.decode_errors(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            Firmware::T7(f) => f.bytes(),
            Firmware::T8(f) => f.bytes(),
        }
    }

    pub fn trailer(&self) -> Option<&Trailer> {
        match self {
            Firmware::T7(f) => Some(f.trailer()),
            Firmware::T8(_) => None,
        }
    }
}

/// Decode a flash image, picking the generation from its size
pub fn load_firmware(data: Vec<u8>, opts: &DecodeOptions) -> Result<Firmware, FirmwareError> {
    match data.len() {
        T7_LENGTH => Ok(Firmware::T7(T7File::from_bytes(data, opts)?)),
        T8_LENGTH => Ok(Firmware::T8(T8File::with_options(data, opts)?)),
        other => Err(FirmwareError::InvalidLength(other)),
    }
}

/// Expand a compressed name table into one name per address table entry
pub fn expand_symbol_names(table: &[u8]) -> Result<Vec<String>, FirmwareError> {
    if table.len() < MIN_NAME_TABLE {
        return Err(FirmwareError::SymbolTableMissing(format!(
            "name table is only 0x{:X} bytes",
            table.len()
        )));
    }
    if table.starts_with(&BLOWFISH_MAGIC) {
        return Err(FirmwareError::SymbolTableEncrypted);
    }
    let expanded = lzhuf::decode(table)?;
    let text = String::from_utf8_lossy(&expanded);
    let text = text.strip_suffix("\r\n").unwrap_or(&text);
    Ok(text.split("\r\n").map(|s| s.trim().to_string()).collect())
}

/// Copy each symbol's bytes out of the image.
///
/// Addresses at or past the end of the image are RAM addresses and are
/// shifted down by `sram_offset` first. Symbols that still fall outside the
/// image keep an empty `raw` and produce a [`DecodeError`].
pub(crate) fn fill_raw(symbols: &mut [Symbol], image: &[u8], sram_offset: u32) -> Vec<DecodeError> {
    let mut errors = Vec::new();
    for sym in symbols.iter_mut() {
        if sym.length == 0 {
            continue;
        }
        let offset = if sym.address as usize >= image.len() {
            sym.sram_offset = sram_offset;
            sym.address.checked_sub(sram_offset)
        } else {
            Some(sym.address)
        };

        let slice = offset.and_then(|o| {
            let start = o as usize;
            image.get(start..start + sym.length as usize)
        });
        match slice {
            Some(bytes) => sym.set_raw(bytes),
            None => {
                let err = DecodeError::OutOfBounds {
                    name: sym.name.clone(),
                    offset: offset.map_or(sym.address as u64, u64::from),
                    length: sym.length,
                    image_len: image.len(),
                };
                warn!(%err, "Symbol outside image");
                errors.push(err);
            }
        }
    }
    errors
}
