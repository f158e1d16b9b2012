//! Trionic 8 flash images (1 MiB)

use tracing::{debug, info};

use super::search::{be16, be32, find};
use super::{expand_symbol_names, DecodeOptions};
use crate::error::{DecodeError, FirmwareError};
use crate::symbol::{Symbol, SymbolCollection};

pub const T8_LENGTH: usize = 0x100000;

/// RAM window whose initial contents are mirrored in flash
pub const T8_RAM_START: u32 = 0x100000;
pub const T8_RAM_END: u32 = 0x108000;

/// Data below this offset belongs to the boot loader
const DATA_START: u32 = 0x20000;

const END_MARKER: &[u8; 11] = b"sYMBOLtABLE";
const NQ: [u8; 2] = [0x4E, 0x71];
const NQ_WINDOW: usize = 0x100;
const ENTRY: usize = 10;

/// A decoded T8 image
#[derive(Debug, Clone)]
pub struct T8File {
    data: Vec<u8>,
    ram_offset: u32,
    symbols: SymbolCollection,
    decode_errors: Vec<DecodeError>,
}

impl T8File {
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, FirmwareError> {
        Self::with_options(data, &DecodeOptions::default())
    }

    /// T8 images always carry their own name table, so options are unused today
    pub fn with_options(data: Vec<u8>, _opts: &DecodeOptions) -> Result<Self, FirmwareError> {
        if data.len() != T8_LENGTH {
            return Err(FirmwareError::InvalidLength(data.len()));
        }
        if !(data[0] == 0x00 && matches!(data[1], 0x00 | 0x10) && data[2] == 0x0C && data[3] == 0x00) {
            return Err(FirmwareError::NotTrionic8);
        }

        let end = find(&data, END_MARKER, 0)
            .map(|p| p + END_MARKER.len() - 1)
            .ok_or_else(|| FirmwareError::SymbolTableMissing("end of symbol table not found".into()))?;
        let nq = first_nq_marker(&data, end)
            .ok_or_else(|| FirmwareError::AddressTableMissing("no NqNqNq marker after symbol table".into()))?;

        let name_offset = be32(&data, nq).ok_or(FirmwareError::OffsetOutOfRange(nq))? as usize;
        let name_len = be16(&data, nq + 4).ok_or(FirmwareError::OffsetOutOfRange(nq + 4))? as usize;
        let table = data
            .get(name_offset..name_offset + name_len)
            .ok_or(FirmwareError::OffsetOutOfRange(name_offset))?;
        let names = expand_symbol_names(table)?;

        let nq_count = count_nq_back(&data, nq);
        let ram_offset = nq
            .checked_sub(nq_count * 2 + 6)
            .and_then(|p| be32(&data, p))
            .ok_or(FirmwareError::OffsetOutOfRange(nq))?;
        debug!(
            end = %format!("0x{:X}", end),
            nq = %format!("0x{:X}", nq),
            name_offset = %format!("0x{:X}", name_offset),
            ram_offset = %format!("0x{:X}", ram_offset),
            "Located T8 symbol table"
        );

        let mut file = Self {
            data,
            ram_offset,
            symbols: SymbolCollection::default(),
            decode_errors: Vec::new(),
        };
        let mut symbols = file.read_address_table(nq + 11);
        for (i, sym) in symbols.iter_mut().enumerate() {
            if let Some(name) = names.get(i + 1) {
                sym.set_name(name.clone());
            }
        }
        file.decode_errors = file.fill_raw(&mut symbols);
        info!(count = symbols.len(), errors = file.decode_errors.len(), "Loaded T8 symbols");
        file.symbols = SymbolCollection::new(symbols);
        Ok(file)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn symbols(&self) -> &SymbolCollection {
        &self.symbols
    }

    pub fn decode_errors(&self) -> &[DecodeError] {
        &self.decode_errors
    }

    /// Offset subtracted from RAM addresses to reach their flash mirror
    pub fn ram_offset(&self) -> u32 {
        self.ram_offset
    }

    /// Flash offset for a RAM address inside the mirrored window.
    /// The window bound is exact; anything past it is rejected.
    pub fn relocate(&self, address: u32, length: u16) -> Result<u32, FirmwareError> {
        let out_of_range = FirmwareError::AddressOutOfRange { address, length };
        let end = address.checked_add(length as u32).ok_or(out_of_range.clone())?;
        if address < T8_RAM_START || end > T8_RAM_END || address < self.ram_offset {
            return Err(out_of_range);
        }
        let actual = address - self.ram_offset;
        if actual == 0 || actual as usize + length as usize > self.data.len() {
            return Err(out_of_range);
        }
        Ok(actual)
    }

    /// Initial contents of a RAM region, read from its flash mirror
    pub fn read_ram(&self, address: u32, length: u16) -> Result<&[u8], FirmwareError> {
        let start = self.relocate(address, length)? as usize;
        Ok(&self.data[start..start + length as usize])
    }

    fn read_address_table(&self, start: usize) -> Vec<Symbol> {
        let mut symbols = Vec::new();
        let mut pos = start;
        while let Some(entry) = self.data.get(pos..pos + ENTRY) {
            if entry[9] != 0x00 {
                break;
            }
            let number = symbols.len() as i32 + 1;
            let address = u32::from_be_bytes([0, entry[0], entry[1], entry[2]]);
            let length = u16::from_be_bytes([entry[3], entry[4]]);
            let mut sym = Symbol::new(format!("Symbol-{}", number), number, address, length).with_type(entry[7]);
            sym.mask = u16::from_be_bytes([entry[5], entry[6]]);
            sym.extended_type = entry[8];
            symbols.push(sym);
            pos += ENTRY;
        }
        symbols
    }

    /// Const RAM symbols read from their flash mirror; plain RAM variables
    /// have no initial contents and stay empty.
    fn fill_raw(&self, symbols: &mut [Symbol]) -> Vec<DecodeError> {
        let mut errors = Vec::new();
        for sym in symbols.iter_mut() {
            let kind = sym.symbol_type.0;
            let offset = if sym.address >= T8_RAM_START {
                if kind == 0xFF || kind & 0x22 != 0x02 {
                    continue;
                }
                match self.relocate(sym.address, sym.length) {
                    Ok(actual) => {
                        sym.sram_offset = self.ram_offset;
                        actual
                    }
                    Err(_) => continue,
                }
            } else {
                sym.address
            };

            if offset < DATA_START || sym.length == 0 {
                continue;
            }
            let start = offset as usize;
            match self.data.get(start..start + sym.length as usize) {
                Some(bytes) => sym.set_raw(bytes),
                None => errors.push(DecodeError::OutOfBounds {
                    name: sym.name.clone(),
                    offset: offset as u64,
                    length: sym.length,
                    image_len: self.data.len(),
                }),
            }
        }
        errors
    }
}

/// Offset just past the first `NqNqNq` run within the window after `from`,
/// falling back to a shorter run
fn first_nq_marker(data: &[u8], from: usize) -> Option<usize> {
    let window_end = (from + NQ_WINDOW).min(data.len());
    let window = data.get(from..window_end)?;
    (1..=3).rev().find_map(|pairs| {
        let run: Vec<u8> = NQ.repeat(pairs);
        find(window, &run, 0).map(|p| from + p + run.len())
    })
}

/// Number of `Nq` pairs immediately before `nq`, at most three
fn count_nq_back(data: &[u8], nq: usize) -> usize {
    (1..=3)
        .take_while(|i| {
            nq.checked_sub(i * 2)
                .and_then(|p| data.get(p..p + 2))
                .is_some_and(|pair| pair == NQ)
        })
        .count()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::firmware::lzhuf;
    use pretty_assertions::assert_eq;

    pub(crate) const RAM_OFFSET: u32 = 0x0E_0000;

    /// A T8 image; `entries` are (address, length, type) and get numbers from 1
    pub(crate) fn t8_image(names: &[&str], entries: &[(u32, u16, u8)]) -> Vec<u8> {
        let mut image = vec![0u8; T8_LENGTH];
        image[..4].copy_from_slice(&[0x00, 0x10, 0x0C, 0x00]);

        let mut text = String::from("Header\r\n");
        for name in names {
            text.push_str(name);
            text.push_str("\r\n");
        }
        let mut packed = lzhuf::encode(text.as_bytes());
        packed.resize(0x1100, 0);
        let names_at = 0x40000;
        image[names_at..names_at + packed.len()].copy_from_slice(&packed);

        let marker = 0x30000;
        image[marker..marker + END_MARKER.len()].copy_from_slice(END_MARKER);
        let p = marker + 0x20;
        image[p..p + 4].copy_from_slice(&RAM_OFFSET.to_be_bytes());
        for i in 0..3 {
            image[p + 6 + i * 2..p + 8 + i * 2].copy_from_slice(&NQ);
        }
        let nq = p + 12;
        image[nq..nq + 4].copy_from_slice(&(names_at as u32).to_be_bytes());
        image[nq + 4..nq + 6].copy_from_slice(&(packed.len() as u16).to_be_bytes());

        let mut pos = nq + 11;
        for (address, length, kind) in entries {
            image[pos..pos + 3].copy_from_slice(&address.to_be_bytes()[1..]);
            image[pos + 3..pos + 5].copy_from_slice(&length.to_be_bytes());
            image[pos + 7] = *kind;
            pos += ENTRY;
        }
        image[pos + 9] = 0x01;
        image
    }

    #[test]
    fn test_rejects_wrong_prefix() {
        let image = vec![0xFFu8; T8_LENGTH];
        assert_eq!(T8File::from_bytes(image).unwrap_err(), FirmwareError::NotTrionic8);
    }

    #[test]
    fn test_symbols_and_relocation() {
        let mut image = t8_image(
            &["AirCtrlCal.RegMap", "ActualIn.n_Engine", "IgnAbsCal.fi_NormalMAP"],
            &[(0x05_0000, 4, 0x02), (0x10_0100, 2, 0x00), (0x10_0200, 2, 0x02)],
        );
        image[0x05_0000..0x05_0004].copy_from_slice(&[9, 8, 7, 6]);
        let mirrored = (0x10_0200 - RAM_OFFSET) as usize;
        image[mirrored..mirrored + 2].copy_from_slice(&[0x12, 0x34]);

        let file = T8File::from_bytes(image).unwrap();
        assert_eq!(file.ram_offset(), RAM_OFFSET);
        assert_eq!(file.symbols().len(), 3);

        let map = file.symbols().get_by_name("AirCtrlCal.RegMap").unwrap();
        assert_eq!(map.number, 1);
        assert_eq!(map.raw(), &[9, 8, 7, 6]);

        // plain RAM variable: no flash mirror
        let rpm = file.symbols().get_by_name("ActualIn.n_Engine").unwrap();
        assert!(!rpm.has_data());

        let ign = file.symbols().get_by_name("IgnAbsCal.fi_NormalMAP").unwrap();
        assert_eq!(ign.address, 0x10_0200);
        assert_eq!(ign.sram_offset, RAM_OFFSET);
        assert_eq!(ign.raw(), &[0x12, 0x34]);
    }

    #[test]
    fn test_ram_window_is_exact() {
        let file = T8File::from_bytes(t8_image(&["a"], &[(0x05_0000, 2, 0)])).unwrap();
        assert!(file.relocate(T8_RAM_END - 4, 4).is_ok());
        assert_eq!(
            file.relocate(T8_RAM_END - 4, 5).unwrap_err(),
            FirmwareError::AddressOutOfRange {
                address: T8_RAM_END - 4,
                length: 5
            }
        );
        assert!(file.read_ram(0x0F_FFFF, 1).is_err());
    }

    #[test]
    fn test_count_nq_back() {
        let data = [0x00, 0x4E, 0x71, 0x4E, 0x71, 0xAA];
        assert_eq!(count_nq_back(&data, 5), 2);
        assert_eq!(count_nq_back(&data, 1), 0);
    }
}
