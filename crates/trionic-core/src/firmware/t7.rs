//! Trionic 7 flash images (512 KiB)

use std::collections::HashMap;

use tracing::{debug, info};

use super::search::{be16, be32, find};
use super::trailer::{self, Trailer};
use super::{expand_symbol_names, fill_raw, xml, DecodeOptions, MIN_NAME_TABLE};
use crate::error::{DecodeError, FirmwareError};
use crate::symbol::{Symbol, SymbolCollection};

pub const T7_LENGTH: usize = 0x80000;

const T7_PREFIX: [u8; 4] = [0xFF, 0xFF, 0xEF, 0xFC];

const ADDRESS_TABLE_PATTERN: [u8; 14] = [
    0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x20, 0x00,
];

const SYMBOL_TABLE_MARKER: &[u8; 12] = b"sYMBOLtABLE\0";

const SEARCH_FROM: usize = 0x30000;

/// Packed name tables live below this offset
const NAME_TABLE_LIMIT: u32 = 0x70000;

const PACKED_ENTRY: usize = 10;
const UNPACKED_ENTRY: usize = 14;

/// Which of the three symbol table layouts an image uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum T7Layout {
    /// LZHUF compressed name table, 10-byte address entries
    Packed,
    /// Plain text name list, 14-byte address entries
    Unpacked,
    /// Address table only, names from an XML file
    Xml,
}

/// A decoded T7 image
#[derive(Debug, Clone)]
pub struct T7File {
    pub(super) data: Vec<u8>,
    pub(super) trailer: Trailer,
    pub(super) sram_offset: u32,
    layout: T7Layout,
    symbols: SymbolCollection,
    decode_errors: Vec<DecodeError>,
}

impl T7File {
    pub fn from_bytes(data: Vec<u8>, opts: &DecodeOptions) -> Result<Self, FirmwareError> {
        if data.len() != T7_LENGTH {
            return Err(FirmwareError::InvalidLength(data.len()));
        }
        if !data.starts_with(&T7_PREFIX) {
            return Err(FirmwareError::NotTrionic7);
        }

        let trailer = Trailer::parse(&data);
        let sram_offset = find(&data, SYMBOL_TABLE_MARKER, SEARCH_FROM)
            .and_then(|pos| be32(&data, pos + SYMBOL_TABLE_MARKER.len()))
            .or_else(|| trailer.get(trailer::SRAM_OFFSET).and_then(|f| f.u32_le()))
            .unwrap_or(0);

        let (layout, mut symbols) = if is_packed(&data, &trailer) {
            read_packed(&data, opts)?
        } else {
            (T7Layout::Unpacked, read_unpacked(&data)?)
        };

        let decode_errors = fill_raw(&mut symbols, &data, sram_offset);
        info!(
            count = symbols.len(),
            errors = decode_errors.len(),
            ?layout,
            sram_offset = %format!("0x{:X}", sram_offset),
            "Loaded T7 symbols"
        );

        Ok(Self {
            data,
            trailer,
            sram_offset,
            layout,
            symbols: SymbolCollection::new(symbols),
            decode_errors,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn trailer(&self) -> &Trailer {
        &self.trailer
    }

    pub fn layout(&self) -> T7Layout {
        self.layout
    }

    pub fn sram_offset(&self) -> u32 {
        self.sram_offset
    }

    pub fn symbols(&self) -> &SymbolCollection {
        &self.symbols
    }

    pub fn decode_errors(&self) -> &[DecodeError] {
        &self.decode_errors
    }

    pub fn part_number(&self) -> Option<String> {
        self.trailer.get_string(trailer::PART_NUMBER)
    }

    pub fn software_version(&self) -> Option<String> {
        self.trailer.get_string(trailer::SOFTWARE_VERSION)
    }

    pub fn chassis_id(&self) -> Option<String> {
        self.trailer.get_string(trailer::CHASSIS_ID)
    }

    /// Overwrite bytes in the image. Checksums are stale until
    /// [`T7File::update_checksum`] runs.
    pub fn patch(&mut self, offset: usize, bytes: &[u8]) -> Result<(), FirmwareError> {
        let end = offset
            .checked_add(bytes.len())
            .filter(|end| *end <= self.data.len())
            .ok_or(FirmwareError::OffsetOutOfRange(offset))?;
        self.data[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Image offset backing a symbol, honouring the SRAM shift
    pub fn symbol_offset(&self, sym: &Symbol) -> Option<usize> {
        let offset = sym.address.checked_sub(sym.sram_offset)? as usize;
        (offset + sym.length as usize <= self.data.len()).then_some(offset)
    }
}

/// A 0x9B field pointing inside the image marks a packed symbol table
fn is_packed(data: &[u8], trailer: &Trailer) -> bool {
    trailer
        .get(trailer::SYMBOL_TABLE)
        .and_then(|f| f.u32_le())
        .is_some_and(|v| v > 0 && (v as usize) < data.len())
}

fn read_packed(data: &[u8], opts: &DecodeOptions) -> Result<(T7Layout, Vec<Symbol>), FirmwareError> {
    let table = find(data, &ADDRESS_TABLE_PATTERN, SEARCH_FROM)
        .and_then(|pos| pos.checked_sub(6))
        .ok_or_else(|| FirmwareError::AddressTableMissing("address table pattern not found".into()))?;

    let name_offset = be32(data, table).ok_or(FirmwareError::OffsetOutOfRange(table))?;
    let name_len = be16(data, table + 4).ok_or(FirmwareError::OffsetOutOfRange(table + 4))?;
    debug!(
        table = %format!("0x{:X}", table),
        name_offset = %format!("0x{:X}", name_offset),
        name_len = %format!("0x{:X}", name_len),
        "Located packed address table"
    );

    let mut symbols = read_packed_entries(data, table)?;

    let has_names = name_len as usize > MIN_NAME_TABLE && name_offset > 0 && name_offset < NAME_TABLE_LIMIT;
    if !has_names {
        let Some(dir) = opts.xml_dir.as_deref() else {
            return Err(FirmwareError::SymbolTableMissing(format!(
                "name table is only 0x{:X} bytes and no XML directory is configured",
                name_len
            )));
        };
        let version = xml::determine_version(data)
            .ok_or_else(|| FirmwareError::VersionUnknown("no known version string".into()))?;
        let names = xml::load_table(dir, version)?;
        apply_xml_names(&mut symbols, &names);
        return Ok((T7Layout::Xml, symbols));
    }

    let start = name_offset as usize;
    let names = data
        .get(start..start + name_len as usize)
        .ok_or(FirmwareError::OffsetOutOfRange(start))?;
    if names.starts_with(&[0xFF; 4]) {
        return Err(FirmwareError::SymbolTableMissing(
            "name table area is erased".into(),
        ));
    }
    let names = expand_symbol_names(names)?;
    for (sym, name) in symbols.iter_mut().zip(names) {
        sym.set_name(name);
    }
    Ok((T7Layout::Packed, symbols))
}

/// Walk 10-byte entries until one starts with "SC"
fn read_packed_entries(data: &[u8], table: usize) -> Result<Vec<Symbol>, FirmwareError> {
    let mut symbols = Vec::new();
    let mut pos = table;
    loop {
        let entry = data
            .get(pos..pos + PACKED_ENTRY)
            .ok_or_else(|| FirmwareError::AddressTableMissing("address table is not terminated".into()))?;
        if entry.starts_with(b"SC") {
            break;
        }
        let number = symbols.len() as i32;
        let address = u32::from_be_bytes([entry[0], entry[1], entry[2], entry[3]]);
        // the first entry describes the table header and is always 8 bytes
        let length = if number == 0 {
            8
        } else {
            u16::from_be_bytes([entry[4], entry[5]])
        };
        let mut sym = Symbol::new(format!("Symbol-{}", number), number, address, length).with_type(entry[8]);
        sym.mask = u16::from_be_bytes([entry[6], entry[7]]);
        symbols.push(sym);
        pos += PACKED_ENTRY;
    }
    Ok(symbols)
}

fn apply_xml_names(symbols: &mut [Symbol], names: &HashMap<i32, String>) {
    for sym in symbols.iter_mut() {
        if let Some(name) = names.get(&sym.number) {
            sym.set_name(name.clone());
        }
    }
}

/// A name record in an unpacked image: offset of its first character and the text
struct NameRecord {
    offset: usize,
    name: String,
}

fn read_unpacked(data: &[u8]) -> Result<Vec<Symbol>, FirmwareError> {
    let start = name_list_offset(data)
        .ok_or_else(|| FirmwareError::SymbolTableMissing("no name list found".into()))?;
    let records = read_name_records(data, start);
    let first = records
        .first()
        .ok_or_else(|| FirmwareError::SymbolTableMissing("name list is empty".into()))?;

    // the seed entry's internal address points back at the first name
    let needle = (first.offset as u32).to_be_bytes();
    let mut from = 0;
    let table = loop {
        let hit = find(data, &needle, from)
            .ok_or_else(|| FirmwareError::AddressTableMissing("no entry references the name list".into()))?;
        if hit >= 10 && hit < start {
            break hit - 10;
        }
        from = hit + 1;
    };

    let mut symbols = Vec::with_capacity(records.len());
    for (i, record) in records.iter().enumerate() {
        let pos = table + i * UNPACKED_ENTRY;
        let entry = data
            .get(pos..pos + UNPACKED_ENTRY)
            .ok_or(FirmwareError::OffsetOutOfRange(pos))?;
        let address = u32::from_be_bytes([entry[0], entry[1], entry[2], entry[3]]);
        let length = u16::from_be_bytes([entry[4], entry[5]]);
        let mut sym = Symbol::new(record.name.clone(), i as i32, address, length).with_type(entry[8]);
        sym.mask = u16::from_be_bytes([entry[6], entry[7]]);
        symbols.push(sym);
    }
    Ok(symbols)
}

/// First 0xFF after a run of at least 15 zero bytes
fn name_list_offset(data: &[u8]) -> Option<usize> {
    let mut zeros = 0;
    for (pos, b) in data.iter().enumerate() {
        match *b {
            0x00 => zeros += 1,
            0xFF if zeros >= 15 => return Some(pos),
            _ => zeros = 0,
        }
    }
    None
}

/// Records are `FF.. name 00 .. 02`; the list ends at the first malformed record
fn read_name_records(data: &[u8], start: usize) -> Vec<NameRecord> {
    let mut records = Vec::new();
    let mut pos = start;
    while pos < data.len() && data[pos] == 0xFF {
        while pos < data.len() && data[pos] == 0xFF {
            pos += 1;
        }
        let name_start = pos;
        while pos < data.len() && data[pos] != 0x00 {
            if !data[pos].is_ascii_graphic() {
                return records;
            }
            pos += 1;
        }
        if pos == name_start || pos >= data.len() {
            return records;
        }
        let name = String::from_utf8_lossy(&data[name_start..pos]).into_owned();
        match data[pos..].iter().position(|b| *b == 0x02) {
            Some(end) => pos += end + 1,
            None => return records,
        }
        records.push(NameRecord {
            offset: name_start,
            name,
        });
    }
    records
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::firmware::lzhuf;
    use pretty_assertions::assert_eq;

    pub(crate) const TABLE_AT: usize = 0x40000;
    pub(crate) const NAMES_AT: usize = 0x50000;
    pub(crate) const SRAM: u32 = 0xEF_0000;

    /// A packed T7 image. Entry 0 is the table header and entry 1 is the
    /// struct record embedded in the search pattern, so `entries[i]` gets
    /// symbol number `i + 2`.
    pub(crate) fn packed_image(names: &[&str], entries: &[(u32, u16, u8)]) -> Vec<u8> {
        let mut image = vec![0u8; T7_LENGTH];
        image[..4].copy_from_slice(&T7_PREFIX);

        let mut text = String::from("Symbol table\r\nHeader\r\n");
        for name in names {
            text.push_str(name);
            text.push_str("\r\n");
        }
        let mut packed = lzhuf::encode(text.as_bytes());
        packed.resize(0x1200, 0);
        image[NAMES_AT..NAMES_AT + packed.len()].copy_from_slice(&packed);

        image[TABLE_AT..TABLE_AT + 4].copy_from_slice(&(NAMES_AT as u32).to_be_bytes());
        image[TABLE_AT + 4..TABLE_AT + 6].copy_from_slice(&(packed.len() as u16).to_be_bytes());
        image[TABLE_AT + 6..TABLE_AT + 20].copy_from_slice(&ADDRESS_TABLE_PATTERN);
        let mut pos = TABLE_AT + 2 * PACKED_ENTRY;
        for (address, length, kind) in entries {
            image[pos..pos + 4].copy_from_slice(&address.to_be_bytes());
            image[pos + 4..pos + 6].copy_from_slice(&length.to_be_bytes());
            image[pos + 8] = *kind;
            pos += PACKED_ENTRY;
        }
        image[pos..pos + 2].copy_from_slice(b"SC");

        let marker = 0x60000;
        image[marker..marker + 12].copy_from_slice(SYMBOL_TABLE_MARKER);
        image[marker + 12..marker + 16].copy_from_slice(&SRAM.to_be_bytes());

        let mut t = Trailer::default();
        t.set(trailer::PART_NUMBER, b"5168646".to_vec());
        t.set(trailer::SOFTWARE_VERSION, b"EU0AF01C.55P".to_vec());
        t.set(trailer::SYMBOL_TABLE, (TABLE_AT as u32).to_le_bytes().to_vec());
        t.write(&mut image, 0x7FE00).unwrap();
        image
    }

    #[test]
    fn test_rejects_wrong_prefix() {
        let image = vec![0u8; T7_LENGTH];
        assert_eq!(
            T7File::from_bytes(image, &DecodeOptions::default()).unwrap_err(),
            FirmwareError::NotTrionic7
        );
    }

    #[test]
    fn test_packed_symbols() {
        let mut image = packed_image(
            &["BFuelCal.Map", "In.v_Vehicle"],
            &[(0x0001_0000, 4, 0x02), (SRAM + 0x100, 2, 0x00)],
        );
        image[0x10000..0x10004].copy_from_slice(&[1, 2, 3, 4]);
        image[0x100..0x102].copy_from_slice(&[0x01, 0x2C]);

        let file = T7File::from_bytes(image, &DecodeOptions::default()).unwrap();
        assert_eq!(file.layout(), T7Layout::Packed);
        assert_eq!(file.sram_offset(), SRAM);
        assert_eq!(file.part_number().as_deref(), Some("5168646"));

        let map = file.symbols().get_by_name("BFuelCal.Map").unwrap();
        assert_eq!(map.number, 2);
        assert_eq!(map.raw(), &[1, 2, 3, 4]);

        let speed = file.symbols().get_by_name("In.v_Vehicle").unwrap();
        assert_eq!(speed.sram_offset, SRAM);
        assert!((speed.float64() - 30.0).abs() < 1e-9);

        // header entry is forced to 8 bytes
        assert_eq!(file.symbols().get_by_number(0).unwrap().length, 8);
        assert!(file.decode_errors().is_empty());
    }

    #[test]
    fn test_short_name_table_without_xml() {
        let mut image = packed_image(&["a", "b"], &[(0x100, 2, 0)]);
        image[TABLE_AT + 4..TABLE_AT + 6].copy_from_slice(&0x0FFFu16.to_be_bytes());
        let err = T7File::from_bytes(image, &DecodeOptions::default()).unwrap_err();
        assert!(matches!(err, FirmwareError::SymbolTableMissing(_)));
    }

    #[test]
    fn test_xml_fallback() {
        let mut image = packed_image(&["a", "b"], &[(0x100, 2, 0), (0x200, 2, 0)]);
        image[TABLE_AT + 4..TABLE_AT + 6].copy_from_slice(&0x0800u16.to_be_bytes());
        image[0x1000..0x1008].copy_from_slice(b"EU0CF01C");

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("EU0AF01C.xml"),
            "<DocumentElement><SYMBOL><SYMBOLNUMBER>2</SYMBOLNUMBER>\
             <DESCRIPTION>Out.X_AccPedal</DESCRIPTION></SYMBOL></DocumentElement>",
        )
        .unwrap();
        let opts = DecodeOptions {
            xml_dir: Some(dir.path().to_path_buf()),
        };
        let file = T7File::from_bytes(image, &opts).unwrap();
        assert_eq!(file.layout(), T7Layout::Xml);
        let pedal = file.symbols().get_by_number(2).unwrap();
        assert_eq!(pedal.name, "Out.X_AccPedal");
        assert_eq!(pedal.correction_factor, 0.1);
        assert_eq!(file.symbols().get_by_number(1).unwrap().name, "Symbol-1");
    }

    #[test]
    fn test_erased_name_table() {
        let mut image = packed_image(&["a"], &[(0x100, 2, 0)]);
        image[NAMES_AT..NAMES_AT + 4].fill(0xFF);
        let err = T7File::from_bytes(image, &DecodeOptions::default()).unwrap_err();
        assert!(matches!(err, FirmwareError::SymbolTableMissing(_)));
    }

    #[test]
    fn test_unpacked_symbols() {
        let mut image = vec![0x4Eu8; T7_LENGTH];
        image[..4].copy_from_slice(&T7_PREFIX);

        let list = 0x30000;
        image[list - 20..list].fill(0);
        let mut pos = list;
        let mut offsets = Vec::new();
        for name in ["In.v_Vehicle", "Out.X_AccPedal"] {
            image[pos..pos + 3].fill(0xFF);
            pos += 3;
            offsets.push(pos);
            image[pos..pos + name.len()].copy_from_slice(name.as_bytes());
            pos += name.len();
            image[pos..pos + 4].copy_from_slice(&[0x00, 0x11, 0x22, 0x02]);
            pos += 4;
        }
        image[pos] = 0x00;

        let table = 0x20000;
        for (i, (address, length)) in [(0x1000u32, 2u16), (0x2000, 1)].iter().enumerate() {
            let e = table + i * UNPACKED_ENTRY;
            image[e..e + 4].copy_from_slice(&address.to_be_bytes());
            image[e + 4..e + 6].copy_from_slice(&length.to_be_bytes());
            image[e + 8] = 0;
            image[e + 10..e + 14].copy_from_slice(&(offsets[i] as u32).to_be_bytes());
        }
        image[0x1000..0x1002].copy_from_slice(&[0x00, 0x64]);
        image[0x7FFFF] = 0x00;

        let file = T7File::from_bytes(image, &DecodeOptions::default()).unwrap();
        assert_eq!(file.layout(), T7Layout::Unpacked);
        let names = file.symbols().names();
        assert_eq!(names, vec!["In.v_Vehicle", "Out.X_AccPedal"]);
        let speed = file.symbols().get_by_name("In.v_Vehicle").unwrap();
        assert_eq!(speed.address, 0x1000);
        assert!((speed.float64() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_patch_bounds() {
        let image = packed_image(&["x"], &[(0x100, 2, 0)]);
        let mut file = T7File::from_bytes(image, &DecodeOptions::default()).unwrap();
        file.patch(0x100, &[0xAA]).unwrap();
        assert_eq!(file.bytes()[0x100], 0xAA);
        assert!(file.patch(T7_LENGTH - 1, &[1, 2]).is_err());
    }
}
