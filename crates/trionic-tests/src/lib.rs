//! Integration tests for the Trionic data acquisition stack
//!
//! The tests under `tests/` drive the real clients, engine and façade
//! against the scripted mock CAN adapter, so no hardware is needed:
//!
//! ```bash
//! cargo test -p trionic-tests
//! ```
//!
//! # Test Structure
//!
//! - `session_test.rs` - T7 bring-up, security access, composite reads, error storm
//! - `wideband_test.rs` - external wideband decoding on the CAN bus
//! - `firmware_test.rs` - symbol extraction and checksum repair on synthetic images
//! - `properties.rs` - property checks over codecs, keys and the event bus
//!
//! This library only holds the shared fixtures.

pub mod fixtures {
    use std::sync::Arc;

    use trionic_can::kwp2000::{INIT_MSG_ID, INIT_RESP_ID, REQ_CHUNK_CONF_ID, REQ_MSG_ID};
    use trionic_can::mock::{MockCanAdapter, Script};
    use trionic_can::MockConfig;
    use trionic_core::firmware::lzhuf;
    use trionic_core::firmware::trailer::{self, Trailer};
    use trionic_core::firmware::T7_LENGTH;

    /// Reply identifier the scripted T7 hands out at StartCommunication
    pub const T7_RESPONSE_ID: u32 = 0x258;
    /// Seed the scripted T7 sends
    pub const T7_SEED: u16 = 0xA1B2;

    pub const TABLE_AT: usize = 0x40000;
    pub const NAMES_AT: usize = 0x50000;
    pub const SRAM: u32 = 0xEF_0000;
    pub const FW_SUM_AT: usize = 0x7F000;
    pub const FW_LENGTH: u32 = 0x7F000;

    const ROUTINE_AT: usize = 0x20000;
    const PACKED_ENTRY: usize = 10;
    const TRAILER_START: usize = 0x7FE00;

    pub fn mock(bridge: bool) -> Arc<MockCanAdapter> {
        Arc::new(MockCanAdapter::new(&MockConfig {
            bridge,
            ..Default::default()
        }))
    }

    /// StartCommunication, seed/key and DDLI replies of a cooperative T7
    /// that accepts the first key it is offered
    pub fn script_t7_session(mock: &MockCanAdapter) {
        let [seed_hi, seed_lo] = T7_SEED.to_be_bytes();
        mock.script(
            Script::on(INIT_MSG_ID, [0x3F, 0x81])
                .reply(INIT_RESP_ID, vec![0x40, 0xBF, 0x21, 0xC1, 0x8F, 0xEF, 0x02, 0x58]),
        );
        mock.script(
            Script::on(REQ_MSG_ID, [0x40, 0xA1, 0x02, 0x27, 0x05])
                .reply(T7_RESPONSE_ID, vec![0xC0, 0xBF, 0x04, 0x67, 0x05, seed_hi, seed_lo, 0x00]),
        );
        mock.script(
            Script::on(REQ_MSG_ID, [0x40, 0xA1, 0x04, 0x27, 0x06])
                .reply(T7_RESPONSE_ID, vec![0xC0, 0xBF, 0x03, 0x67, 0x06, 0x34, 0x00, 0x00]),
        );
        mock.script(
            Script::on(REQ_MSG_ID, [0x40, 0xA1, 0x02, 0x2C, 0x04])
                .reply(T7_RESPONSE_ID, vec![0xC0, 0xBF, 0x02, 0x6C, 0xF0, 0x00, 0x00, 0x00]),
        );
        mock.script(
            Script::on(REQ_MSG_ID, [0xC1, 0xA1])
                .reply(REQ_CHUNK_CONF_ID, vec![0x00, 0xBF, 0x00, 0x6C, 0x00, 0x00, 0x00, 0x00]),
        );
    }

    /// Answer every DDLI 0xF0 read with `data`
    pub fn script_t7_record(mock: &MockCanAdapter, data: &[u8]) {
        let mut message = vec![0x61, 0xF0];
        message.extend_from_slice(data);
        mock.script_kwp_reply(Script::on(REQ_MSG_ID, [0x40, 0xA1, 0x02, 0x21, 0xF0]), T7_RESPONSE_ID, &message);
    }

    /// A packed T7 image. `entries[i]` is `(address, length, type)` and
    /// gets symbol number `i + 2`; entry 0 is the table header and entry 1
    /// sits inside the search pattern.
    pub fn t7_image(names: &[&str], entries: &[(u32, u16, u8)]) -> Vec<u8> {
        let mut image = vec![0u8; T7_LENGTH];
        image[..4].copy_from_slice(&[0xFF, 0xFF, 0xEF, 0xFC]);

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
        image[TABLE_AT + 6..TABLE_AT + 20]
            .copy_from_slice(&[0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x20, 0x00]);
        let mut pos = TABLE_AT + 2 * PACKED_ENTRY;
        for (address, length, kind) in entries {
            image[pos..pos + 4].copy_from_slice(&address.to_be_bytes());
            image[pos + 4..pos + 6].copy_from_slice(&length.to_be_bytes());
            image[pos + 8] = *kind;
            pos += PACKED_ENTRY;
        }
        image[pos..pos + 2].copy_from_slice(b"SC");

        let marker = 0x60000;
        image[marker..marker + 12].copy_from_slice(b"sYMBOLtABLE\0");
        image[marker + 12..marker + 16].copy_from_slice(&SRAM.to_be_bytes());

        let mut t = Trailer::default();
        t.set(trailer::PART_NUMBER, b"5168646".to_vec());
        t.set(trailer::SOFTWARE_VERSION, b"EU0AF01C.55P".to_vec());
        t.set(trailer::SYMBOL_TABLE, (TABLE_AT as u32).to_le_bytes().to_vec());
        t.write(&mut image, TRAILER_START).expect("trailer fits");
        image
    }

    /// Add boot code whose FW checksum covers `[0x1100, +0x20)` and
    /// `[0x10000, +0x13)`, plus zeroed F2/FB trailer fields
    pub fn with_checksum_routine(mut image: Vec<u8>) -> Vec<u8> {
        let mut code = vec![
            0x48, 0xE7, 0x00, 0x3C, 0x24, 0x7C, 0x00, 0xF0, 0x00, 0x00, 0x26, 0x7C, 0x00, 0x00, 0x00, 0x00, 0x28,
            0x7C, 0x00, 0xF0, 0x00, 0x00, 0x2A, 0x7C,
        ];
        code.extend_from_slice(&[0x00, 0x00, 0x10, 0x00]);
        code.extend_from_slice(&[0x48, 0x78, 0x00, 0x20, 0x48, 0x6D, 0x01, 0x00]);
        code.extend_from_slice(&[0x48, 0x78, 0x00, 0x13, 0x48, 0x79, 0x00, 0x01, 0x00, 0x00]);
        code.extend_from_slice(&[0x4E, 0x71]);
        code.extend_from_slice(&[0xB0, 0xB9]);
        code.extend_from_slice(&(SRAM + FW_SUM_AT as u32).to_be_bytes());
        image[ROUTINE_AT..ROUTINE_AT + code.len()].copy_from_slice(&code);

        let mut t = Trailer::parse(&image);
        t.set_u32_be(trailer::FW_LENGTH, FW_LENGTH);
        t.set_u32_be(trailer::CHECKSUM_FB, 0);
        t.set_u32_be(trailer::CHECKSUM_F2, 0);
        t.write(&mut image, TRAILER_START).expect("trailer fits");
        image
    }
}
