//! Symbols command - list the symbol table of a flash image

use std::path::Path;

use anyhow::Result;
use trionic_core::DecodeOptions;

use crate::commands::read_firmware;
use crate::output::{OutputContext, SymbolRow};

/// List decoded symbols, optionally only those whose name contains `filter`
pub fn symbols(path: &Path, filter: Option<&str>, opts: &DecodeOptions, ctx: &OutputContext) -> Result<()> {
    let firmware = read_firmware(path, opts)?;
    for err in firmware.decode_errors() {
        ctx.warn(&format!("Skipped symbol: {}", err));
    }

    let needle = filter.map(str::to_ascii_lowercase);
    let rows: Vec<SymbolRow> = firmware
        .symbols()
        .symbols()
        .into_iter()
        .filter(|s| {
            needle
                .as_deref()
                .map_or(true, |n| s.name.to_ascii_lowercase().contains(n))
        })
        .map(|s| SymbolRow {
            number: s.number,
            name: s.name.clone(),
            address: format!("0x{:06X}", s.address),
            length: s.length,
            symbol_type: format!("0x{:02X}", s.symbol_type.0),
            correction_factor: s.correction_factor,
            unit: s.unit.clone(),
        })
        .collect();

    ctx.info(&format!("{} {} symbol(s)", firmware.kind(), rows.len()));
    ctx.print(&rows);
    Ok(())
}
