//! DTC command - decode a trouble code status byte

use anyhow::{Context, Result};
use trionic_core::dtc::status_flags;
use trionic_core::{Dtc, EcuKind};

use crate::output::{yes_no, OutputContext, StatusRow};

/// `0x2F`, `2F` and `47` all parse; bare digits are decimal
pub fn parse_status(input: &str) -> Result<u8> {
    let s = input.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None if s.chars().all(|c| c.is_ascii_digit()) => s.parse(),
        None => u8::from_str_radix(s, 16),
    }
    .with_context(|| format!("Invalid status byte '{}'", input))
}

pub fn dtc(status: &str, code: Option<&str>, ecu: EcuKind, ctx: &OutputContext) -> Result<()> {
    let status = parse_status(status)?;

    if let Some(code) = code {
        let dtc = Dtc::new(ecu, code.to_ascii_uppercase(), status);
        let mut pairs = vec![("Code", dtc.code.clone()), ("MIL", yes_no(dtc.mil()))];
        if let Some(info) = dtc.info() {
            pairs.push(("Title", info.title.to_string()));
            if !info.hint.is_empty() {
                pairs.push(("Hint", info.hint.to_string()));
            }
        }
        ctx.print_kv(&pairs);
    }

    let set = status_flags(status);
    let rows: Vec<StatusRow> = (0..8)
        .map(|bit| {
            let mask = 1u8 << bit;
            let meaning = status_flags(mask).first().copied().unwrap_or_default();
            StatusRow {
                bit: format!("0x{:02X}", mask),
                meaning: meaning.to_string(),
                set: yes_no(set.contains(&meaning)),
            }
        })
        .collect();
    ctx.print(&rows);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status("0x2F").unwrap(), 0x2F);
        assert_eq!(parse_status("2F").unwrap(), 0x2F);
        assert_eq!(parse_status("47").unwrap(), 47);
        assert_eq!(parse_status(" 0x80 ").unwrap(), 0x80);
        assert!(parse_status("0x100").is_err());
        assert!(parse_status("zz").is_err());
    }
}
