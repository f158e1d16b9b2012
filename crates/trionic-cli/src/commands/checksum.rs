//! Checksum command - verify or repair T7 checksums

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use trionic_core::firmware::ChecksumPair;
use trionic_core::{ChecksumReport, DecodeOptions, Firmware};

use crate::commands::read_firmware;
use crate::output::{yes_no, ChecksumRow, OutputContext};

fn row(field: &str, pair: &ChecksumPair) -> ChecksumRow {
    ChecksumRow {
        field: field.to_string(),
        stored: format!("0x{:08X}", pair.stored),
        computed: format!("0x{:08X}", pair.computed),
        ok: yes_no(pair.is_valid()),
    }
}

fn rows(report: &ChecksumReport) -> Vec<ChecksumRow> {
    let mut rows = vec![row("FW", &report.fw)];
    if let Some(f2) = &report.f2 {
        rows.push(row("F2", f2));
    }
    rows.push(row("FB", &report.fb));
    rows
}

/// Print the checksum report. With `fix`, rewrite the checksums into
/// `output` (or the input file) and print the new report.
pub fn checksum(path: &Path, fix: bool, output: Option<PathBuf>, ctx: &OutputContext) -> Result<()> {
    let Firmware::T7(mut file) = read_firmware(path, &DecodeOptions::default())? else {
        bail!("{}: checksums can only be verified on Trionic 7 images", path.display());
    };

    let report = file.checksums().context("Failed to compute checksums")?;
    ctx.print(&rows(&report));
    if report.is_valid() {
        ctx.success("Checksums OK");
        return Ok(());
    }
    if !fix {
        bail!("Checksum mismatch, run with --fix to repair");
    }

    let report = file.update_checksum().context("Failed to update checksums")?;
    let target = output.unwrap_or_else(|| path.to_path_buf());
    std::fs::write(&target, file.bytes()).with_context(|| format!("Failed to write {}", target.display()))?;
    ctx.print(&rows(&report));
    ctx.success(&format!("Checksums updated in {}", target.display()));
    Ok(())
}
