//! Command implementations for the trionic CLI

pub mod checksum;
pub mod dtc;
pub mod log;
pub mod replay;
pub mod symbols;

pub use checksum::checksum;
pub use dtc::dtc;
pub use log::log;
pub use replay::replay;
pub use symbols::symbols;

use std::path::Path;

use anyhow::{Context, Result};
use trionic_core::{load_firmware, DecodeOptions, Firmware};

/// Read and decode a flash image
pub fn read_firmware(path: &Path, opts: &DecodeOptions) -> Result<Firmware> {
    let data = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    load_firmware(data, opts).with_context(|| format!("Failed to decode {}", path.display()))
}
