//! Log writers
//!
//! A record is the measurement state for the names in `order` followed by
//! every polled symbol.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tracing::info;
use trionic_core::{EcuKind, Symbol};

use crate::config::LogFormat;
use crate::error::Result;
use crate::state::Measurements;

/// Name of the external wideband reading
pub const EXTERNAL_WBL: &str = "Lambda.External";

/// Timestamp layout of pipe-delimited logs
pub const PIPE_TIME_FORMAT: &str = "%d-%m-%Y %H:%M:%S%.3f";
/// Timestamp layout of CSV logs
pub const CSV_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%z";

pub trait LogWriter: Send {
    fn write(&mut self, state: &Measurements, symbols: &[Symbol], timestamp: DateTime<Local>, order: &[String]) -> Result<()>;

    /// Flush and sync to disk
    fn close(&mut self) -> Result<()>;

    fn path(&self) -> &Path;
}

/// Digits after the decimal point: none for integers, 3 for the external
/// wideband, 2 otherwise
pub fn precision(name: &str, value: f64) -> usize {
    if value.fract() == 0.0 {
        0
    } else if name == EXTERNAL_WBL {
        3
    } else {
        2
    }
}

pub fn format_value(name: &str, value: f64) -> String {
    format!("{:.*}", precision(name, value), value)
}

/// Symbols that carry their own bytes in a sample
fn logged(symbols: &[Symbol]) -> impl Iterator<Item = &Symbol> {
    symbols.iter().filter(|s| !s.skip && !s.is_adc())
}

fn open(path: &Path) -> Result<BufWriter<File>> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)?;
        }
    }
    Ok(BufWriter::new(File::create(path)?))
}

fn sync(out: &mut Option<BufWriter<File>>) -> Result<()> {
    if let Some(mut w) = out.take() {
        w.flush()?;
        w.get_ref().sync_all()?;
    }
    Ok(())
}

/// `DD-MM-YYYY HH:MM:SS.mmm|name=value|...|IMPORTANTLINE=0|`, decimal commas
pub struct PipeWriter {
    path: PathBuf,
    out: Option<BufWriter<File>>,
}

impl PipeWriter {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let out = open(&path)?;
        Ok(Self { path, out: Some(out) })
    }

    fn field(line: &mut String, name: &str, value: f64) {
        line.push_str(name);
        line.push('=');
        line.push_str(&format_value(name, value).replacen('.', ",", 1));
        line.push('|');
    }
}

impl LogWriter for PipeWriter {
    fn write(&mut self, state: &Measurements, symbols: &[Symbol], timestamp: DateTime<Local>, order: &[String]) -> Result<()> {
        let Some(out) = self.out.as_mut() else {
            return Ok(());
        };
        let mut line = timestamp.format(PIPE_TIME_FORMAT).to_string();
        line.push('|');
        for name in order {
            Self::field(&mut line, name, state.get(name));
        }
        for sym in logged(symbols) {
            Self::field(&mut line, &sym.name, sym.float64());
        }
        line.push_str("IMPORTANTLINE=0|\n");
        out.write_all(line.as_bytes())?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        sync(&mut self.out)
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

/// Comma separated, ISO-8601 timestamps.
///
/// The first record fixes the columns. Later rows fill them from the polled
/// symbols, then the last known measurement; a column with neither stays
/// empty and names that appear after the header are not written.
pub struct CsvWriter {
    path: PathBuf,
    out: Option<BufWriter<File>>,
    columns: Option<Vec<String>>,
}

impl CsvWriter {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let out = open(&path)?;
        Ok(Self {
            path,
            out: Some(out),
            columns: None,
        })
    }

    fn cell(state: &Measurements, symbols: &[Symbol], name: &str) -> String {
        if let Some(sym) = logged(symbols).find(|s| s.name == name) {
            format_value(name, sym.float64())
        } else if state.exists(name) {
            format_value(name, state.get(name))
        } else {
            String::new()
        }
    }
}

impl LogWriter for CsvWriter {
    fn write(&mut self, state: &Measurements, symbols: &[Symbol], timestamp: DateTime<Local>, order: &[String]) -> Result<()> {
        let Some(out) = self.out.as_mut() else {
            return Ok(());
        };
        if self.columns.is_none() {
            let mut columns: Vec<String> = order.to_vec();
            columns.extend(logged(symbols).map(|s| s.name.clone()));
            writeln!(out, "Time,{}", columns.join(","))?;
            self.columns = Some(columns);
        }
        let columns = self.columns.as_deref().unwrap_or_default();
        let mut row = vec![timestamp.format(CSV_TIME_FORMAT).to_string()];
        row.extend(columns.iter().map(|name| Self::cell(state, symbols, name)));
        writeln!(out, "{}", row.join(","))?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        sync(&mut self.out)
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

/// `<dir>/<prefix>-YYYY-MM-DD_HHMMSS.<ext>`, dots in the prefix replaced
pub fn log_file_name(dir: &Path, prefix: &str, extension: &str, now: DateTime<Local>) -> PathBuf {
    let prefix = prefix.replace('.', "_");
    dir.join(format!("{}-{}.{}", prefix, now.format("%Y-%m-%d_%H%M%S"), extension))
}

/// Create the log directory and a writer for a new session
pub fn create_log(dir: &Path, prefix: &str, ecu: EcuKind, format: LogFormat) -> Result<Box<dyn LogWriter>> {
    fs::create_dir_all(dir)?;
    let writer: Box<dyn LogWriter> = match format {
        LogFormat::Txl => Box::new(PipeWriter::create(log_file_name(dir, prefix, ecu.log_extension(), Local::now()))?),
        LogFormat::Csv => Box::new(CsvWriter::create(log_file_name(dir, prefix, "csv", Local::now()))?),
    };
    info!(path = %writer.path().display(), "Logging to file");
    Ok(writer)
}
