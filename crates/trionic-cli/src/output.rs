//! Output formatting for the trionic CLI (table, json, csv)

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{Table, Tabled};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
    /// CSV format
    Csv,
}

/// Context for output rendering
pub struct OutputContext {
    pub format: OutputFormat,
    pub quiet: bool,
}

impl OutputContext {
    pub fn new(format: OutputFormat, no_color: bool, quiet: bool) -> Self {
        if no_color {
            colored::control::set_override(false);
        }
        Self { format, quiet }
    }

    /// Print a success message (unless in quiet mode)
    pub fn success(&self, msg: &str) {
        if !self.quiet {
            println!("{}", msg.green());
        }
    }

    /// Print an info message (unless in quiet mode)
    pub fn info(&self, msg: &str) {
        if !self.quiet {
            println!("{}", msg);
        }
    }

    pub fn warn(&self, msg: &str) {
        eprintln!("{}", msg.yellow());
    }

    pub fn error(&self, msg: &str) {
        eprintln!("{}", msg.red());
    }

    /// Print rows in the configured format
    pub fn print<T: Tabled + Serialize>(&self, data: &[T]) {
        if data.is_empty() && self.format == OutputFormat::Table {
            if !self.quiet {
                println!("No data");
            }
            return;
        }
        print!("{}", self.render(data));
    }

    /// Rows as text; CSV uses the table's column names
    pub fn render<T: Tabled + Serialize>(&self, data: &[T]) -> String {
        match self.format {
            OutputFormat::Table => format!("{}\n", Table::new(data)),
            OutputFormat::Json => {
                format!("{}\n", serde_json::to_string_pretty(data).unwrap_or_else(|_| "[]".to_string()))
            }
            OutputFormat::Csv => {
                let mut out = String::new();
                if !data.is_empty() {
                    csv_line(&mut out, &T::headers());
                    for row in data {
                        csv_line(&mut out, &row.fields());
                    }
                }
                out
            }
        }
    }

    /// Labelled values of a single item
    pub fn print_kv(&self, pairs: &[(&str, String)]) {
        match self.format {
            OutputFormat::Table => {
                for (key, value) in pairs {
                    println!("{}: {}", key.bold(), value);
                }
            }
            OutputFormat::Json => {
                let map: serde_json::Map<String, serde_json::Value> = pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.clone())))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&map).unwrap_or_else(|_| "{}".to_string()));
            }
            OutputFormat::Csv => {
                let mut out = String::new();
                csv_line(&mut out, &pairs.iter().map(|(k, _)| *k).collect::<Vec<_>>());
                csv_line(&mut out, &pairs.iter().map(|(_, v)| v.as_str()).collect::<Vec<_>>());
                print!("{}", out);
            }
        }
    }
}

fn csv_line<S: AsRef<str>>(out: &mut String, cells: &[S]) {
    for (i, cell) in cells.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let cell = cell.as_ref();
        if cell.contains([',', '"', '\n']) {
            out.push('"');
            out.push_str(&cell.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(cell);
        }
    }
    out.push('\n');
}

// =============================================================================
// Display types for the commands
// =============================================================================

/// Symbol display for the symbols command
#[derive(Debug, Tabled, Serialize)]
pub struct SymbolRow {
    #[tabled(rename = "#")]
    pub number: i32,
    #[tabled(rename = "Name")]
    pub name: String,
    #[tabled(rename = "Address")]
    pub address: String,
    #[tabled(rename = "Length")]
    pub length: u16,
    #[tabled(rename = "Type")]
    pub symbol_type: String,
    #[tabled(rename = "Factor")]
    pub correction_factor: f64,
    #[tabled(rename = "Unit")]
    pub unit: String,
}

/// One checksum for the checksum command
#[derive(Debug, Tabled, Serialize)]
pub struct ChecksumRow {
    #[tabled(rename = "Checksum")]
    pub field: String,
    #[tabled(rename = "Stored")]
    pub stored: String,
    #[tabled(rename = "Computed")]
    pub computed: String,
    #[tabled(rename = "OK")]
    pub ok: String,
}

/// One record field for the replay command
#[derive(Debug, Tabled, Serialize)]
pub struct ValueRow {
    #[tabled(rename = "Symbol")]
    pub symbol: String,
    #[tabled(rename = "Value")]
    pub value: f64,
}

/// Status bits for the dtc command
#[derive(Debug, Tabled, Serialize)]
pub struct StatusRow {
    #[tabled(rename = "Bit")]
    pub bit: String,
    #[tabled(rename = "Meaning")]
    pub meaning: String,
    #[tabled(rename = "Set")]
    pub set: String,
}

pub fn yes_no(value: bool) -> String {
    if value { "Yes" } else { "No" }.to_string()
}
