//! trionic - Command-line tool for Saab Trionic ECUs
//!
//! Inspect and repair flash images, log live data over CAN and replay
//! recorded logs.

mod commands;
mod config;
mod output;
mod transport;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use trionic_core::{DecodeOptions, EcuKind};

use crate::config::Config;
use crate::output::{OutputContext, OutputFormat};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormatArg {
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "trionic")]
#[command(author, version, about = "Saab Trionic firmware and data logging tool")]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "TRIONIC_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum)]
    output: Option<OutputFormat>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Minimal output (for scripting)
    #[arg(short, long)]
    quiet: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Diagnostic log format on stderr
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the symbols of a flash image
    Symbols {
        /// Firmware file (.bin)
        file: PathBuf,

        /// Only symbols whose name contains this text
        #[arg(long)]
        filter: Option<String>,
    },

    /// Verify T7 checksums
    Checksum {
        /// Firmware file (.bin)
        file: PathBuf,

        /// Rewrite wrong checksums
        #[arg(long)]
        fix: bool,

        /// Write the repaired image here instead of over the input
        #[arg(long, requires = "fix")]
        out: Option<PathBuf>,
    },

    /// Log live data until Ctrl+C
    Log {
        /// ECU generation: t5, t7 or t8
        #[arg(long)]
        ecu: Option<EcuKind>,

        /// Symbols to log, comma separated. `name@0xADDRESS:LENGTH` skips the firmware lookup
        #[arg(long, value_delimiter = ',')]
        symbols: Vec<String>,

        /// Firmware file used to resolve symbol names
        #[arg(long)]
        firmware: Option<PathBuf>,

        /// Samples per second
        #[arg(long)]
        rate: Option<u32>,
    },

    /// Replay a log file at its recorded pacing
    Replay {
        /// Log file (.t5l, .t7l, .t8l or .csv)
        file: PathBuf,

        /// Playback speed multiplier
        #[arg(long, default_value = "1.0")]
        speed: f64,
    },

    /// Decode a DTC status byte
    Dtc {
        /// Status byte, hex (0x2F) or decimal
        status: String,

        /// Trouble code to describe, e.g. P1460
        #[arg(long)]
        code: Option<String>,

        /// ECU the code belongs to
        #[arg(long, default_value = "t7")]
        ecu: EcuKind,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let registry = tracing_subscriber::registry().with(filter);
    match cli.log_format {
        LogFormatArg::Json => registry.with(fmt::layer().json().with_writer(std::io::stderr)).init(),
        LogFormatArg::Text => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init(),
    }

    // Load config file
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load().unwrap_or_default(),
    };

    let format = cli
        .output
        .or_else(|| config.output.as_deref().and_then(|s| OutputFormat::from_str(s, true).ok()))
        .unwrap_or_default();
    let no_color = cli.no_color || config.no_color.unwrap_or(false);
    let ctx = OutputContext::new(format, no_color, cli.quiet);
    let decode = DecodeOptions {
        xml_dir: config.xml_dir.clone(),
    };

    match cli.command {
        Commands::Symbols { file, filter } => commands::symbols(&file, filter.as_deref(), &decode, &ctx),
        Commands::Checksum { file, fix, out } => commands::checksum(&file, fix, out, &ctx),
        Commands::Log {
            ecu,
            symbols,
            firmware,
            rate,
        } => {
            let logger = config.logger_with_args(ecu, &symbols, rate);
            let firmware = firmware.or_else(|| config.firmware.clone());
            commands::log(logger, firmware.as_deref(), &decode, &ctx).await
        }
        Commands::Replay { file, speed } => commands::replay(&file, speed, &ctx).await,
        Commands::Dtc { status, code, ecu } => commands::dtc(&status, code.as_deref(), ecu, &ctx),
    }
}
