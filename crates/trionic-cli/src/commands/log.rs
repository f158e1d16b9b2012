//! Log command - run a live logging session until Ctrl+C

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast::error::RecvError;
use trionic_core::{DecodeOptions, ErrorKind, Symbol, SymbolCollection};
use trionic_logger::{Aggregator, Controller, DataLogger, LoggerConfig};

use crate::commands::read_firmware;
use crate::output::OutputContext;
use crate::transport;

/// Resolve one `--symbols` entry: a name looked up in the firmware, or
/// `name@0xADDRESS:LENGTH` for a symbol the firmware does not describe.
pub fn resolve_symbol(input: &str, number: i32, table: Option<&SymbolCollection>) -> Result<Symbol> {
    if let Some((name, location)) = input.split_once('@') {
        let (address, length) = location
            .split_once(':')
            .with_context(|| format!("'{}': expected name@0xADDRESS:LENGTH", input))?;
        let address = u32::from_str_radix(address.trim_start_matches("0x").trim_start_matches("0X"), 16)
            .with_context(|| format!("'{}': bad address", input))?;
        let length: u16 = length.parse().with_context(|| format!("'{}': bad length", input))?;
        return Ok(Symbol::new(name, number, address, length));
    }

    let Some(table) = table else {
        bail!("'{}': no firmware to look the symbol up in, pass --firmware or use name@0xADDRESS:LENGTH", input);
    };
    table
        .get_by_name(input)
        .with_context(|| format!("Symbol '{}' not found in firmware", input))
}

pub async fn log(config: LoggerConfig, firmware: Option<&Path>, xml: &DecodeOptions, ctx: &OutputContext) -> Result<()> {
    if config.symbols.is_empty() {
        bail!("No symbols to log, pass --symbols or set [logger] symbols");
    }
    let firmware = firmware.map(|path| read_firmware(path, xml)).transpose()?;
    let table = firmware.as_ref().map(|f| f.symbols());
    let symbols = config
        .symbols
        .iter()
        .enumerate()
        .map(|(i, input)| resolve_symbol(input, i as i32 + 1, table))
        .collect::<Result<Vec<_>>>()?;

    let can = transport::open(&config.transport).await?;
    let logger = DataLogger::new(config, Controller::with_aggregators(Aggregator::defaults()));
    let mut messages = logger.messages();
    let mut counters = logger.counters();

    logger.start(can, symbols).context("Failed to start logging")?;
    ctx.info(&format!("Logging {} to {}", logger.config().ecu, logger.config().log_dir.display()));
    ctx.info("Press Ctrl+C to stop");

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    while running.load(Ordering::SeqCst) && logger.is_running() {
        tokio::select! {
            msg = messages.recv() => match msg {
                Ok(msg) if msg.kind == Some(ErrorKind::Fatal) => ctx.error(&msg.text),
                Ok(msg) => ctx.warn(&msg.text),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            Ok(()) = counters.changed() => {
                let c = *counters.borrow_and_update();
                if !ctx.quiet {
                    print!("\rcaptures: {}  errors: {}  fps: {}   ", c.captures, c.errors, c.fps);
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    ctx.info("\nStopping...");
    let result = logger.close().await;
    let c = *logger.counters().borrow();
    ctx.info(&format!("{} record(s), {} error(s)", c.captures, c.errors));
    result.context("Logging session failed")?;
    ctx.success("Log closed");
    Ok(())
}
