//! Replay command - print a recorded log at its original pacing

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use trionic_logger::Record;

use crate::output::{OutputContext, OutputFormat, ValueRow};

/// Pause before the next record, scaled by `speed`
pub fn pacing(record: &Record, speed: f64) -> Duration {
    if record.delay_to_next_ms <= 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(record.delay_to_next_ms as f64 / 1000.0 / speed)
}

fn print_record(record: &Record, ctx: &OutputContext) {
    match ctx.format {
        OutputFormat::Table => {
            println!("{}", record.time.format("%Y-%m-%d %H:%M:%S%.3f"));
            let rows: Vec<ValueRow> = record
                .values
                .iter()
                .map(|(symbol, value)| ValueRow {
                    symbol: symbol.clone(),
                    value: *value,
                })
                .collect();
            ctx.print(&rows);
        }
        OutputFormat::Json => {
            let values: serde_json::Map<String, serde_json::Value> = record
                .values
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::json!(v)))
                .collect();
            let line = serde_json::json!({ "time": record.time.to_string(), "values": values });
            println!("{}", line);
        }
        OutputFormat::Csv => {
            let values: Vec<String> = record.values.iter().map(|(_, v)| v.to_string()).collect();
            println!("{},{}", record.time.format("%Y-%m-%dT%H:%M:%S%.3f"), values.join(","));
        }
    }
}

pub async fn replay(path: &Path, speed: f64, ctx: &OutputContext) -> Result<()> {
    if speed.is_nan() || speed <= 0.0 {
        bail!("Replay speed must be positive");
    }
    let mut log = trionic_logger::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    if log.is_empty() {
        ctx.info("Log is empty");
        return Ok(());
    }
    if let (Some(start), Some(end)) = (log.start(), log.end()) {
        ctx.info(&format!("{} record(s), {} to {}", log.len(), start, end));
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let mut header = ctx.format == OutputFormat::Csv;
    while running.load(Ordering::SeqCst) {
        let Some(record) = log.next() else {
            break;
        };
        if header {
            let names: Vec<&str> = record.values.iter().map(|(k, _)| k.as_str()).collect();
            println!("Time,{}", names.join(","));
            header = false;
        }
        print_record(record, ctx);
        tokio::time::sleep(pacing(record, speed)).await;
    }
    Ok(())
}
