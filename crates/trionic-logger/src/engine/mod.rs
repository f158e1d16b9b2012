//! Acquisition engine
//!
//! One task owns the diagnostic session, the symbol list and the log writer.
//! Everything else talks to it through bounded channels:
//!
//! ```text
//!   set_symbols ──┐
//!   get_ram ──────┤                 ┌──> event bus
//!   set_ram ──────┼──> Engine::run ─┼──> measurement state
//!   shutdown ─────┘     ▲     ▲     └──> log writer
//!                       │     │
//!                tick/1 Hz   push frames (txbridge)
//! ```
//!
//! In pull mode the engine reads the composite record on every tick. Behind
//! a txbridge the device samples on its own and pushes
//! `[timestamp:4LE][payload]` frames instead.

pub mod bridge;
pub mod broadcast;
pub mod protocol;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use tokio::sync::{broadcast as bcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use trionic_can::{CanClient, Subscription, SYSTEM_MSG_DATA_RESPONSE, SYSTEM_MSG_ERROR};
use trionic_core::symbol::t5_correction_factor;
use trionic_core::{EcuKind, ErrorKind, Symbol};
use trionic_wbl::Wideband;

use crate::config::LoggerConfig;
use crate::error::{LoggerError, Result};
use crate::eventbus::Controller;
use crate::request::{RamOp, RamRequest};
use crate::state::Measurements;
use crate::writer::{LogWriter, EXTERNAL_WBL};

use bridge::PushClock;
pub use protocol::{check_t8_window, Protocol};

/// Errors tolerated within one second
pub const MAX_ERRORS_PER_SECOND: u32 = 5;
/// Attempts after the first failed startup
pub const STARTUP_RETRIES: u32 = 3;
pub const RETRY_DELAY: Duration = Duration::from_millis(1500);
/// Broadcast observation window behind a txbridge
pub const BRIDGE_BROADCAST_WINDOW_MS: u64 = 550;
/// Counters are pushed to observers every this many samples
pub const COUNTER_STRIDE: u64 = 15;
/// Symbol whose raw value is a wideband voltage on the ECU's AD scanner
pub const AD_SCANNER: &str = "DisplProt.AD_Scanner";

/// Live statistics, published through a `watch` channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub captures: u64,
    pub errors: u64,
    pub fps: u32,
}

/// Status line for the UI. `kind` is `None` for informational messages.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineMessage {
    pub kind: Option<ErrorKind>,
    pub text: String,
}

/// Receiving ends the façade hands to the engine
pub struct EngineInputs {
    pub symbols: mpsc::Receiver<Vec<Symbol>>,
    pub reads: mpsc::Receiver<RamRequest>,
    pub writes: mpsc::Receiver<RamRequest>,
    pub shutdown: watch::Receiver<bool>,
}

impl EngineInputs {
    /// Refuse new requests and cancel the queued ones
    fn drain(&mut self) {
        self.symbols.close();
        self.reads.close();
        self.writes.close();
        while let Ok(req) = self.reads.try_recv() {
            req.cancel();
        }
        while let Ok(req) = self.writes.try_recv() {
            req.cancel();
        }
    }
}

/// Sum of the lengths the ECU returns per sample
pub fn expected_payload(symbols: &[Symbol]) -> usize {
    symbols.iter().filter(|s| is_polled(s)).map(|s| s.length as usize).sum()
}

fn is_polled(sym: &Symbol) -> bool {
    !sym.skip && !sym.is_adc()
}

pub struct Engine {
    config: LoggerConfig,
    can: Arc<CanClient>,
    protocol: Protocol,
    bus: Controller,
    state: Measurements,
    symbols: Vec<Symbol>,
    expected: usize,
    writer: Box<dyn LogWriter>,
    wbl: Option<Wideband>,
    bridge: bool,
    listener: Option<JoinHandle<()>>,
    /// Names supplied by the T7 broadcast
    adopted: Vec<String>,
    last_keep_alive: Instant,
    captures: u64,
    errors: u64,
    errors_this_second: u32,
    samples_this_second: u32,
    counters: Arc<watch::Sender<Counters>>,
    messages: bcast::Sender<EngineMessage>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: LoggerConfig,
        can: Arc<CanClient>,
        bus: Controller,
        state: Measurements,
        symbols: Vec<Symbol>,
        writer: Box<dyn LogWriter>,
        wbl: Option<Wideband>,
        counters: Arc<watch::Sender<Counters>>,
        messages: bcast::Sender<EngineMessage>,
    ) -> Self {
        let protocol = Protocol::new(config.ecu, can.clone());
        let bridge = can.is_bridge();
        let symbols = prepare(config.ecu, symbols);
        Self {
            expected: expected_payload(&symbols),
            config,
            can,
            protocol,
            bus,
            state,
            symbols,
            writer,
            wbl,
            bridge,
            listener: None,
            adopted: Vec::new(),
            last_keep_alive: Instant::now(),
            captures: 0,
            errors: 0,
            errors_this_second: 0,
            samples_this_second: 0,
            counters,
            messages,
        }
    }

    /// Run the session to completion. Teardown happens on every exit path.
    pub async fn run(mut self, mut inputs: EngineInputs) -> Result<()> {
        let result = self.run_session(&mut inputs).await;
        if let Err(e) = &result {
            warn!(%e, "Logging session ended with error");
            self.emit(Some(e.kind()), e.to_string());
        }
        self.teardown(&mut inputs).await;
        result
    }

    async fn run_session(&mut self, inputs: &mut EngineInputs) -> Result<()> {
        if let Some(wbl) = self.wbl.as_mut() {
            wbl.start(&self.can).await?;
            info!(wbl = %wbl.describe(), "Wideband started");
        }

        let mut attempt = 0;
        loop {
            match self.startup().await {
                Ok(()) => break,
                Err(e) if e.kind() == ErrorKind::Fatal || attempt >= STARTUP_RETRIES => return Err(e),
                Err(e) => {
                    attempt += 1;
                    warn!(%e, attempt, "Session startup failed, retrying");
                    self.emit(Some(e.kind()), format!("startup failed, retry {}/{}: {}", attempt, STARTUP_RETRIES, e));
                    tokio::select! {
                        _ = inputs.shutdown.changed() => return Ok(()),
                        _ = tokio::time::sleep(RETRY_DELAY) => {}
                    }
                }
            }
        }

        let mut push = if self.bridge { Some(self.start_push().await?) } else { None };
        self.emit(None, format!("logging {} symbols", self.symbols.len()));
        self.main_loop(inputs, &mut push).await
    }

    /// Session, security, broadcast observation and symbol configuration
    async fn startup(&mut self) -> Result<()> {
        if self.protocol.ecu() == EcuKind::T7 && self.listener.is_none() {
            self.observe_broadcast().await;
        }
        if self.bridge {
            bridge::select_ecu(&self.can, self.protocol.ecu()).await?;
        }
        self.protocol.open().await?;
        self.configure().await
    }

    async fn observe_broadcast(&mut self) {
        let window = if self.bridge {
            self.config.broadcast_window_ms.min(BRIDGE_BROADCAST_WINDOW_MS)
        } else {
            self.config.broadcast_window_ms
        };
        let listener = broadcast::spawn_listener(&self.can, self.bus.clone(), self.state.clone());
        tokio::time::sleep(Duration::from_millis(window)).await;

        self.adopted = self
            .state
            .keys()
            .into_iter()
            .filter(|k| broadcast::adoptable(k))
            .collect();
        if self.adopted.is_empty() {
            debug!("No broadcast frames seen");
            listener.abort();
            return;
        }
        info!(adopted = ?self.adopted, "Symbols adopted from broadcast");
        self.emit(None, format!("broadcast supplies {}", self.adopted.join(", ")));
        self.listener = Some(listener);
    }

    /// Mark broadcast-supplied symbols, define the record, recompute its length
    async fn configure(&mut self) -> Result<()> {
        for sym in &mut self.symbols {
            if self.adopted.iter().any(|n| *n == sym.name) {
                sym.skip = true;
            }
        }
        let polled: Vec<&Symbol> = self.symbols.iter().filter(|s| is_polled(s)).collect();
        if self.bridge && self.protocol.ecu() == EcuKind::T5 {
            bridge::send_symbol_list(&self.can, EcuKind::T5, &polled).await?;
        } else {
            self.protocol.configure(&polled).await?;
        }
        self.expected = expected_payload(&self.symbols);
        info!(symbols = self.symbols.len(), polled = polled.len(), expected = self.expected, "Symbols configured");
        Ok(())
    }

    async fn start_push(&mut self) -> Result<Subscription> {
        let sub = self.can.subscribe(&[SYSTEM_MSG_DATA_RESPONSE, SYSTEM_MSG_ERROR]);
        bridge::send_raw(&self.can, bridge::START).await?;
        info!("txbridge streaming started");
        Ok(sub)
    }

    async fn main_loop(&mut self, inputs: &mut EngineInputs, push: &mut Option<Subscription>) -> Result<()> {
        let period = Duration::from_millis(1000 / u64::from(self.config.rate.max(1)));
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut one_hz = tokio::time::interval_at(
            tokio::time::Instant::now() + Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let mut clock = PushClock::new();
        let pull = push.is_none();

        loop {
            tokio::select! {
                biased;

                _ = inputs.shutdown.changed() => {
                    info!("Logging stopped");
                    return Ok(());
                }
                _ = one_hz.tick() => {
                    self.heartbeat()?;
                }
                Some(symbols) = inputs.symbols.recv() => {
                    if let Err(e) = self.reconfigure(symbols, push).await {
                        self.failure(e)?;
                    }
                }
                Some(req) = inputs.reads.recv() => {
                    self.serve(req, push).await;
                }
                Some(req) = inputs.writes.recv() => {
                    self.serve(req, push).await;
                }
                _ = tick.tick(), if pull => {
                    if let Err(e) = self.poll().await {
                        self.failure(e)?;
                    }
                }
                frame = next_frame(push) => {
                    let Some(frame) = frame else {
                        return Err(LoggerError::Aborted("txbridge stream closed".to_string()));
                    };
                    if let Err(e) = self.on_push_frame(&frame.data, frame.id, &mut clock).await {
                        self.failure(e)?;
                    }
                }
            }
        }
    }

    /// 1 Hz bookkeeping; fails the session on an error storm
    fn heartbeat(&mut self) -> Result<()> {
        let fps = self.samples_this_second;
        let errors = self.errors_this_second;
        self.samples_this_second = 0;
        self.errors_this_second = 0;
        self.counters.send_modify(|c| c.fps = fps);
        if errors > MAX_ERRORS_PER_SECOND {
            return Err(LoggerError::TooManyErrors);
        }
        Ok(())
    }

    /// Count a recoverable error, propagate a fatal one
    fn failure(&mut self, e: LoggerError) -> Result<()> {
        if e.kind() == ErrorKind::Fatal {
            return Err(e);
        }
        self.count_error(&e);
        Ok(())
    }

    fn count_error(&mut self, e: &LoggerError) {
        self.errors += 1;
        self.errors_this_second += 1;
        warn!(%e, errors = self.errors, "Logging error");
        let errors = self.errors;
        self.counters.send_modify(|c| c.errors = errors);
        self.emit(Some(e.kind()), e.to_string());
    }

    fn emit(&self, kind: Option<ErrorKind>, text: impl Into<String>) {
        // nobody listening is fine
        let _ = self.messages.send(EngineMessage { kind, text: text.into() });
    }

    async fn poll(&mut self) -> Result<()> {
        if self.symbols.is_empty() {
            return self.protocol.keep_alive(&mut self.last_keep_alive).await;
        }
        let timestamp = Local::now();
        let data = if self.expected == 0 {
            self.protocol.keep_alive(&mut self.last_keep_alive).await?;
            Vec::new()
        } else {
            let polled: Vec<&Symbol> = self.symbols.iter().filter(|s| is_polled(s)).collect();
            let data = self.protocol.read_composite(&polled).await?;
            self.last_keep_alive = Instant::now();
            data
        };
        if data.len() != self.expected {
            return Err(LoggerError::PayloadLength {
                expected: self.expected,
                got: data.len(),
            });
        }
        self.sample(&data, timestamp).await
    }

    async fn on_push_frame(&mut self, data: &[u8], id: u32, clock: &mut PushClock) -> Result<()> {
        if id == SYSTEM_MSG_ERROR {
            return Err(LoggerError::Bridge(data.first().copied().unwrap_or_default()));
        }
        let (device_ts, payload) = bridge::split_push_frame(data, self.expected)?;
        let timestamp = clock.stamp(device_ts, Local::now());
        self.sample(payload, timestamp).await
    }

    /// Decode one composite payload, publish it and write the record
    async fn sample(&mut self, payload: &[u8], timestamp: DateTime<Local>) -> Result<()> {
        let mut buf = payload;
        let mut symbols = std::mem::take(&mut self.symbols);
        let mut failure = None;
        for sym in symbols.iter_mut() {
            if let Some(channel) = sym.adc_channel() {
                match self.can.adapter().adc_value(channel).await {
                    Ok(value) => {
                        self.state.set(&sym.name, value);
                        self.publish(&sym.name, value);
                    }
                    Err(e) => self.count_error(&LoggerError::from(e)),
                }
                continue;
            }
            // published by the broadcast listener
            if sym.skip {
                continue;
            }
            if let Err(e) = sym.read(&mut buf) {
                failure = Some(e);
                break;
            }
            let mut value = sym.float64();
            if sym.name == AD_SCANNER {
                value = self.config.ad_scanner.lambda(value);
            }
            self.state.set(&sym.name, value);
            self.publish(&sym.name, value);
        }
        self.symbols = symbols;
        if let Some(e) = failure {
            return Err(e.into());
        }
        if !buf.is_empty() {
            warn!(leftover = buf.len(), "Unread bytes in sample");
        }

        if let Some(wbl) = &self.wbl {
            let lambda = wbl.current_lambda();
            self.state.set(EXTERNAL_WBL, lambda);
            self.publish(EXTERNAL_WBL, lambda);
        }

        let order = self.record_order();
        if let Err(e) = self.writer.write(&self.state, &self.symbols, timestamp, &order) {
            self.count_error(&e);
        }

        self.captures += 1;
        self.samples_this_second += 1;
        if self.captures % COUNTER_STRIDE == 0 {
            let captures = self.captures;
            self.counters.send_modify(|c| c.captures = captures);
        }
        Ok(())
    }

    fn publish(&mut self, name: &str, value: f64) {
        if let Err(e) = self.bus.publish(name, value) {
            self.count_error(&e);
        }
    }

    /// Measurement names written ahead of the polled symbols
    fn record_order(&self) -> Vec<String> {
        let logged: HashSet<&str> = self.symbols.iter().filter(|s| is_polled(s)).map(|s| s.name.as_str()).collect();
        self.state.keys().into_iter().filter(|k| !logged.contains(k.as_str())).collect()
    }

    async fn reconfigure(&mut self, symbols: Vec<Symbol>, push: &mut Option<Subscription>) -> Result<()> {
        if let Some(sub) = push.as_mut() {
            bridge::send_raw(&self.can, bridge::STOP).await?;
            while sub.try_recv().is_some() {}
        }
        for old in &self.symbols {
            if !self.adopted.contains(&old.name) {
                self.state.delete(&old.name);
            }
        }
        self.symbols = prepare(self.protocol.ecu(), symbols);
        let result = self.configure().await;
        if push.is_some() {
            bridge::send_raw(&self.can, bridge::START).await?;
        }
        result?;
        self.emit(None, format!("logging {} symbols", self.symbols.len()));
        Ok(())
    }

    async fn serve(&mut self, req: RamRequest, push: &mut Option<Subscription>) {
        let result = self.ram_access(req.address, &req.op, push).await;
        if let Err(e) = &result {
            warn!(%e, address = %format!("0x{:06X}", req.address), "RAM request failed");
        }
        req.complete(result);
    }

    async fn ram_access(&mut self, address: u32, op: &RamOp, push: &mut Option<Subscription>) -> Result<Vec<u8>> {
        let length = match op {
            RamOp::Read { length } => *length,
            RamOp::Write { data } => data.len() as u32,
        };
        if self.protocol.ecu() == EcuKind::T8 {
            check_t8_window(address, length)?;
        }

        let Some(sub) = push.as_mut() else {
            return match op {
                RamOp::Read { length } => self.protocol.read_ram(address, *length as usize).await,
                RamOp::Write { data } => self.protocol.write_ram(address, data).await.map(|_| Vec::new()),
            };
        };

        bridge::send_raw(&self.can, bridge::STOP).await?;
        let result = bridge::ram_access(&self.can, self.protocol.ecu(), address, op).await;
        while sub.try_recv().is_some() {}
        bridge::send_raw(&self.can, bridge::START).await?;
        result
    }

    async fn teardown(&mut self, inputs: &mut EngineInputs) {
        inputs.drain();
        if self.bridge {
            if let Err(e) = bridge::send_raw(&self.can, bridge::STOP).await {
                debug!(%e, "Could not stop txbridge streaming");
            }
        }
        if let Err(e) = self.protocol.close().await {
            warn!(%e, "Session close failed");
        }
        if let Some(wbl) = self.wbl.as_mut() {
            wbl.stop();
        }
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        if let Err(e) = self.writer.close() {
            warn!(%e, path = %self.writer.path().display(), "Could not close log file");
        }
        let captures = self.captures;
        self.counters.send_modify(|c| {
            c.captures = captures;
            c.fps = 0;
        });
        info!(captures, errors = self.errors, "Logging session closed");
    }
}

/// Apply per-generation scaling
fn prepare(ecu: EcuKind, mut symbols: Vec<Symbol>) -> Vec<Symbol> {
    if ecu == EcuKind::T5 {
        for sym in &mut symbols {
            sym.correction_factor = t5_correction_factor(&sym.name);
        }
    }
    symbols
}

async fn next_frame(push: &mut Option<Subscription>) -> Option<trionic_can::CanFrame> {
    match push.as_mut() {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests;
