//! Data logger façade
//!
//! The handful of verbs a UI needs: start and stop a session, swap the
//! symbol list, and peek or poke ECU RAM while logging.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use trionic_can::CanClient;
use trionic_core::Symbol;
use trionic_wbl::Wideband;

use crate::config::LoggerConfig;
use crate::engine::{Counters, Engine, EngineInputs, EngineMessage};
use crate::error::{LoggerError, Result};
use crate::eventbus::{BusSubscription, Controller};
use crate::request::RamRequest;
use crate::state::Measurements;
use crate::writer::create_log;

const MESSAGE_CAPACITY: usize = 64;

/// Handles to a running engine
struct Session {
    symbols: mpsc::Sender<Vec<Symbol>>,
    reads: mpsc::Sender<RamRequest>,
    writes: mpsc::Sender<RamRequest>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

pub struct DataLogger {
    config: LoggerConfig,
    bus: Controller,
    state: Measurements,
    session: Mutex<Option<Session>>,
    counters: Arc<watch::Sender<Counters>>,
    messages: broadcast::Sender<EngineMessage>,
    closed: AtomicBool,
}

impl DataLogger {
    pub fn new(config: LoggerConfig, bus: Controller) -> Self {
        let (messages, _) = broadcast::channel(MESSAGE_CAPACITY);
        Self {
            config,
            bus,
            state: Measurements::new(),
            session: Mutex::new(None),
            counters: Arc::new(watch::channel(Counters::default()).0),
            messages,
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &LoggerConfig {
        &self.config
    }

    pub fn bus(&self) -> &Controller {
        &self.bus
    }

    pub fn state(&self) -> &Measurements {
        &self.state
    }

    pub fn subscribe(&self, topic: &str) -> BusSubscription {
        self.bus.subscribe(topic)
    }

    pub fn counters(&self) -> watch::Receiver<Counters> {
        self.counters.subscribe()
    }

    pub fn messages(&self) -> broadcast::Receiver<EngineMessage> {
        self.messages.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.session.lock().as_ref().is_some_and(|s| !s.task.is_finished())
    }

    /// Open a log file and spawn the engine over `can`
    pub fn start(&self, can: Arc<CanClient>, symbols: Vec<Symbol>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LoggerError::BusClosed);
        }
        let mut session = self.session.lock();
        if session.as_ref().is_some_and(|s| !s.task.is_finished()) {
            return Err(LoggerError::AlreadyRunning);
        }

        let wbl = Wideband::new(&self.config.wbl)?;
        let writer = create_log(
            &self.config.log_dir,
            &self.config.log_prefix,
            self.config.ecu,
            self.config.format,
        )?;
        self.state.clear();
        self.counters.send_replace(Counters::default());

        let (symbols_tx, symbols_rx) = mpsc::channel(1);
        let (reads_tx, reads_rx) = mpsc::channel(1);
        let (writes_tx, writes_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(ecu = %self.config.ecu, adapter = can.adapter_name(), symbols = symbols.len(), "Starting logging session");
        let engine = Engine::new(
            self.config.clone(),
            can,
            self.bus.clone(),
            self.state.clone(),
            symbols,
            writer,
            wbl,
            self.counters.clone(),
            self.messages.clone(),
        );
        let task = tokio::spawn(engine.run(EngineInputs {
            symbols: symbols_rx,
            reads: reads_rx,
            writes: writes_rx,
            shutdown: shutdown_rx,
        }));

        *session = Some(Session {
            symbols: symbols_tx,
            reads: reads_tx,
            writes: writes_tx,
            shutdown: shutdown_tx,
            task,
        });
        Ok(())
    }

    /// Signal the engine and wait for its teardown. Returns the session result.
    pub async fn stop(&self) -> Result<()> {
        let Some(session) = self.session.lock().take() else {
            return Ok(());
        };
        let _ = session.shutdown.send(true);
        join(session.task).await
    }

    /// Wait until the session ends on its own, then collect its result
    pub async fn wait(&self) -> Result<()> {
        let Some(mut shutdown) = self.session.lock().as_ref().map(|s| s.shutdown.subscribe()) else {
            return Ok(());
        };
        loop {
            if !self.is_running() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
            }
        }
        self.stop().await
    }

    /// Replace the logged symbols. `Pending` while a previous list is queued.
    pub fn set_symbols(&self, symbols: Vec<Symbol>) -> Result<()> {
        let guard = self.session.lock();
        let session = guard.as_ref().ok_or(LoggerError::NotRunning)?;
        session.symbols.try_send(symbols).map_err(queue_error)
    }

    pub async fn get_ram(&self, address: u32, length: u32) -> Result<Vec<u8>> {
        let (req, reply) = RamRequest::read(address, length);
        self.with_session(|s| s.reads.try_send(req).map_err(queue_error))?;
        reply.wait().await
    }

    pub async fn set_ram(&self, address: u32, data: Vec<u8>) -> Result<()> {
        let (req, reply) = RamRequest::write(address, data);
        self.with_session(|s| s.writes.try_send(req).map_err(queue_error))?;
        reply.wait().await.map(|_| ())
    }

    fn with_session<T>(&self, f: impl FnOnce(&Session) -> Result<T>) -> Result<T> {
        let guard = self.session.lock();
        let session = guard.as_ref().ok_or(LoggerError::NotRunning)?;
        f(session)
    }

    /// Stop any session and shut the bus down. Safe to call more than once.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.stop().await;
        self.bus.close();
        result
    }
}

fn queue_error<T>(e: TrySendError<T>) -> LoggerError {
    match e {
        TrySendError::Full(_) => LoggerError::Pending,
        TrySendError::Closed(_) => LoggerError::NotRunning,
    }
}

async fn join(task: JoinHandle<Result<()>>) -> Result<()> {
    match task.await {
        Ok(result) => result,
        Err(e) => {
            warn!(%e, "Engine task panicked");
            Err(LoggerError::Aborted(e.to_string()))
        }
    }
}
