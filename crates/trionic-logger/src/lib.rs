//! trionic-logger - Live data acquisition for Saab Trionic ECUs
//!
//! The [`Engine`] owns one logging session: it configures the ECU, polls
//! (or receives pushed) symbol data, publishes every value on the event
//! bus and appends a record to the log file. [`DataLogger`] wraps the
//! engine with the start/stop/RAM-access surface a front end needs, and
//! [`reader`] plays recorded logs back.

pub mod config;
pub mod engine;
pub mod error;
pub mod eventbus;
pub mod facade;
pub mod reader;
pub mod request;
pub mod state;
pub mod writer;

pub use config::{AdScannerConfig, LogFormat, LoggerConfig};
pub use engine::{Counters, Engine, EngineMessage};
pub use error::{LoggerError, Result};
pub use eventbus::{Aggregator, BusSubscription, Controller};
pub use facade::DataLogger;
pub use reader::{open, LogFile, Record};
pub use request::RamRequest;
pub use state::Measurements;
pub use writer::{create_log, LogWriter, EXTERNAL_WBL};
