//! trionic-wbl - wideband lambda sensors
//!
//! Each supported controller has a pure decoder ([`ecumaster`],
//! [`innovate`], [`aem`], [`plx`], [`zeitronix`]) and [`Wideband`] runs one of them
//! against its data source: the shared CAN bus, a serial port, or readings
//! relayed by the txbridge.
//!
//! ```text
//!   CAN 0x664/0x665/0x180 ──┐
//!   serial port ────────────┼──► Decoder ──► current_lambda()
//!   SYSTEM_MSG_WBL_READING ─┘
//! ```

pub mod aem;
pub mod config;
pub mod ecumaster;
pub mod error;
pub mod innovate;
pub mod plx;
pub mod zeitronix;

pub use config::{WblConfig, WblKind, WblSource};
pub use error::{Result, WblError};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use trionic_can::{CanClient, CanFrame, SYSTEM_MSG, SYSTEM_MSG_WBL_READING};

/// One decoder per supported controller
#[derive(Debug)]
pub enum Decoder {
    Ecumaster(ecumaster::LambdaToCan),
    Innovate(innovate::Isp2),
    Aem(aem::AemUego),
    Plx(plx::Imfd),
    Zeitronix(zeitronix::Zt2),
}

impl Decoder {
    pub fn new(kind: WblKind) -> Option<Self> {
        match kind {
            WblKind::Ecu | WblKind::None => None,
            WblKind::Ecumaster => Some(Decoder::Ecumaster(ecumaster::LambdaToCan::new())),
            WblKind::Innovate => Some(Decoder::Innovate(innovate::Isp2::new())),
            WblKind::Aem => Some(Decoder::Aem(aem::AemUego::new())),
            WblKind::Plx => Some(Decoder::Plx(plx::Imfd::new())),
            WblKind::Zeitronix => Some(Decoder::Zeitronix(zeitronix::Zt2::new())),
        }
    }

    pub fn lambda(&self) -> f64 {
        match self {
            Decoder::Ecumaster(d) => d.lambda(),
            Decoder::Innovate(d) => d.lambda(),
            Decoder::Aem(d) => d.lambda(),
            Decoder::Plx(d) => d.lambda(),
            Decoder::Zeitronix(d) => d.lambda(),
        }
    }

    fn set_lambda(&mut self, lambda: f64) {
        match self {
            Decoder::Ecumaster(d) => d.set_lambda(lambda),
            Decoder::Innovate(d) => d.set_lambda(lambda),
            Decoder::Aem(d) => d.set_lambda(lambda),
            Decoder::Plx(d) => d.set_lambda(lambda),
            Decoder::Zeitronix(d) => d.set_lambda(lambda),
        }
    }

    /// Bytes from a serial stream
    pub fn feed_serial(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Decoder::Innovate(d) => {
                d.feed(data);
                Ok(())
            }
            Decoder::Aem(d) => {
                d.feed(data);
                Ok(())
            }
            Decoder::Plx(d) => d.feed(data),
            Decoder::Zeitronix(d) => {
                d.feed(data);
                Ok(())
            }
            Decoder::Ecumaster(_) => Err(WblError::Unsupported("Ecumaster has no serial stream".to_string())),
        }
    }

    pub fn feed_can(&mut self, frame: &CanFrame) -> Result<()> {
        match self {
            Decoder::Ecumaster(d) => d.decode(frame.id, &frame.data),
            Decoder::Aem(d) if frame.id == aem::CAN_ID => {
                if !frame.extended {
                    return Ok(());
                }
                d.decode_can(&frame.data)
            }
            _ => Err(WblError::UnknownIdentifier(frame.id)),
        }
    }

    /// Identifiers the sensor broadcasts on
    pub fn can_ids(&self) -> &'static [u32] {
        match self {
            Decoder::Ecumaster(_) => &[ecumaster::STATUS_ID, ecumaster::DETAIL_ID],
            Decoder::Aem(_) => &[aem::CAN_ID],
            _ => &[],
        }
    }

    /// Selector the txbridge expects in `w 1 <c> <c>`
    fn bridge_selector(&self) -> Option<u8> {
        match self {
            Decoder::Innovate(_) => Some(b'i'),
            Decoder::Aem(_) => Some(b'a'),
            Decoder::Plx(_) => Some(b'p'),
            Decoder::Zeitronix(_) => Some(b'z'),
            Decoder::Ecumaster(_) => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Decoder::Ecumaster(d) => d.to_string(),
            Decoder::Innovate(d) => format!(
                "AFR stoich: {:.1}, AFR: {:.3}, λ: {:.3} - {:?}",
                d.afr_multiplier(),
                d.afr(),
                d.lambda(),
                d.status()
            ),
            Decoder::Aem(d) => format!("Lambda: {:.4}, Oxygen: {:.3}, Voltage: {:.1}", d.lambda(), d.oxygen(), d.voltage()),
            Decoder::Plx(d) => format!("λ: {:.3}", d.lambda()),
            Decoder::Zeitronix(d) => d.to_string(),
        }
    }

    /// A reading relayed by the txbridge: the ZT-2 packet as received,
    /// a little-endian f32 λ for the others
    pub fn feed_relay(&mut self, data: &[u8]) -> Result<()> {
        if let Decoder::Zeitronix(d) = self {
            return d.decode(data);
        }
        let lambda = bridge_lambda(data)
            .ok_or_else(|| WblError::InvalidPacket(format!("relayed reading of {} bytes", data.len())))?;
        self.set_lambda(lambda);
        Ok(())
    }
}

/// A running wideband sensor
pub struct Wideband {
    kind: WblKind,
    source: WblSource,
    decoder: Arc<Mutex<Decoder>>,
    running: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Wideband {
    /// `None` when `config` selects no external sensor
    pub fn new(config: &WblConfig) -> Result<Option<Self>> {
        let Some(decoder) = Decoder::new(config.kind) else {
            return Ok(None);
        };
        Ok(Some(Self {
            kind: config.kind,
            source: config.source()?,
            decoder: Arc::new(Mutex::new(decoder)),
            running: Arc::new(AtomicBool::new(false)),
            tasks: Vec::new(),
        }))
    }

    pub fn kind(&self) -> WblKind {
        self.kind
    }

    pub fn source(&self) -> &WblSource {
        &self.source
    }

    pub fn current_lambda(&self) -> f64 {
        self.decoder.lock().lambda()
    }

    pub fn describe(&self) -> String {
        self.decoder.lock().describe()
    }

    /// Decode a frame the caller picked up itself
    pub fn feed_frame(&self, frame: &CanFrame) -> Result<()> {
        self.decoder.lock().feed_can(frame)
    }

    pub async fn start(&mut self, can: &Arc<CanClient>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = match self.source.clone() {
            WblSource::Can => {
                self.start_can(can);
                Ok(())
            }
            WblSource::Bridge => self.start_bridge(can).await,
            WblSource::Serial { port, baud_rate } => self.start_serial(&port, baud_rate),
        };
        if result.is_err() {
            self.running.store(false, Ordering::SeqCst);
        } else {
            info!(kind = %self.kind, source = ?self.source, "Wideband started");
        }
        result
    }

    fn start_can(&mut self, can: &Arc<CanClient>) {
        let ids = self.decoder.lock().can_ids();
        let mut sub = can.subscribe(ids);
        let decoder = self.decoder.clone();
        let running = self.running.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(frame) = sub.recv().await {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = decoder.lock().feed_can(&frame) {
                    debug!(%e, "Wideband frame not decoded");
                }
            }
            debug!("Wideband CAN reader stopped");
        }));
    }

    async fn start_bridge(&mut self, can: &Arc<CanClient>) -> Result<()> {
        if !can.is_bridge() {
            return Err(WblError::InvalidConfig(
                "txbridge port is selected but the adapter is not a txbridge".to_string(),
            ));
        }
        let selector = self
            .decoder
            .lock()
            .bridge_selector()
            .ok_or_else(|| WblError::Unsupported(format!("{} cannot be relayed by the txbridge", self.kind)))?;

        let mut sub = can.subscribe(&[SYSTEM_MSG_WBL_READING]);
        can.send(CanFrame::new(SYSTEM_MSG, vec![b'w', 1, selector, selector]))
            .await?;

        let decoder = self.decoder.clone();
        let running = self.running.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(frame) = sub.recv().await {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = decoder.lock().feed_relay(&frame.data) {
                    warn!(%e, "Could not decode WBL value");
                }
            }
            debug!("Wideband relay reader stopped");
        }));
        Ok(())
    }

    #[cfg(feature = "serial")]
    fn start_serial(&mut self, port: &str, baud_rate: u32) -> Result<()> {
        use std::io::Read;
        use std::time::Duration;

        let mut serial = serialport::new(port, baud_rate)
            .timeout(Duration::from_millis(20))
            .open()
            .map_err(|e| WblError::Serial(format!("{}: {}", port, e)))?;

        let decoder = self.decoder.clone();
        let running = self.running.clone();
        let name = port.to_string();
        self.tasks.push(tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 64];
            while running.load(Ordering::SeqCst) {
                match serial.read(&mut buf) {
                    Ok(0) => {}
                    Ok(n) => {
                        if let Err(e) = decoder.lock().feed_serial(&buf[..n]) {
                            debug!(%e, "Wideband bytes not decoded");
                        }
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                    Err(e) => {
                        tracing::error!(port = %name, ?e, "Wideband serial read error");
                        break;
                    }
                }
            }
            debug!(port = %name, "Wideband serial reader stopped");
        }));
        Ok(())
    }

    #[cfg(not(feature = "serial"))]
    fn start_serial(&mut self, port: &str, _baud_rate: u32) -> Result<()> {
        Err(WblError::Unsupported(format!(
            "{}: serial wideband requires the 'serial' feature",
            port
        )))
    }

    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!(kind = %self.kind, "Wideband stopped");
    }
}

impl Drop for Wideband {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Relayed readings are a little-endian f32 lambda
fn bridge_lambda(data: &[u8]) -> Option<f64> {
    let bytes: [u8; 4] = data.get(..4)?.try_into().ok()?;
    let lambda = f64::from(f32::from_le_bytes(bytes));
    lambda.is_finite().then_some(lambda)
}
