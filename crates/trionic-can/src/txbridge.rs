//! txbridge adapter
//!
//! The bridge is a small CAN gateway reachable over Wi-Fi (TCP) or USB
//! serial. Everything it says is framed with [`crate::codec`]; this adapter
//! turns those commands back into [`CanFrame`]s so callers never see the
//! difference between bus traffic and bridge control traffic.
//!
//! ```text
//!  host                                   bridge
//!  ----                                   ------
//!  CanFrame(0x242, ..)   --'t' [id][data]-->
//!  CanFrame(SYSTEM_MSG)  --raw bytes------->   ("r", "s", "7", 'd'/'R'/'W' commands)
//!                        <--'c' [id][data]--   CanFrame(id, ..)
//!                        <--'D' [ts][data]--   CanFrame(SYSTEM_MSG_DATA_RESPONSE, ..)
//!                        <--'R'/'W'/'w'/'e'--  CanFrame(SYSTEM_MSG_*, ..)
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;

use crate::adapter::{CanAdapter, Capabilities};
use crate::codec::{self, CommandDecoder, SerialCommand};
use crate::config::TxBridgeConfig;
use crate::frame::{
    SYSTEM_MSG, SYSTEM_MSG_DATA_REQUEST, SYSTEM_MSG_DATA_RESPONSE, SYSTEM_MSG_ERROR, SYSTEM_MSG_WBL_READING,
    SYSTEM_MSG_WRITE_RESPONSE,
};
use crate::{CanError, CanFrame};

/// Error code the adapter reports on `SYSTEM_MSG_ERROR` when the byte stream desyncs
pub const BRIDGE_ERR_DESYNC: u8 = 0xFE;

const ADC_TIMEOUT: Duration = Duration::from_millis(250);
const VERSION_TIMEOUT: Duration = Duration::from_secs(2);

enum Link {
    Tcp(tokio::sync::Mutex<OwnedWriteHalf>),
    #[cfg(feature = "serial")]
    Serial(Arc<Mutex<Box<dyn serialport::SerialPort>>>),
}

/// State shared between the adapter and its reader task
struct Shared {
    incoming_tx: broadcast::Sender<CanFrame>,
    version_tx: watch::Sender<Option<String>>,
    adc_pending: Mutex<HashMap<u8, oneshot::Sender<f64>>>,
}

impl Shared {
    /// Route one decoded command
    fn dispatch(&self, cmd: SerialCommand) {
        let frame = match cmd.command {
            codec::CMD_CAN_RX => {
                if cmd.data.len() < 4 {
                    tracing::warn!(len = cmd.data.len(), "Short CAN frame from bridge");
                    return;
                }
                let id = u32::from_le_bytes([cmd.data[0], cmd.data[1], cmd.data[2], cmd.data[3]]);
                CanFrame::new(id, cmd.data.slice(4..))
            }
            codec::CMD_PUSH_DATA => CanFrame::new(SYSTEM_MSG_DATA_RESPONSE, cmd.data),
            codec::CMD_READ_RAM => CanFrame::new(SYSTEM_MSG_DATA_REQUEST, cmd.data),
            codec::CMD_WRITE_RAM => CanFrame::new(SYSTEM_MSG_WRITE_RESPONSE, cmd.data),
            codec::CMD_WBL_READING => CanFrame::new(SYSTEM_MSG_WBL_READING, cmd.data),
            codec::CMD_ERROR => CanFrame::new(SYSTEM_MSG_ERROR, cmd.data),
            codec::CMD_VERSION => {
                let version = String::from_utf8_lossy(&cmd.data).trim().to_string();
                tracing::info!(%version, "txbridge firmware");
                let text = format!("txbridge firmware {}", version);
                self.version_tx.send_replace(Some(version));
                CanFrame::new(SYSTEM_MSG, text.into_bytes())
            }
            codec::CMD_ADC => {
                if cmd.data.len() < 5 {
                    tracing::warn!(len = cmd.data.len(), "Short ADC reply from bridge");
                    return;
                }
                let value = f32::from_le_bytes([cmd.data[1], cmd.data[2], cmd.data[3], cmd.data[4]]);
                if let Some(tx) = self.adc_pending.lock().remove(&cmd.data[0]) {
                    let _ = tx.send(value as f64);
                }
                return;
            }
            _ => CanFrame::new(SYSTEM_MSG, cmd.data),
        };
        let _ = self.incoming_tx.send(frame);
    }

    fn feed(&self, decoder: &mut CommandDecoder, chunk: &[u8]) {
        for result in decoder.decode(chunk) {
            match result {
                Ok(cmd) => self.dispatch(cmd),
                Err(e) => {
                    tracing::warn!(%e, "txbridge stream desync");
                    let _ = self
                        .incoming_tx
                        .send(CanFrame::new(SYSTEM_MSG_ERROR, vec![BRIDGE_ERR_DESYNC]));
                }
            }
        }
    }
}

/// CAN adapter backed by a txbridge
pub struct TxBridgeAdapter {
    name: String,
    link: Link,
    shared: Arc<Shared>,
    connected: Arc<AtomicBool>,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TxBridgeAdapter {
    /// Open the link and, unless disabled, refuse firmware older than
    /// [`codec::MIN_BRIDGE_FIRMWARE`].
    pub async fn connect(config: &TxBridgeConfig) -> Result<Self, CanError> {
        let adapter = match &config.port {
            Some(port) => Self::open_serial(port, config)?,
            None => Self::open_tcp(config).await?,
        };
        if config.check_version {
            let version = adapter.query_version(VERSION_TIMEOUT).await?;
            if !codec::bridge_version_ok(&version) {
                adapter.close().await?;
                return Err(CanError::ConnectionFailed(format!(
                    "txbridge firmware {} is older than {}",
                    version,
                    codec::MIN_BRIDGE_FIRMWARE
                )));
            }
        }
        Ok(adapter)
    }

    fn new_shared() -> Arc<Shared> {
        let (incoming_tx, _) = broadcast::channel(1024);
        let (version_tx, _) = watch::channel(None);
        Arc::new(Shared {
            incoming_tx,
            version_tx,
            adc_pending: Mutex::new(HashMap::new()),
        })
    }

    async fn open_tcp(config: &TxBridgeConfig) -> Result<Self, CanError> {
        let timeout = Duration::from_millis(config.connect_timeout_ms);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&config.address))
            .await
            .map_err(|_| CanError::ConnectionFailed(format!("{}: connect timed out", config.address)))?
            .map_err(|e| CanError::ConnectionFailed(format!("{}: {}", config.address, e)))?;
        let _ = stream.set_nodelay(true);
        let (mut reader, writer) = stream.into_split();

        let shared = Self::new_shared();
        let connected = Arc::new(AtomicBool::new(true));

        let task_shared = shared.clone();
        let task_connected = connected.clone();
        let address = config.address.clone();
        let handle = tokio::spawn(async move {
            let mut decoder = CommandDecoder::default();
            let mut buf = [0u8; 512];
            while task_connected.load(Ordering::SeqCst) {
                match reader.read(&mut buf).await {
                    Ok(0) => {
                        tracing::error!(%address, "txbridge closed the connection");
                        break;
                    }
                    Ok(n) => task_shared.feed(&mut decoder, &buf[..n]),
                    Err(e) => {
                        tracing::error!(%address, ?e, "txbridge read error");
                        break;
                    }
                }
            }
            task_connected.store(false, Ordering::SeqCst);
            tracing::debug!("txbridge reader stopped");
        });

        tracing::info!(address = %config.address, "txbridge connected");
        Ok(Self {
            name: "txbridge".to_string(),
            link: Link::Tcp(tokio::sync::Mutex::new(writer)),
            shared,
            connected,
            reader_handle: Mutex::new(Some(handle)),
        })
    }

    #[cfg(feature = "serial")]
    fn open_serial(port: &str, config: &TxBridgeConfig) -> Result<Self, CanError> {
        let serial = serialport::new(port, config.baud_rate)
            .timeout(Duration::from_millis(10))
            .open()
            .map_err(|e| CanError::ConnectionFailed(format!("{}: {}", port, e)))?;
        let reader = serial
            .try_clone()
            .map_err(|e| CanError::ConnectionFailed(format!("{}: {}", port, e)))?;

        let shared = Self::new_shared();
        let connected = Arc::new(AtomicBool::new(true));

        let task_shared = shared.clone();
        let task_connected = connected.clone();
        let handle = tokio::task::spawn_blocking(move || {
            use std::io::Read;
            let mut reader = reader;
            let mut decoder = CommandDecoder::default();
            let mut buf = [0u8; 512];
            while task_connected.load(Ordering::SeqCst) {
                match reader.read(&mut buf) {
                    Ok(0) => std::thread::sleep(Duration::from_millis(1)),
                    Ok(n) => task_shared.feed(&mut decoder, &buf[..n]),
                    Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                    Err(e) => {
                        tracing::error!(?e, "txbridge serial read error");
                        break;
                    }
                }
            }
            task_connected.store(false, Ordering::SeqCst);
            tracing::debug!("txbridge reader stopped");
        });

        tracing::info!(%port, baud = config.baud_rate, "txbridge opened");
        Ok(Self {
            name: "txbridge".to_string(),
            link: Link::Serial(Arc::new(Mutex::new(serial))),
            shared,
            connected,
            reader_handle: Mutex::new(Some(handle)),
        })
    }

    #[cfg(not(feature = "serial"))]
    fn open_serial(port: &str, _config: &TxBridgeConfig) -> Result<Self, CanError> {
        Err(CanError::Unsupported(format!(
            "{}: serial txbridge requires the 'serial' feature",
            port
        )))
    }

    async fn write_raw(&self, bytes: &[u8]) -> Result<(), CanError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(CanError::ConnectionClosed);
        }
        match &self.link {
            Link::Tcp(writer) => writer
                .lock()
                .await
                .write_all(bytes)
                .await
                .map_err(|e| CanError::BusError(e.to_string())),
            #[cfg(feature = "serial")]
            Link::Serial(port) => {
                use std::io::Write;
                port.lock()
                    .write_all(bytes)
                    .map_err(|e| CanError::BusError(e.to_string()))
            }
        }
    }

    pub async fn send_command(&self, cmd: &SerialCommand) -> Result<(), CanError> {
        self.write_raw(&cmd.encode()?).await
    }

    /// Firmware version reported by the bridge, if it has answered yet
    pub fn version(&self) -> Option<String> {
        self.shared.version_tx.borrow().clone()
    }

    pub async fn query_version(&self, timeout: Duration) -> Result<String, CanError> {
        let mut rx = self.shared.version_tx.subscribe();
        let _ = rx.borrow_and_update();
        self.send_command(&SerialCommand::new(codec::CMD_VERSION, Bytes::new()))
            .await?;
        let wait = async {
            rx.changed().await.ok()?;
            rx.borrow().clone()
        };
        tokio::time::timeout(timeout, wait)
            .await
            .ok()
            .flatten()
            .ok_or_else(|| CanError::Timeout("txbridge did not report its version".to_string()))
    }

    fn encode_can(frame: &CanFrame) -> Result<SerialCommand, CanError> {
        if frame.data.len() > 8 {
            return Err(CanError::Rejected(format!(
                "{} data bytes do not fit a classic CAN frame",
                frame.data.len()
            )));
        }
        let mut data = BytesMut::with_capacity(4 + frame.data.len());
        data.put_u32_le(frame.id);
        data.put_slice(&frame.data);
        Ok(SerialCommand::new(codec::CMD_CAN_TX, data.freeze()))
    }
}

#[async_trait]
impl CanAdapter for TxBridgeAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { bridge: true, adc: true }
    }

    async fn send(&self, frame: CanFrame) -> Result<(), CanError> {
        tracing::debug!(%frame, "txbridge send");
        if frame.id == SYSTEM_MSG {
            // control traffic is already in bridge format
            return self.write_raw(&frame.data).await;
        }
        if frame.is_system() {
            return Err(CanError::Rejected(format!("{} is receive-only", frame)));
        }
        self.send_command(&Self::encode_can(&frame)?).await
    }

    fn subscribe(&self) -> broadcast::Receiver<CanFrame> {
        self.shared.incoming_tx.subscribe()
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn adc_value(&self, channel: u8) -> Result<f64, CanError> {
        let (tx, rx) = oneshot::channel();
        self.shared.adc_pending.lock().insert(channel, tx);
        if let Err(e) = self.send_command(&SerialCommand::new(codec::CMD_ADC, vec![channel])).await {
            self.shared.adc_pending.lock().remove(&channel);
            return Err(e);
        }
        match tokio::time::timeout(ADC_TIMEOUT, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(CanError::ConnectionClosed),
            Err(_) => {
                self.shared.adc_pending.lock().remove(&channel);
                Err(CanError::Timeout(format!("ADC channel {}", channel)))
            }
        }
    }

    async fn close(&self) -> Result<(), CanError> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(handle) = self.reader_handle.lock().take() {
            handle.abort();
        }
        if let Link::Tcp(writer) = &self.link {
            let _ = writer.lock().await.shutdown().await;
        }
        tracing::info!("txbridge closed");
        Ok(())
    }
}

impl Drop for TxBridgeAdapter {
    fn drop(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(handle) = self.reader_handle.lock().take() {
            handle.abort();
        }
    }
}
