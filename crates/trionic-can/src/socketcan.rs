//! Raw SocketCAN adapter

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use socketcan::{CanFrame as RawFrame, CanSocket, EmbeddedFrame, ExtendedId, Frame, Socket, StandardId};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::adapter::CanAdapter;
use crate::config::SocketCanConfig;
use crate::{CanError, CanFrame};

/// Classic CAN on a Linux network interface
pub struct SocketCanAdapter {
    interface: String,
    socket: Arc<Mutex<CanSocket>>,
    connected: Arc<AtomicBool>,
    incoming_tx: broadcast::Sender<CanFrame>,
    listener_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SocketCanAdapter {
    pub fn new(config: &SocketCanConfig) -> Result<Self, CanError> {
        let socket = CanSocket::open(&config.interface).map_err(|e| {
            CanError::ConnectionFailed(format!("Failed to open {}: {}", config.interface, e))
        })?;
        socket
            .set_nonblocking(true)
            .map_err(|e| CanError::InvalidConfig(format!("Failed to set non-blocking: {}", e)))?;

        let (incoming_tx, _) = broadcast::channel(1024);
        let adapter = Self {
            interface: config.interface.clone(),
            socket: Arc::new(Mutex::new(socket)),
            connected: Arc::new(AtomicBool::new(true)),
            incoming_tx,
            listener_handle: Mutex::new(None),
        };
        adapter.start_listener();

        tracing::info!(interface = %config.interface, bitrate = config.bitrate, "SocketCAN adapter opened");
        Ok(adapter)
    }

    fn start_listener(&self) {
        let socket = self.socket.clone();
        let incoming_tx = self.incoming_tx.clone();
        let connected = self.connected.clone();

        let handle = tokio::task::spawn_blocking(move || {
            while connected.load(Ordering::SeqCst) {
                let result = socket.lock().read_frame();
                match result {
                    Ok(raw) => {
                        if raw.is_remote_frame() || raw.is_error_frame() {
                            continue;
                        }
                        let frame = CanFrame::new(raw.raw_id(), raw.data().to_vec());
                        let frame = if raw.is_extended() { frame.extended() } else { frame };
                        let _ = incoming_tx.send(frame);
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Err(e) => {
                        tracing::error!(?e, "SocketCAN read error");
                        std::thread::sleep(Duration::from_millis(100));
                    }
                }
            }
            tracing::debug!("SocketCAN listener stopped");
        });

        *self.listener_handle.lock() = Some(handle);
    }

    fn to_raw(frame: &CanFrame) -> Result<RawFrame, CanError> {
        if frame.data.len() > 8 {
            return Err(CanError::Rejected(format!(
                "{} data bytes do not fit a classic CAN frame",
                frame.data.len()
            )));
        }
        let raw = if frame.extended {
            let id = ExtendedId::new(frame.id)
                .ok_or_else(|| CanError::Rejected(format!("Invalid extended CAN ID: 0x{:X}", frame.id)))?;
            RawFrame::new(id, &frame.data)
        } else {
            let id = u16::try_from(frame.id)
                .ok()
                .and_then(StandardId::new)
                .ok_or_else(|| CanError::Rejected(format!("Invalid standard CAN ID: 0x{:X}", frame.id)))?;
            RawFrame::new(id, &frame.data)
        };
        raw.ok_or_else(|| CanError::Rejected(format!("Cannot build frame {}", frame)))
    }
}

#[async_trait]
impl CanAdapter for SocketCanAdapter {
    fn name(&self) -> &str {
        &self.interface
    }

    async fn send(&self, frame: CanFrame) -> Result<(), CanError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(CanError::ConnectionClosed);
        }
        if frame.is_system() {
            return Err(CanError::Unsupported(format!(
                "{} cannot carry bridge control frame {}",
                self.interface, frame
            )));
        }
        let raw = Self::to_raw(&frame)?;
        tracing::debug!(%frame, "SocketCAN send");
        self.socket
            .lock()
            .write_frame(&raw)
            .map_err(|e| CanError::SendFailed(e.to_string()))
    }

    fn subscribe(&self) -> broadcast::Receiver<CanFrame> {
        self.incoming_tx.subscribe()
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), CanError> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(handle) = self.listener_handle.lock().take() {
            handle.abort();
        }
        Ok(())
    }
}

impl Drop for SocketCanAdapter {
    fn drop(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}
