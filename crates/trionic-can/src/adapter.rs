//! CAN adapter trait

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::{CanError, CanFrame};

/// What an adapter can do beyond plain frame I/O
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Speaks the txbridge serial-command protocol (push mode, bridge RAM access, WBL relay)
    pub bridge: bool,
    /// Can sample its own analogue inputs
    pub adc: bool,
}

/// Link-agnostic interface to a CAN bus
///
/// An adapter owns one physical or virtual link and republishes every
/// received frame on a broadcast channel. Request/response matching and
/// per-identifier filtering live one level up in [`crate::CanClient`].
#[async_trait]
pub trait CanAdapter: Send + Sync {
    /// Short adapter name used in logs and to select bridge behaviour
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Queue a frame for transmission
    async fn send(&self, frame: CanFrame) -> Result<(), CanError>;

    /// Every frame received from now on
    fn subscribe(&self) -> broadcast::Receiver<CanFrame>;

    async fn is_connected(&self) -> bool;

    /// Read an analogue channel on the adapter itself
    async fn adc_value(&self, channel: u8) -> Result<f64, CanError> {
        Err(CanError::Unsupported(format!(
            "{} has no ADC channel {}",
            self.name(),
            channel
        )))
    }

    /// Stop background I/O. Further sends fail with `ConnectionClosed`.
    async fn close(&self) -> Result<(), CanError>;
}
