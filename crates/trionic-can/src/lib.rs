//! trionic-can - CAN transport and diagnostic clients for Saab Trionic ECUs
//!
//! Adapters own a link and publish every received frame. [`CanClient`]
//! routes those frames to per-identifier subscriptions, and the protocol
//! clients build request/response exchanges on top of it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │   KwpClient (T7)     GmlanClient (T8)      T5Client         │
//! │   chained frames     ISO-TP                RAM pokes        │
//! │         └──────────────────┼──────────────────┘             │
//! │                      ┌─────┴─────┐                          │
//! │                      │ CanClient │  subscribe / send / wait │
//! │                      └─────┬─────┘                          │
//! │                   ┌────────┴────────┐                       │
//! │                   │   CanAdapter    │                       │
//! │                   └────────┬────────┘                       │
//! │        ┌───────────────────┼───────────────────┐            │
//! │   SocketCAN          txbridge (TCP/USB)       mock          │
//! │                      serial-command codec                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod adapter;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod frame;
pub mod gmlan;
pub mod kwp2000;
pub mod mock;
pub mod nrc;
pub mod t5;
pub mod txbridge;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;

pub use adapter::{CanAdapter, Capabilities};
pub use client::{CanClient, Subscription};
pub use config::{ClientConfig, MockConfig, SocketCanConfig, TransportConfig, TxBridgeConfig};
pub use error::{CanError, CodecError, ProtocolError};
pub use frame::{
    CanFrame, FrameKind, SYSTEM_MSG, SYSTEM_MSG_DATA_REQUEST, SYSTEM_MSG_DATA_RESPONSE, SYSTEM_MSG_ERROR,
    SYSTEM_MSG_WBL_READING, SYSTEM_MSG_WRITE_RESPONSE,
};
pub use gmlan::GmlanClient;
pub use kwp2000::KwpClient;
pub use nrc::NegativeResponseCode;
pub use t5::T5Client;
pub use txbridge::TxBridgeAdapter;

use std::sync::Arc;

/// Open the link described by `config`
pub async fn create_adapter(config: &TransportConfig) -> Result<Arc<dyn CanAdapter>, CanError> {
    match config {
        #[cfg(all(target_os = "linux", feature = "socketcan"))]
        TransportConfig::SocketCan(cfg) => {
            let adapter = socketcan::SocketCanAdapter::new(cfg)?;
            Ok(Arc::new(adapter))
        }
        #[cfg(not(all(target_os = "linux", feature = "socketcan")))]
        TransportConfig::SocketCan(_) => Err(CanError::Unsupported(
            "SocketCAN requires Linux and the 'socketcan' feature".to_string(),
        )),
        TransportConfig::TxBridge(cfg) => {
            let adapter = txbridge::TxBridgeAdapter::connect(cfg).await?;
            Ok(Arc::new(adapter))
        }
        TransportConfig::Mock(cfg) => {
            let adapter = mock::MockCanAdapter::new(cfg);
            Ok(Arc::new(adapter))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_mock_adapter() {
        let adapter = create_adapter(&TransportConfig::Mock(MockConfig {
            bridge: true,
            ..Default::default()
        }))
        .await
        .unwrap();
        assert_eq!(adapter.name(), "txbridge-mock");
        assert!(adapter.capabilities().bridge);
    }
}
