//! Open the configured CAN link

use std::sync::Arc;

use anyhow::{Context, Result};
use trionic_can::mock::MockCanAdapter;
use trionic_can::{CanAdapter, CanClient, TransportConfig, TxBridgeAdapter};

pub async fn open(config: &TransportConfig) -> Result<Arc<CanClient>> {
    let adapter: Arc<dyn CanAdapter> = match config {
        TransportConfig::TxBridge(bridge) => Arc::new(
            TxBridgeAdapter::connect(bridge)
                .await
                .with_context(|| format!("Failed to connect to txbridge at {}", bridge.port.as_ref().unwrap_or(&bridge.address)))?,
        ),
        #[cfg(target_os = "linux")]
        TransportConfig::SocketCan(can) => Arc::new(
            trionic_can::socketcan::SocketCanAdapter::new(can)
                .with_context(|| format!("Failed to open {}", can.interface))?,
        ),
        #[cfg(not(target_os = "linux"))]
        TransportConfig::SocketCan(_) => anyhow::bail!("SocketCAN is only available on Linux"),
        TransportConfig::Mock(mock) => Arc::new(MockCanAdapter::new(mock)),
    };
    tracing::info!(adapter = adapter.name(), "CAN link open");
    Ok(Arc::new(CanClient::new(adapter)))
}
