//! CAN transport configuration

use serde::{Deserialize, Serialize};

// =============================================================================
// Transport Configuration
// =============================================================================

/// Which link to open
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Raw SocketCAN (Linux only)
    SocketCan(SocketCanConfig),
    /// txbridge over TCP or USB serial
    TxBridge(TxBridgeConfig),
    /// Scripted adapter for testing
    Mock(MockConfig),
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Mock(MockConfig::default())
    }
}

impl TransportConfig {
    pub fn is_bridge(&self) -> bool {
        match self {
            TransportConfig::TxBridge(_) => true,
            TransportConfig::Mock(m) => m.bridge,
            TransportConfig::SocketCan(_) => false,
        }
    }
}

/// SocketCAN configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketCanConfig {
    /// CAN interface name (e.g., "can0")
    pub interface: String,
    /// Bus bitrate, informational; the interface is configured outside the process
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
}

fn default_bitrate() -> u32 {
    500_000
}

/// txbridge configuration. `port` wins over `address` when both are set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxBridgeConfig {
    /// TCP endpoint of the bridge's Wi-Fi access point
    #[serde(default = "default_bridge_address")]
    pub address: String,
    /// USB serial device (requires the `serial` feature)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(default = "default_bridge_baud")]
    pub baud_rate: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Refuse bridges older than [`crate::codec::MIN_BRIDGE_FIRMWARE`]
    #[serde(default = "default_true")]
    pub check_version: bool,
}

impl Default for TxBridgeConfig {
    fn default() -> Self {
        Self {
            address: default_bridge_address(),
            port: None,
            baud_rate: default_bridge_baud(),
            connect_timeout_ms: default_connect_timeout(),
            check_version: true,
        }
    }
}

/// `TXBRIDGE_ADDRESS` overrides the compiled-in default
fn default_bridge_address() -> String {
    std::env::var("TXBRIDGE_ADDRESS").unwrap_or_else(|_| "192.168.4.1:1337".to_string())
}

fn default_bridge_baud() -> u32 {
    1_000_000
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

/// Mock transport configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockConfig {
    /// Simulated latency in milliseconds
    #[serde(default)]
    pub latency_ms: u64,
    /// Pretend to be a txbridge
    #[serde(default)]
    pub bridge: bool,
}

// =============================================================================
// Client Configuration
// =============================================================================

/// Subscription and timing knobs for [`crate::CanClient`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Per-subscriber queue depth; frames beyond it are dropped
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: default_subscriber_capacity(),
        }
    }
}

fn default_subscriber_capacity() -> usize {
    20
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tagged_transport() {
        let cfg: TransportConfig = toml::from_str(
            r#"
            type = "txbridge"
            address = "10.0.0.2:1337"
            "#,
        )
        .unwrap();
        match cfg {
            TransportConfig::TxBridge(b) => {
                assert_eq!(b.address, "10.0.0.2:1337");
                assert!(b.check_version);
                assert!(b.port.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }

        let cfg: TransportConfig = toml::from_str("type = \"socketcan\"\ninterface = \"can0\"").unwrap();
        assert!(!cfg.is_bridge());
    }
}
