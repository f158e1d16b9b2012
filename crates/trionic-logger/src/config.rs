//! Logger configuration
//!
//! Loaded from TOML or YAML; the file extension picks the format.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use trionic_can::TransportConfig;
use trionic_core::EcuKind;
use trionic_wbl::WblConfig;

use crate::error::{LoggerError, Result};

/// Log file flavour
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Pipe-delimited `.t5l`/`.t7l`/`.t8l`
    #[default]
    Txl,
    Csv,
}

impl std::str::FromStr for LogFormat {
    type Err = LoggerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "txl" | "t5l" | "t7l" | "t8l" => Ok(LogFormat::Txl),
            "csv" => Ok(LogFormat::Csv),
            other => Err(LoggerError::Config(format!("unknown log format '{}'", other))),
        }
    }
}

/// Voltage → lambda mapping for a wideband wired to the ECU's AD scanner input
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdScannerConfig {
    #[serde(default = "default_min_voltage")]
    pub min_voltage: f64,
    #[serde(default = "default_max_voltage")]
    pub max_voltage: f64,
    /// Lambda at `min_voltage`
    #[serde(default = "default_low_lambda")]
    pub low_lambda: f64,
    /// Lambda at `max_voltage`
    #[serde(default = "default_high_lambda")]
    pub high_lambda: f64,
}

impl Default for AdScannerConfig {
    fn default() -> Self {
        Self {
            min_voltage: default_min_voltage(),
            max_voltage: default_max_voltage(),
            low_lambda: default_low_lambda(),
            high_lambda: default_high_lambda(),
        }
    }
}

impl AdScannerConfig {
    /// Convert a raw 10-bit scanner reading
    pub fn lambda(&self, raw: f64) -> f64 {
        let span = self.max_voltage - self.min_voltage;
        if span <= 0.0 {
            return self.low_lambda;
        }
        let voltage = ((raw / 1023.0) * span).clamp(self.min_voltage, self.max_voltage);
        let steepness = (self.high_lambda - self.low_lambda) / span;
        self.low_lambda + steepness * (voltage - self.min_voltage)
    }
}

fn default_min_voltage() -> f64 {
    0.0
}

fn default_max_voltage() -> f64 {
    5.0
}

fn default_low_lambda() -> f64 {
    0.5
}

fn default_high_lambda() -> f64 {
    1.5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggerConfig {
    #[serde(default = "default_ecu")]
    pub ecu: EcuKind,
    /// Samples per second in pull mode
    #[serde(default = "default_rate")]
    pub rate: u32,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// File name prefix, usually the firmware file name
    #[serde(default = "default_log_prefix")]
    pub log_prefix: String,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub wbl: WblConfig,
    #[serde(default)]
    pub ad_scanner: AdScannerConfig,
    /// Symbol names to log
    #[serde(default)]
    pub symbols: Vec<String>,
    /// How long to watch for T7 broadcast frames before configuring symbols
    #[serde(default = "default_broadcast_window")]
    pub broadcast_window_ms: u64,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            ecu: default_ecu(),
            rate: default_rate(),
            log_dir: default_log_dir(),
            log_prefix: default_log_prefix(),
            format: LogFormat::default(),
            transport: TransportConfig::default(),
            wbl: WblConfig::default(),
            ad_scanner: AdScannerConfig::default(),
            symbols: Vec::new(),
            broadcast_window_ms: default_broadcast_window(),
        }
    }
}

fn default_ecu() -> EcuKind {
    EcuKind::T7
}

fn default_rate() -> u32 {
    25
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_prefix() -> String {
    "log".to_string()
}

fn default_broadcast_window() -> u64 {
    1550
}

impl LoggerConfig {
    /// Parse `content` as YAML when `path` ends in `.yaml`/`.yml`, TOML otherwise
    pub fn parse(path: &Path, content: &str) -> Result<Self> {
        let config: LoggerConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => {
                serde_yaml::from_str(content).map_err(|e| LoggerError::Config(format!("{}: {}", path.display(), e)))?
            }
            _ => toml::from_str(content).map_err(|e| LoggerError::Config(format!("{}: {}", path.display(), e)))?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(path, &content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rate == 0 || self.rate > 1000 {
            return Err(LoggerError::Config(format!("rate {} out of range 1..=1000", self.rate)));
        }
        Ok(())
    }

    /// Extension of the log files this configuration produces
    pub fn log_extension(&self) -> &'static str {
        match self.format {
            LogFormat::Txl => self.ecu.log_extension(),
            LogFormat::Csv => "csv",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use trionic_wbl::WblKind;

    #[test]
    fn test_defaults() {
        let cfg = LoggerConfig::parse(Path::new("logger.toml"), "").unwrap();
        assert_eq!(cfg.ecu, EcuKind::T7);
        assert_eq!(cfg.rate, 25);
        assert_eq!(cfg.format, LogFormat::Txl);
        assert_eq!(cfg.log_extension(), "t7l");
        assert_eq!(cfg.wbl.kind, WblKind::None);
    }

    #[test]
    fn test_toml() {
        let toml = r#"
ecu = "t8"
rate = 40
format = "csv"
symbols = ["ActualIn.n_Engine", "In.v_Vehicle"]

[transport]
type = "txbridge"
address = "10.0.0.2:1337"

[wbl]
kind = "Ecumaster"

[ad_scanner]
max_voltage = 4.5
"#;
        let cfg = LoggerConfig::parse(Path::new("logger.toml"), toml).unwrap();
        assert_eq!(cfg.ecu, EcuKind::T8);
        assert_eq!(cfg.rate, 40);
        assert_eq!(cfg.log_extension(), "csv");
        assert!(cfg.transport.is_bridge());
        assert_eq!(cfg.wbl.kind, WblKind::Ecumaster);
        assert_eq!(cfg.ad_scanner.max_voltage, 4.5);
        assert_eq!(cfg.ad_scanner.min_voltage, 0.0);
        assert_eq!(cfg.symbols.len(), 2);
    }

    #[test]
    fn test_yaml() {
        let yaml = "ecu: t5\nrate: 10\nwbl:\n  kind: Innovate\n  port: /dev/ttyUSB0\n";
        let cfg = LoggerConfig::parse(Path::new("logger.yaml"), yaml).unwrap();
        assert_eq!(cfg.ecu, EcuKind::T5);
        assert_eq!(cfg.wbl.kind, WblKind::Innovate);
        assert_eq!(cfg.log_extension(), "t5l");
    }

    #[test]
    fn test_invalid_rate() {
        assert!(LoggerConfig::parse(Path::new("x.toml"), "rate = 0").is_err());
    }

    #[test]
    fn test_ad_scanner() {
        let ad = AdScannerConfig::default();
        assert_eq!(ad.lambda(0.0), 0.5);
        assert!((ad.lambda(1023.0) - 1.5).abs() < 1e-9);
        assert!((ad.lambda(511.5) - 1.0).abs() < 1e-9);
    }
}
