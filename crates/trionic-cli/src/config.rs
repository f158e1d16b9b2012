//! Configuration file handling for the trionic CLI

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use trionic_core::EcuKind;
use trionic_logger::LoggerConfig;

/// Configuration for the CLI tool
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Default output format
    pub output: Option<String>,
    /// Disable colored output
    pub no_color: Option<bool>,
    /// Directory with `<software version>.xml` symbol name tables
    pub xml_dir: Option<PathBuf>,
    /// Firmware file used to resolve symbol names for `log`
    pub firmware: Option<PathBuf>,
    /// Logging session defaults, the `[logger]` table
    #[serde(default)]
    pub logger: LoggerConfig,
}

impl Config {
    /// Load configuration from the default config file
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config
            .logger
            .validate()
            .with_context(|| format!("Invalid [logger] section in {}", path.display()))?;
        Ok(config)
    }

    /// Get the default config file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("trionic");

        Ok(config_dir.join("config.toml"))
    }

    /// Merge `log` command arguments over the `[logger]` table
    pub fn logger_with_args(&self, ecu: Option<EcuKind>, symbols: &[String], rate: Option<u32>) -> LoggerConfig {
        let mut logger = self.logger.clone();
        if let Some(ecu) = ecu {
            logger.ecu = ecu;
        }
        if !symbols.is_empty() {
            logger.symbols = symbols.to_vec();
        }
        if let Some(rate) = rate {
            logger.rate = rate;
        }
        logger
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_load_with_logger_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
output = "json"
firmware = "/bins/5168646.BIN"

[logger]
ecu = "t8"
rate = 10
symbols = ["ActualIn.n_Engine"]

[logger.transport]
type = "txbridge"
address = "192.168.4.1:1337"
"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.output.as_deref(), Some("json"));
        assert_eq!(config.logger.ecu, EcuKind::T8);
        assert!(config.logger.transport.is_bridge());

        let merged = config.logger_with_args(Some(EcuKind::T7), &[], Some(20));
        assert_eq!(merged.ecu, EcuKind::T7);
        assert_eq!(merged.rate, 20);
        assert_eq!(merged.symbols, vec!["ActualIn.n_Engine".to_string()]);
    }

    #[test]
    fn test_rejects_bad_rate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[logger]\nrate = 0\n").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
