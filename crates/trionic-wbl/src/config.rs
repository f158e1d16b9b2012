//! Wideband selection

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::WblError;
use crate::{aem, ecumaster, innovate, plx, zeitronix};

/// Port value that routes the sensor through the txbridge
pub const PORT_TXBRIDGE: &str = "txbridge";
/// Port value that reads the sensor off the shared CAN bus
pub const PORT_CAN: &str = "CAN";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WblKind {
    /// Lambda comes from the ECU's own symbols
    #[serde(rename = "ECU", alias = "ecu")]
    Ecu,
    #[default]
    #[serde(alias = "none")]
    None,
    #[serde(alias = "ecumaster", alias = "LAMBDA to CAN")]
    Ecumaster,
    #[serde(alias = "innovate", alias = "Innovate Serial Protocol v2")]
    Innovate,
    #[serde(rename = "AEM", alias = "aem", alias = "AEM Uego")]
    Aem,
    #[serde(rename = "PLX", alias = "plx", alias = "PLX iMFD")]
    Plx,
    #[serde(alias = "zeitronix", alias = "Zeitronix ZT-2")]
    Zeitronix,
}

impl WblKind {
    /// An external sensor has to be started
    pub fn is_external(&self) -> bool {
        !matches!(self, WblKind::Ecu | WblKind::None)
    }

    pub fn product(&self) -> &'static str {
        match self {
            WblKind::Ecu => "ECU",
            WblKind::None => "None",
            WblKind::Ecumaster => ecumaster::PRODUCT,
            WblKind::Innovate => innovate::PRODUCT,
            WblKind::Aem => aem::PRODUCT,
            WblKind::Plx => plx::PRODUCT,
            WblKind::Zeitronix => zeitronix::PRODUCT,
        }
    }

    fn default_baud(&self) -> u32 {
        match self {
            WblKind::Aem => aem::BAUD_RATE,
            WblKind::Plx => plx::BAUD_RATE,
            WblKind::Zeitronix => zeitronix::BAUD_RATE,
            _ => innovate::BAUD_RATE,
        }
    }
}

impl fmt::Display for WblKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.product())
    }
}

impl FromStr for WblKind {
    type Err = WblError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.trim() {
            "ECU" | "ecu" => WblKind::Ecu,
            "None" | "none" | "" => WblKind::None,
            "Ecumaster" | "ecumaster" | ecumaster::PRODUCT => WblKind::Ecumaster,
            "Innovate" | "innovate" | innovate::PRODUCT => WblKind::Innovate,
            "AEM" | "aem" | aem::PRODUCT => WblKind::Aem,
            "PLX" | "plx" | plx::PRODUCT => WblKind::Plx,
            "Zeitronix" | "zeitronix" | zeitronix::PRODUCT => WblKind::Zeitronix,
            other => return Err(WblError::UnknownKind(other.to_string())),
        };
        Ok(kind)
    }
}

/// Where readings come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WblSource {
    /// Frames on the shared CAN bus
    Can,
    /// Readings relayed by the txbridge
    Bridge,
    Serial { port: String, baud_rate: u32 },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WblConfig {
    #[serde(default)]
    pub kind: WblKind,
    /// Serial device, `txbridge` or `CAN`
    #[serde(default)]
    pub port: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baud_rate: Option<u32>,
}

impl WblConfig {
    pub fn new(kind: WblKind, port: impl Into<String>) -> Self {
        Self {
            kind,
            port: port.into(),
            baud_rate: None,
        }
    }

    pub fn source(&self) -> Result<WblSource, WblError> {
        if self.kind == WblKind::Ecumaster {
            return Ok(WblSource::Can);
        }
        match self.port.trim() {
            PORT_TXBRIDGE => Ok(WblSource::Bridge),
            PORT_CAN if self.kind == WblKind::Aem => Ok(WblSource::Can),
            PORT_CAN => Err(WblError::InvalidConfig(format!("{} cannot be read from CAN", self.kind))),
            "" => Err(WblError::InvalidConfig(format!("{} needs a port", self.kind))),
            port => Ok(WblSource::Serial {
                port: port.to_string(),
                baud_rate: self.baud_rate.unwrap_or_else(|| self.kind.default_baud()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("ECU", WblKind::Ecu)]
    #[case("None", WblKind::None)]
    #[case("Ecumaster", WblKind::Ecumaster)]
    #[case("LAMBDA to CAN", WblKind::Ecumaster)]
    #[case("Innovate", WblKind::Innovate)]
    #[case("AEM", WblKind::Aem)]
    #[case("PLX", WblKind::Plx)]
    #[case("Zeitronix ZT-2", WblKind::Zeitronix)]
    fn test_kind_from_str(#[case] input: &str, #[case] expected: WblKind) {
        assert_eq!(input.parse::<WblKind>().unwrap(), expected);
    }

    #[test]
    fn test_unknown_kind() {
        assert!(matches!("STAG".parse::<WblKind>(), Err(WblError::UnknownKind(_))));
    }

    #[test]
    fn test_source_resolution() {
        assert_eq!(WblConfig::new(WblKind::Ecumaster, "").source().unwrap(), WblSource::Can);
        assert_eq!(WblConfig::new(WblKind::Aem, "CAN").source().unwrap(), WblSource::Can);
        assert!(WblConfig::new(WblKind::Plx, "CAN").source().is_err());
        assert_eq!(WblConfig::new(WblKind::Plx, "txbridge").source().unwrap(), WblSource::Bridge);
        assert_eq!(
            WblConfig::new(WblKind::Innovate, "/dev/ttyUSB0").source().unwrap(),
            WblSource::Serial {
                port: "/dev/ttyUSB0".to_string(),
                baud_rate: 19_200
            }
        );
    }

    #[test]
    fn test_zeitronix_serial_baud() {
        assert_eq!(
            WblConfig::new(WblKind::Zeitronix, "COM3").source().unwrap(),
            WblSource::Serial {
                port: "COM3".to_string(),
                baud_rate: 9600
            }
        );
        assert!(WblConfig::new(WblKind::Zeitronix, "CAN").source().is_err());
    }

    #[test]
    fn test_parse_toml() {
        let cfg: WblConfig = toml::from_str("kind = \"AEM\"\nport = \"/dev/ttyS1\"").unwrap();
        assert_eq!(cfg.kind, WblKind::Aem);
        assert_eq!(
            cfg.source().unwrap(),
            WblSource::Serial {
                port: "/dev/ttyS1".to_string(),
                baud_rate: 9600
            }
        );
    }
}
