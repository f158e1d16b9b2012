//! Per-generation diagnostic access used by the engine

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};
use trionic_can::gmlan::{t8_access_key, ACCESS_LEVEL_LOGGING, LEV_ENABLE_DTCS};
use trionic_can::kwp2000::DDLI_RECORD;
use trionic_can::{CanClient, GmlanClient, KwpClient, ProtocolError, T5Client};
use trionic_core::{EcuKind, Symbol};

use crate::error::{LoggerError, Result};

/// Keep-alive throttle when nothing is being polled
pub const TESTER_PRESENT_INTERVAL: Duration = Duration::from_millis(800);

/// T8 RAM reachable through the logger, `[start, end)`
pub const T8_RAM_START: u32 = 0xF0_0000;
pub const T8_RAM_END: u32 = 0xF0_8000;

/// Largest T8 WriteDataByAddress payload
pub const T8_WRITE_CHUNK: usize = 235;

/// GMLAN identifier holding the dynamically defined record
pub const T8_DDLI_RECORD: u8 = 0x18;
/// GMLAN identifier used to clear and define the record
pub const T8_DDLI_DEFINE: u8 = 0x17;

const T8_SECURITY_ATTEMPTS: usize = 3;
const STOP_SETTLE: Duration = Duration::from_millis(50);

/// Reject T8 RAM accesses that leave the logger window
pub fn check_t8_window(address: u32, length: u32) -> Result<()> {
    let end = u64::from(address) + u64::from(length);
    if address < T8_RAM_START || end > u64::from(T8_RAM_END) {
        return Err(LoggerError::AddressOutOfRange { address, length });
    }
    Ok(())
}

fn ddli_number(sym: &Symbol) -> Result<u16> {
    u16::try_from(sym.number).map_err(|_| {
        LoggerError::Protocol(ProtocolError::InvalidRequest(format!(
            "symbol {} has no DDLI number ({})",
            sym.name, sym.number
        )))
    })
}

/// Diagnostic client for the configured ECU generation
pub enum Protocol {
    /// Raw RAM reads, one per symbol
    T5(T5Client),
    /// KWP2000 with a dynamically defined local identifier
    T7(KwpClient),
    /// GMLAN with a dynamically defined data identifier
    T8(GmlanClient),
}

impl Protocol {
    pub fn new(ecu: EcuKind, can: Arc<CanClient>) -> Self {
        match ecu {
            EcuKind::T5 => Protocol::T5(T5Client::new(can)),
            EcuKind::T7 => Protocol::T7(KwpClient::new(can)),
            EcuKind::T8 => Protocol::T8(GmlanClient::new(can)),
        }
    }

    pub fn ecu(&self) -> EcuKind {
        match self {
            Protocol::T5(_) => EcuKind::T5,
            Protocol::T7(_) => EcuKind::T7,
            Protocol::T8(_) => EcuKind::T8,
        }
    }

    /// Session and security setup
    pub async fn open(&self) -> Result<()> {
        match self {
            Protocol::T5(_) => {}
            Protocol::T7(kwp) => {
                kwp.start_session().await?;
                kwp.request_security_access(false).await?;
            }
            Protocol::T8(gm) => {
                gm.initiate_diagnostic_operation(LEV_ENABLE_DTCS).await?;
                gm.request_security_access(ACCESS_LEVEL_LOGGING, T8_SECURITY_ATTEMPTS, t8_access_key)
                    .await?;
            }
        }
        Ok(())
    }

    /// Define the composite record for `polled`
    pub async fn configure(&self, polled: &[&Symbol]) -> Result<()> {
        match self {
            Protocol::T5(_) => {}
            Protocol::T7(kwp) => {
                let numbers = polled.iter().map(|s| ddli_number(s)).collect::<Result<Vec<_>>>()?;
                kwp.setup_ddli(&numbers).await?;
            }
            Protocol::T8(gm) => {
                gm.write_data_by_identifier(T8_DDLI_DEFINE, &[0xF0, 0x04]).await?;
                for sym in polled {
                    let [hi, lo] = ddli_number(sym)?.to_be_bytes();
                    gm.write_data_by_identifier(T8_DDLI_DEFINE, &[0xF0, 0x80, 0x00, 0x00, 0x00, hi, lo])
                        .await?;
                }
                info!(count = polled.len(), "DDLI configured");
            }
        }
        Ok(())
    }

    /// One sample of every polled symbol, concatenated in order
    pub async fn read_composite(&self, polled: &[&Symbol]) -> Result<Vec<u8>> {
        match self {
            Protocol::T5(t5) => {
                let mut out = Vec::new();
                for sym in polled {
                    out.extend(t5.read_ram(sym.sram_offset, sym.length as usize).await?);
                }
                Ok(out)
            }
            Protocol::T7(kwp) => Ok(kwp.read_data_by_identifier(DDLI_RECORD).await?),
            Protocol::T8(gm) => Ok(gm.read_data_by_identifier(T8_DDLI_RECORD).await?),
        }
    }

    /// Tester present when the link has been quiet; `last` tracks T8 traffic
    pub async fn keep_alive(&self, last: &mut Instant) -> Result<()> {
        match self {
            Protocol::T5(_) => {}
            Protocol::T7(kwp) => {
                kwp.keep_alive().await?;
            }
            Protocol::T8(gm) => {
                if last.elapsed() >= TESTER_PRESENT_INTERVAL {
                    gm.tester_present_no_response().await?;
                    *last = Instant::now();
                }
            }
        }
        Ok(())
    }

    pub async fn read_ram(&self, address: u32, length: usize) -> Result<Vec<u8>> {
        let data = match self {
            Protocol::T5(t5) => t5.read_ram(address, length).await?,
            Protocol::T7(kwp) => kwp.read_memory_by_address(address, length).await?,
            Protocol::T8(gm) => gm.read_memory_by_address(address, length).await?,
        };
        debug!(address = %format!("0x{:06X}", address), length, "RAM read");
        Ok(data)
    }

    pub async fn write_ram(&self, address: u32, data: &[u8]) -> Result<()> {
        match self {
            Protocol::T5(t5) => t5.write_ram(address, data).await?,
            Protocol::T7(kwp) => kwp.write_memory(address, data).await?,
            Protocol::T8(gm) => {
                for (i, chunk) in data.chunks(T8_WRITE_CHUNK).enumerate() {
                    gm.write_data_by_address(address + (i * T8_WRITE_CHUNK) as u32, chunk)
                        .await?;
                }
            }
        }
        debug!(address = %format!("0x{:06X}", address), length = data.len(), "RAM write");
        Ok(())
    }

    /// End the diagnostic session
    pub async fn close(&self) -> Result<()> {
        match self {
            Protocol::T5(_) => {}
            Protocol::T7(kwp) => {
                kwp.stop_session().await?;
                tokio::time::sleep(STOP_SETTLE).await;
            }
            Protocol::T8(gm) => gm.return_to_normal_mode().await?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use trionic_can::gmlan::{REQUEST_ID, RESPONSE_ID};
    use trionic_can::mock::{MockCanAdapter, Script};
    use trionic_can::MockConfig;

    #[rstest]
    #[case(0xF0_0000, 4, true)]
    #[case(0xF0_7FFC, 4, true)]
    #[case(0xF0_7FFD, 4, false)]
    #[case(0xEF_FFFF, 1, false)]
    #[case(0xF0_8000, 1, false)]
    #[case(0xFFFF_FFFF, 2, false)]
    fn test_t8_window(#[case] address: u32, #[case] length: u32, #[case] ok: bool) {
        assert_eq!(check_t8_window(address, length).is_ok(), ok);
    }

    #[tokio::test]
    async fn test_t8_configure_frames() {
        let mock = Arc::new(MockCanAdapter::new(&MockConfig::default()));
        mock.script(Script::on(REQUEST_ID, [0x04, 0x3B, 0x17, 0xF0, 0x04]).reply(RESPONSE_ID, vec![0x02, 0x7B, 0x17]));
        mock.script(Script::on(REQUEST_ID, [0x10, 0x09, 0x3B, 0x17]).reply(RESPONSE_ID, vec![0x30, 0x00, 0x00]));
        mock.script(Script::on(REQUEST_ID, [0x21]).reply(RESPONSE_ID, vec![0x02, 0x7B, 0x17]));
        let can = Arc::new(CanClient::new(mock.clone()));
        let proto = Protocol::new(EcuKind::T8, can);

        let sym = Symbol::new("ActualIn.n_Engine", 0x0102, 0xF0_1000, 2);
        proto.configure(&[&sym]).await.unwrap();
        let sent = mock.sent_to(REQUEST_ID);
        assert_eq!(sent.len(), 3);
        assert_eq!(&sent[0].data[..5], &[0x04, 0x3B, 0x17, 0xF0, 0x04]);
        assert_eq!(sent[1].data.as_ref(), &[0x10, 0x09, 0x3B, 0x17, 0xF0, 0x80, 0x00, 0x00]);
        assert_eq!(&sent[2].data[..4], &[0x21, 0x00, 0x01, 0x02]);
    }

    #[test]
    fn test_negative_number_has_no_ddli() {
        let sym = Symbol::new("ADC1", -1001, 0, 2);
        assert!(ddli_number(&sym).is_err());
    }

    #[tokio::test]
    async fn test_t5_composite_reads_each_symbol() {
        let mock = Arc::new(MockCanAdapter::new(&MockConfig::default()));
        // 0x1000 + 5 bias
        mock.script(
            Script::on(0x05, [0xC7, 0x00, 0x00, 0x10, 0x05])
                .reply(0x0C, vec![0xC7, 0x00, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]),
        );
        let can = Arc::new(CanClient::new(mock.clone()));
        let proto = Protocol::new(EcuKind::T5, can);
        let mut sym = Symbol::new("P_medel", 1, 0, 2);
        sym.sram_offset = 0x1000;
        let data = proto.read_composite(&[&sym]).await.unwrap();
        assert_eq!(data, vec![0x01, 0x02]);
    }
}
