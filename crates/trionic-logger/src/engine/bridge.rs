//! txbridge push mode and bridge-side RAM access

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Local};
use tracing::debug;
use trionic_can::codec::{SerialCommand, CMD_READ_RAM, CMD_SYMBOL_LIST, CMD_WRITE_RAM};
use trionic_can::{
    CanClient, CanError, CanFrame, SYSTEM_MSG, SYSTEM_MSG_DATA_REQUEST, SYSTEM_MSG_ERROR, SYSTEM_MSG_WRITE_RESPONSE,
};
use trionic_core::{EcuKind, Symbol};

use crate::error::{LoggerError, Result};
use crate::request::RamOp;

/// Pause after selecting the ECU generation
pub const SELECT_SETTLE: Duration = Duration::from_millis(75);
pub const READ_TIMEOUT: Duration = Duration::from_secs(4);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Bridge RAM window per command
pub const RAM_WINDOW: usize = 235;
pub const T5_RAM_WINDOW: usize = 234;

/// Bridge error: read timed out on the ECU side
pub const ERR_READ_TIMEOUT: u8 = 0x31;
/// Bridge error: invalid sequence
pub const ERR_INVALID_SEQUENCE: u8 = 0x06;

/// Start streaming
pub const START: &[u8] = b"r";
/// Stop streaming
pub const STOP: &[u8] = b"s";

pub async fn send_raw(can: &CanClient, data: impl Into<Bytes>) -> Result<()> {
    can.send(CanFrame::new(SYSTEM_MSG, data)).await?;
    Ok(())
}

async fn send_command(can: &CanClient, command: u8, payload: Vec<u8>) -> Result<()> {
    let encoded = SerialCommand::new(command, payload).encode().map_err(CanError::from)?;
    send_raw(can, encoded).await
}

/// Select the ECU generation on the bridge
pub async fn select_ecu(can: &CanClient, ecu: EcuKind) -> Result<()> {
    send_raw(can, vec![ecu.bridge_selector()]).await?;
    tokio::time::sleep(SELECT_SETTLE).await;
    Ok(())
}

/// `'d'` payload: `[addr:4LE][len:2LE]` per symbol. T5 addresses are SRAM offsets.
pub fn symbol_list(ecu: EcuKind, polled: &[&Symbol]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(polled.len() * 6);
    for sym in polled {
        let address = match ecu {
            EcuKind::T5 => sym.sram_offset,
            EcuKind::T7 | EcuKind::T8 => sym.address,
        };
        payload.extend_from_slice(&address.to_le_bytes());
        payload.extend_from_slice(&sym.length.to_le_bytes());
    }
    payload
}

pub async fn send_symbol_list(can: &CanClient, ecu: EcuKind, polled: &[&Symbol]) -> Result<()> {
    send_command(can, CMD_SYMBOL_LIST, symbol_list(ecu, polled)).await
}

fn window(ecu: EcuKind) -> usize {
    match ecu {
        EcuKind::T5 => T5_RAM_WINDOW,
        EcuKind::T7 | EcuKind::T8 => RAM_WINDOW,
    }
}

fn bridge_error(frame: &CanFrame) -> LoggerError {
    LoggerError::Bridge(frame.data.first().copied().unwrap_or_default())
}

/// RAM access through the bridge while streaming is stopped
pub async fn ram_access(can: &CanClient, ecu: EcuKind, address: u32, op: &RamOp) -> Result<Vec<u8>> {
    let window = window(ecu);
    match op {
        RamOp::Read { length } => {
            let length = *length as usize;
            let mut out = Vec::with_capacity(length);
            while out.len() < length {
                let n = (length - out.len()).min(window);
                let mut payload = (address + out.len() as u32).to_le_bytes().to_vec();
                payload.push(n as u8);
                let encoded = SerialCommand::new(CMD_READ_RAM, payload).encode().map_err(CanError::from)?;
                let reply = can
                    .send_and_wait(
                        CanFrame::new(SYSTEM_MSG, encoded),
                        READ_TIMEOUT,
                        &[SYSTEM_MSG_DATA_REQUEST, SYSTEM_MSG_ERROR],
                    )
                    .await?;
                if reply.id == SYSTEM_MSG_ERROR {
                    return Err(bridge_error(&reply));
                }
                if reply.data.len() != n {
                    return Err(LoggerError::PayloadLength {
                        expected: n,
                        got: reply.data.len(),
                    });
                }
                out.extend_from_slice(&reply.data);
            }
            debug!(address = %format!("0x{:06X}", address), length, "Bridge RAM read");
            Ok(out)
        }
        RamOp::Write { data } => {
            for (i, chunk) in data.chunks(window).enumerate() {
                let mut payload = (address + (i * window) as u32).to_le_bytes().to_vec();
                payload.push(chunk.len() as u8);
                payload.extend_from_slice(chunk);
                let encoded = SerialCommand::new(CMD_WRITE_RAM, payload).encode().map_err(CanError::from)?;
                let reply = can
                    .send_and_wait(
                        CanFrame::new(SYSTEM_MSG, encoded),
                        WRITE_TIMEOUT,
                        &[SYSTEM_MSG_WRITE_RESPONSE, SYSTEM_MSG_ERROR],
                    )
                    .await?;
                if reply.id == SYSTEM_MSG_ERROR {
                    return Err(bridge_error(&reply));
                }
            }
            debug!(address = %format!("0x{:06X}", address), length = data.len(), "Bridge RAM write");
            Ok(Vec::new())
        }
    }
}

/// Maps device timestamps of pushed samples onto wall time.
///
/// Both anchors come from the first frame; later stamps are the first wall
/// time plus the device-side distance, so host scheduling jitter does not
/// leak into the log.
#[derive(Debug, Default, Clone)]
pub struct PushClock {
    anchors: Option<(DateTime<Local>, u32)>,
}

impl PushClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stamp(&mut self, device_ts: u32, now: DateTime<Local>) -> DateTime<Local> {
        match self.anchors {
            None => {
                self.anchors = Some((now, device_ts));
                now
            }
            // device clock went backwards: the bridge restarted
            Some((_, first_ts)) if device_ts < first_ts => {
                self.reset();
                self.stamp(device_ts, now)
            }
            Some((first_wall, first_ts)) => first_wall + chrono::Duration::milliseconds(i64::from(device_ts - first_ts)),
        }
    }

    pub fn reset(&mut self) {
        self.anchors = None;
    }
}

/// Split a push frame into device timestamp and payload
pub fn split_push_frame(data: &[u8], expected: usize) -> Result<(u32, &[u8])> {
    if data.len() != expected + 4 {
        return Err(LoggerError::PayloadLength {
            expected: expected + 4,
            got: data.len(),
        });
    }
    let ts = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    Ok((ts, &data[4..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use trionic_can::mock::{MockCanAdapter, Script};
    use trionic_can::MockConfig;

    #[test]
    fn test_push_clock_anchors_on_first_frame() {
        let mut clock = PushClock::new();
        let t0 = Local.with_ymd_and_hms(2024, 3, 9, 14, 0, 0).unwrap();
        assert_eq!(clock.stamp(10_000, t0), t0);
        // host is late, device says 40 ms
        let late = t0 + chrono::Duration::milliseconds(95);
        assert_eq!(clock.stamp(10_040, late), t0 + chrono::Duration::milliseconds(40));
        assert_eq!(clock.stamp(10_080, late), t0 + chrono::Duration::milliseconds(80));
        clock.reset();
        assert_eq!(clock.stamp(5, late), late);
    }

    #[test]
    fn test_push_clock_reanchors_after_bridge_restart() {
        let mut clock = PushClock::new();
        let t0 = Local.with_ymd_and_hms(2024, 3, 9, 14, 0, 0).unwrap();
        clock.stamp(50_000, t0);
        assert_eq!(clock.stamp(50_200, t0), t0 + chrono::Duration::milliseconds(200));

        let after = t0 + chrono::Duration::seconds(3);
        assert_eq!(clock.stamp(12, after), after);
        assert_eq!(clock.stamp(52, after), after + chrono::Duration::milliseconds(40));
    }

    #[test]
    fn test_split_push_frame() {
        let data = [0x10, 0x27, 0x00, 0x00, 0x01, 0x2C];
        let (ts, payload) = split_push_frame(&data, 2).unwrap();
        assert_eq!(ts, 10_000);
        assert_eq!(payload, &[0x01, 0x2C]);
        assert!(matches!(
            split_push_frame(&data, 4),
            Err(LoggerError::PayloadLength { expected: 8, got: 6 })
        ));
    }

    #[test]
    fn test_symbol_list_layout() {
        let mut a = Symbol::new("P_medel", 1, 0x5000, 2);
        a.sram_offset = 0x1234;
        let b = Symbol::new("Lufttemp", 2, 0x5002, 1);
        assert_eq!(
            symbol_list(EcuKind::T5, &[&a, &b]),
            vec![0x34, 0x12, 0, 0, 0x02, 0x00, 0, 0, 0, 0, 0x01, 0x00]
        );
        assert_eq!(&symbol_list(EcuKind::T7, &[&a])[..4], &[0x00, 0x50, 0, 0]);
    }

    fn bridge() -> (Arc<MockCanAdapter>, CanClient) {
        let mock = Arc::new(MockCanAdapter::new(&MockConfig {
            bridge: true,
            ..Default::default()
        }));
        let can = CanClient::new(mock.clone());
        (mock, can)
    }

    #[tokio::test]
    async fn test_ram_read_windows() {
        let (mock, can) = bridge();
        mock.script(Script::on(SYSTEM_MSG, [b'R', 5, 0x00, 0x00, 0xF0, 0x00, 235]).reply(SYSTEM_MSG_DATA_REQUEST, vec![0xAB; 235]));
        mock.script(Script::on(SYSTEM_MSG, [b'R', 5, 0xEB, 0x00, 0xF0, 0x00, 5]).reply(SYSTEM_MSG_DATA_REQUEST, vec![0xCD; 5]));
        let data = ram_access(&can, EcuKind::T8, 0xF0_0000, &RamOp::Read { length: 240 }).await.unwrap();
        assert_eq!(data.len(), 240);
        assert_eq!(data[235], 0xCD);
    }

    #[tokio::test]
    async fn test_ram_write_error_code() {
        let (mock, can) = bridge();
        mock.script(Script::on(SYSTEM_MSG, [b'W']).reply(SYSTEM_MSG_ERROR, vec![ERR_READ_TIMEOUT]));
        let err = ram_access(&can, EcuKind::T7, 0x1000, &RamOp::Write { data: vec![1, 2] })
            .await
            .unwrap_err();
        assert!(matches!(err, LoggerError::Bridge(0x31)));
    }
}
