//! GMLAN diagnostics for Trionic 8
//!
//! Requests and replies are ISO-TP segmented ([`isotp`]) on 0x7E0/0x7E8.

pub mod isotp;

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info};

use crate::error::{ProtocolError, Result};
use crate::nrc::NegativeResponseCode;
use crate::{CanClient, CanError, CanFrame, Subscription};

use isotp::{FlowStatus, Reassembler, Reassembly};

pub const REQUEST_ID: u32 = 0x7E0;
pub const RESPONSE_ID: u32 = 0x7E8;

/// Service identifiers
pub mod service {
    pub const INITIATE_DIAGNOSTIC_OPERATION: u8 = 0x10;
    pub const READ_DATA_BY_IDENTIFIER: u8 = 0x1A;
    pub const RETURN_TO_NORMAL_MODE: u8 = 0x20;
    pub const READ_MEMORY_BY_ADDRESS: u8 = 0x23;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const DISABLE_NORMAL_COMMUNICATION: u8 = 0x28;
    pub const WRITE_DATA_BY_IDENTIFIER: u8 = 0x3B;
    pub const WRITE_DATA_BY_ADDRESS: u8 = 0x3D;
    pub const TESTER_PRESENT: u8 = 0x3E;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
}

/// Diagnostic level for InitiateDiagnosticOperation
pub const LEV_ENABLE_DTCS: u8 = 0x02;
/// Security level used for logging
pub const ACCESS_LEVEL_LOGGING: u8 = 0xFD;

/// Window size for [`GmlanClient::read_memory_by_address`]
pub const MAX_READ: usize = 240;

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(150);
const RESPONSE_PENDING_TIMEOUT: Duration = Duration::from_secs(5);
const FLOW_CONTROL_TIMEOUT: Duration = Duration::from_millis(500);

/// Trionic 8 seed/key algorithm. Returns the key as `(high, low)`.
pub fn t8_access_key(seed: [u8; 2], level: u8) -> (u8, u8) {
    let val = u32::from(seed[0]) << 8 | u32::from(seed[1]);
    let mut key = ((val >> 5 | val << 11) + 0xB988) & 0xFFFF;
    match level {
        0xFB => {
            key ^= 0x8749;
            key += 0x06D3;
            key ^= 0xCFDF;
        }
        0xFD => {
            key /= 3;
            key ^= 0x8749;
            key += 0x0ACF;
            key ^= 0x81BF;
        }
        _ => {}
    }
    ((key >> 8) as u8, key as u8)
}

/// GMLAN client for Trionic 8
pub struct GmlanClient {
    can: Arc<CanClient>,
    request_id: u32,
    response_id: u32,
    timeout: Duration,
}

impl GmlanClient {
    pub fn new(can: Arc<CanClient>) -> Self {
        Self::with_ids(can, REQUEST_ID, RESPONSE_ID)
    }

    pub fn with_ids(can: Arc<CanClient>, request_id: u32, response_id: u32) -> Self {
        Self {
            can,
            request_id,
            response_id,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn can(&self) -> &Arc<CanClient> {
        &self.can
    }

    async fn send_segmented(&self, payload: &[u8], sub: &mut Subscription) -> Result<()> {
        let frames = isotp::segment(payload)?;
        let mut frames = frames.into_iter();
        let Some(first) = frames.next() else {
            return Ok(());
        };
        self.can.send(CanFrame::new(self.request_id, first)).await?;

        let rest: Vec<Bytes> = frames.collect();
        if rest.is_empty() {
            return Ok(());
        }

        let mut sent = 0;
        while sent < rest.len() {
            let fc = sub.recv_timeout(FLOW_CONTROL_TIMEOUT).await?;
            let (block_size, st_min) = match FlowStatus::parse(&fc.data) {
                Some(FlowStatus::ContinueToSend { block_size, st_min }) => (block_size, st_min),
                Some(FlowStatus::Wait) => continue,
                Some(FlowStatus::Overflow) => {
                    return Err(ProtocolError::unexpected("ISO-TP", "receiver overflow"));
                }
                None => return Err(ProtocolError::unexpected("ISO-TP flow control", &fc)),
            };
            let block = if block_size == 0 {
                rest.len() - sent
            } else {
                (block_size as usize).min(rest.len() - sent)
            };
            for frame in &rest[sent..sent + block] {
                if st_min > 0 {
                    tokio::time::sleep(Duration::from_millis(isotp::st_min_millis(st_min))).await;
                }
                self.can.send(CanFrame::new(self.request_id, frame.clone())).await?;
            }
            sent += block;
        }
        Ok(())
    }

    async fn receive(&self, sub: &mut Subscription, service: u8, context: &str) -> Result<Vec<u8>> {
        let mut reassembler = Reassembler::new();
        let deadline = Instant::now() + RESPONSE_PENDING_TIMEOUT;
        let mut wait = self.timeout;
        loop {
            let frame = sub.recv_timeout(wait).await?;
            let message = match reassembler.feed(&frame.data)? {
                Reassembly::Done(message) => message,
                Reassembly::SendFlowControl => {
                    self.can
                        .send(CanFrame::new(self.request_id, isotp::flow_control(0, 0)))
                        .await?;
                    continue;
                }
                Reassembly::More => continue,
            };

            if message.first() == Some(&service::NEGATIVE_RESPONSE) {
                let svc = message.get(1).copied().unwrap_or(service);
                let code = message.get(2).copied().unwrap_or(0);
                if NegativeResponseCode::from(code).is_response_pending() {
                    if Instant::now() >= deadline {
                        return Err(CanError::Timeout(format!("{}: response pending for too long", context)).into());
                    }
                    debug!(context, "Response pending");
                    wait = RESPONSE_PENDING_TIMEOUT;
                    continue;
                }
                return Err(ProtocolError::negative(svc, code, context));
            }
            if message.first() != Some(&(service + 0x40)) {
                return Err(ProtocolError::unexpected(context, hex::encode_upper(&message)));
            }
            return Ok(message);
        }
    }

    /// Send one request and return the positive response, service byte included
    pub async fn request(&self, payload: &[u8], context: &str) -> Result<Vec<u8>> {
        let service = *payload
            .first()
            .ok_or_else(|| ProtocolError::InvalidRequest("empty request".to_string()))?;
        let mut sub = self.can.subscribe(&[self.response_id]);
        self.send_segmented(payload, &mut sub).await?;
        self.receive(&mut sub, service, context).await
    }

    pub async fn initiate_diagnostic_operation(&self, level: u8) -> Result<()> {
        self.request(&[service::INITIATE_DIAGNOSTIC_OPERATION, level], "InitiateDiagnosticOperation")
            .await?;
        info!(level = %format!("0x{:02X}", level), "GMLAN diagnostic operation started");
        Ok(())
    }

    pub async fn disable_normal_communication(&self) -> Result<()> {
        self.request(&[service::DISABLE_NORMAL_COMMUNICATION], "DisableNormalCommunication")
            .await?;
        Ok(())
    }

    /// Seed/key exchange at `level`. Retries up to `attempts` times.
    pub async fn request_security_access(
        &self,
        level: u8,
        attempts: usize,
        key_fn: fn([u8; 2], u8) -> (u8, u8),
    ) -> Result<()> {
        let mut last_err = ProtocolError::SecurityDenied;
        for _ in 0..attempts.max(1) {
            match self.security_exchange(level, key_fn).await {
                Ok(()) => {
                    info!(level = %format!("0x{:02X}", level), "Security access granted");
                    return Ok(());
                }
                Err(e) => {
                    debug!(%e, "Security access attempt failed");
                    last_err = e;
                }
            }
        }
        Err(match last_err {
            ProtocolError::Transport(e) => ProtocolError::Transport(e),
            _ => ProtocolError::SecurityDenied,
        })
    }

    async fn security_exchange(&self, level: u8, key_fn: fn([u8; 2], u8) -> (u8, u8)) -> Result<()> {
        let resp = self
            .request(&[service::SECURITY_ACCESS, level], "SecurityAccess")
            .await?;
        if resp.len() < 4 {
            return Err(ProtocolError::unexpected("SecurityAccess", hex::encode_upper(&resp)));
        }
        let seed = [resp[2], resp[3]];
        if seed == [0, 0] {
            // already unlocked
            return Ok(());
        }
        let (hi, lo) = key_fn(seed, level);
        self.request(&[service::SECURITY_ACCESS, level + 1, hi, lo], "SecurityAccess")
            .await?;
        Ok(())
    }

    pub async fn read_data_by_identifier(&self, id: u8) -> Result<Vec<u8>> {
        let resp = self
            .request(&[service::READ_DATA_BY_IDENTIFIER, id], "ReadDataByIdentifier")
            .await?;
        if resp.get(1) != Some(&id) {
            return Err(ProtocolError::unexpected("ReadDataByIdentifier", hex::encode_upper(&resp)));
        }
        Ok(resp[2..].to_vec())
    }

    pub async fn write_data_by_identifier(&self, id: u8, data: &[u8]) -> Result<()> {
        let mut payload = vec![service::WRITE_DATA_BY_IDENTIFIER, id];
        payload.extend_from_slice(data);
        self.request(&payload, "WriteDataByIdentifier").await?;
        Ok(())
    }

    /// ReadMemoryByAddress, paged in [`MAX_READ`]-byte windows
    pub async fn read_memory_by_address(&self, address: u32, length: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(length);
        while out.len() < length {
            let chunk = (length - out.len()).min(MAX_READ);
            let addr = address + out.len() as u32;
            let mut payload = vec![service::READ_MEMORY_BY_ADDRESS];
            payload.extend_from_slice(&addr.to_be_bytes());
            payload.extend_from_slice(&(chunk as u16).to_be_bytes());
            let resp = self.request(&payload, "ReadMemoryByAddress").await?;
            // 0x63 + 4 address bytes
            if resp.len() != 5 + chunk {
                return Err(ProtocolError::LengthMismatch {
                    expected: chunk,
                    got: resp.len().saturating_sub(5),
                });
            }
            out.extend_from_slice(&resp[5..]);
        }
        Ok(out)
    }

    pub async fn write_data_by_address(&self, address: u32, data: &[u8]) -> Result<()> {
        let mut payload = vec![service::WRITE_DATA_BY_ADDRESS];
        payload.extend_from_slice(&address.to_be_bytes());
        payload.extend_from_slice(data);
        self.request(&payload, "WriteDataByAddress").await?;
        Ok(())
    }

    /// `3E 80`: tester present, no response expected
    pub async fn tester_present_no_response(&self) -> Result<()> {
        let frame = isotp::segment(&[service::TESTER_PRESENT, 0x80])?;
        for f in frame {
            self.can.send(CanFrame::new(self.request_id, f)).await?;
        }
        Ok(())
    }

    pub async fn return_to_normal_mode(&self) -> Result<()> {
        self.request(&[service::RETURN_TO_NORMAL_MODE], "ReturnToNormalMode")
            .await?;
        debug!("GMLAN returned to normal mode");
        Ok(())
    }
}
