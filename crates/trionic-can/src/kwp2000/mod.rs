//! KWP2000 over raw CAN, Trionic 5/7 flavour
//!
//! Requests go out on 0x242 and answers come back on the identifier the ECU
//! picked during `StartCommunication` (normally 0x258). Long messages use the
//! chained framing in [`split`].

mod security;
mod split;

pub use security::{calc_key, verify_key, KEY_METHODS};
pub use split::{is_last, remaining, split_request, split_request2, split_response};

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ProtocolError, Result};
use crate::nrc::NegativeResponseCode;
use crate::{CanClient, CanError, CanFrame, FrameKind};

/// StartCommunication is sent here
pub const INIT_MSG_ID: u32 = 0x222;
/// Every other tester request
pub const REQ_MSG_ID: u32 = 0x242;
/// StartCommunication reply
pub const INIT_RESP_ID: u32 = 0x238;
/// ECU confirmations for chained tester requests
pub const REQ_CHUNK_CONF_ID: u32 = 0x270;
/// Tester acknowledgements for chained ECU replies
pub const RESP_CHUNK_CONF_ID: u32 = 0x266;
/// Reply identifier until the ECU tells us otherwise
pub const DEFAULT_RESPONSE_ID: u32 = 0x258;

/// Service identifiers
pub mod service {
    pub const ECU_RESET: u8 = 0x11;
    pub const READ_ECU_IDENTIFICATION: u8 = 0x1A;
    pub const READ_DATA_BY_LOCAL_IDENTIFIER: u8 = 0x21;
    pub const READ_MEMORY_BY_ADDRESS: u8 = 0x23;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const DYNAMICALLY_DEFINE_LOCAL_IDENTIFIER: u8 = 0x2C;
    pub const START_ROUTINE_BY_LOCAL_IDENTIFIER: u8 = 0x31;
    pub const REQUEST_DOWNLOAD: u8 = 0x34;
    pub const TRANSFER_DATA: u8 = 0x36;
    pub const REQUEST_TRANSFER_EXIT: u8 = 0x37;
    pub const WRITE_DATA_BY_ADDRESS: u8 = 0x3D;
    pub const TESTER_PRESENT: u8 = 0x3E;
    pub const START_COMMUNICATION: u8 = 0x81;
    pub const STOP_COMMUNICATION: u8 = 0x82;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
}

/// Local identifier holding the dynamically defined composite record
pub const DDLI_RECORD: u8 = 0xF0;
const DM_DBMA: u8 = 0x03;
const DM_CDDLI: u8 = 0x04;
const DEVELOPMENT_PRIORITY: u8 = 0x05;

/// Largest single ReadMemoryByAddress
pub const MAX_READ: usize = 244;
/// Largest single WriteDataByAddress issued by [`KwpClient::write_memory`]
pub const WRITE_CHUNK: usize = 36;

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(60);
const RESPONSE_PENDING_TIMEOUT: Duration = Duration::from_secs(5);
const TESTER_PRESENT_INTERVAL: Duration = Duration::from_millis(800);
const SEED_KEY_DELAY: Duration = Duration::from_millis(10);
const DDLI_DEFINE_DELAY: Duration = Duration::from_millis(12);
const TRANSFER_FRAME_TIMEOUT: Duration = Duration::from_millis(250);

/// Translate byte 5 of a response frame when byte 3 carries `0x7F`.
/// Every other frame is `Ok`.
pub fn check_response(data: &[u8], context: &str) -> Result<()> {
    if data.get(3) != Some(&service::NEGATIVE_RESPONSE) {
        return Ok(());
    }
    match (data.get(4), data.get(5)) {
        (Some(&svc), Some(&code)) => Err(ProtocolError::negative(svc, code, context)),
        _ => Err(ProtocolError::unexpected(context, hex::encode_upper(data))),
    }
}

/// Confirmation codes: 0x00 is success, anything else is a negative response
pub fn translate_error_code(service: u8, code: u8, context: &str) -> Result<()> {
    if code == 0 {
        Ok(())
    } else {
        Err(ProtocolError::negative(service, code, context))
    }
}

fn is_response_pending(data: &[u8]) -> bool {
    data.get(3) == Some(&service::NEGATIVE_RESPONSE)
        && data.get(5).map(|c| NegativeResponseCode::from(*c).is_response_pending()) == Some(true)
}

fn require_len(data: &[u8], len: usize, context: &str) -> Result<()> {
    if data.len() < len {
        return Err(ProtocolError::unexpected(context, hex::encode_upper(data)));
    }
    Ok(())
}

/// KWP2000 client for Trionic 5/7
pub struct KwpClient {
    can: Arc<CanClient>,
    timeout: Duration,
    response_id: AtomicU32,
    granted: AtomicBool,
    last_request: Mutex<Instant>,
    security_backoff: Duration,
}

impl KwpClient {
    pub fn new(can: Arc<CanClient>) -> Self {
        Self {
            can,
            timeout: DEFAULT_TIMEOUT,
            response_id: AtomicU32::new(DEFAULT_RESPONSE_ID),
            granted: AtomicBool::new(false),
            last_request: Mutex::new(Instant::now()),
            security_backoff: Duration::from_secs(3),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Pause between failed key derivations
    pub fn with_security_backoff(mut self, backoff: Duration) -> Self {
        self.security_backoff = backoff;
        self
    }

    pub fn response_id(&self) -> u32 {
        self.response_id.load(Ordering::SeqCst)
    }

    pub fn security_granted(&self) -> bool {
        self.granted.load(Ordering::SeqCst)
    }

    pub fn can(&self) -> &Arc<CanClient> {
        &self.can
    }

    fn touch(&self) {
        *self.last_request.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_request.lock().elapsed()
    }

    /// Send `frame`, return the first reply on one of `ids`. Response-pending
    /// answers are waited through.
    async fn exchange(&self, frame: CanFrame, ids: &[u32], timeout: Duration) -> Result<Bytes> {
        let mut sub = self.can.subscribe(ids);
        self.can.send(frame).await?;
        self.touch();

        let deadline = Instant::now() + RESPONSE_PENDING_TIMEOUT;
        let mut wait = timeout;
        loop {
            let reply = sub.recv_timeout(wait).await?;
            if is_response_pending(&reply.data) {
                if Instant::now() >= deadline {
                    return Err(CanError::Timeout("response pending for too long".to_string()).into());
                }
                debug!(%reply, "Response pending");
                wait = RESPONSE_PENDING_TIMEOUT;
                continue;
            }
            return Ok(reply.data);
        }
    }

    async fn request(&self, data: Vec<u8>, timeout: Duration) -> Result<Bytes> {
        let id = self.response_id();
        self.exchange(CanFrame::response_required(REQ_MSG_ID, data), &[id], timeout)
            .await
    }

    /// Acknowledge an ECU frame on 0x266
    pub async fn ack(&self, flag: u8, kind: FrameKind) -> Result<()> {
        let frame = CanFrame::new(RESP_CHUNK_CONF_ID, vec![0x40, 0xA1, 0x3F, flag & 0xBF, 0, 0, 0, 0]).with_kind(kind);
        self.can.send(frame).await?;
        Ok(())
    }

    // =========================================================================
    // Session
    // =========================================================================

    /// StartCommunication. Returns the reply identifier the ECU will use.
    pub async fn start_session(&self) -> Result<u32> {
        let frame = CanFrame::response_required(
            INIT_MSG_ID,
            vec![0x3F, service::START_COMMUNICATION, 0x00, 0x11, 0x02, 0x42, 0x00, 0x00],
        );
        let d = self.exchange(frame, &[INIT_RESP_ID], self.timeout).await?;
        require_len(&d, 8, "StartSession")?;
        if d[3] != service::START_COMMUNICATION + 0x40 {
            return Err(ProtocolError::negative(
                service::START_COMMUNICATION,
                0x10,
                "StartSession",
            ));
        }
        let id = u32::from(d[6]) << 8 | u32::from(d[7]);
        self.response_id.store(id, Ordering::SeqCst);
        info!(response_id = %format!("0x{:03X}", id), "KWP session started");
        Ok(id)
    }

    /// StopCommunication. Fire and forget; safe to call more than once.
    pub async fn stop_session(&self) -> Result<()> {
        self.granted.store(false, Ordering::SeqCst);
        let frame = CanFrame::new(REQ_MSG_ID, vec![0x40, 0xA1, 0x02, service::STOP_COMMUNICATION, 0, 0, 0, 0]);
        self.can.send(frame).await?;
        debug!("KWP session stopped");
        Ok(())
    }

    pub async fn tester_present(&self) -> Result<()> {
        let d = self
            .request(vec![0x40, 0xA1, 0x01, service::TESTER_PRESENT], self.timeout)
            .await?;
        check_response(&d, "TesterPresent")
    }

    /// TesterPresent, but only when nothing has been sent for 800 ms
    pub async fn keep_alive(&self) -> Result<bool> {
        if self.idle_for() < TESTER_PRESENT_INTERVAL {
            return Ok(false);
        }
        self.tester_present().await?;
        Ok(true)
    }

    // =========================================================================
    // Security
    // =========================================================================

    /// Try every known key derivation until one is accepted. A previous
    /// grant is reused unless `force` is set.
    pub async fn request_security_access(&self, force: bool) -> Result<()> {
        if self.security_granted() && !force {
            return Ok(());
        }
        for method in 0..KEY_METHODS.len() {
            match self.let_me_in(method).await {
                Ok(true) => {
                    self.granted.store(true, Ordering::SeqCst);
                    info!(method, "Security access granted");
                    return Ok(());
                }
                Ok(false) => warn!(method, "Security key not accepted"),
                Err(e) => warn!(method, %e, "Security access attempt failed"),
            }
            if method + 1 < KEY_METHODS.len() {
                tokio::time::sleep(self.security_backoff).await;
            }
        }
        Err(ProtocolError::SecurityDenied)
    }

    async fn let_me_in(&self, method: usize) -> Result<bool> {
        let d = self
            .request(
                vec![0x40, 0xA1, 0x02, service::SECURITY_ACCESS, DEVELOPMENT_PRIORITY],
                self.timeout,
            )
            .await?;
        check_response(&d, "SecurityAccess")?;
        require_len(&d, 7, "SecurityAccess")?;
        self.ack(d[0], FrameKind::ResponseRequired).await?;

        let seed = u16::from(d[5]) << 8 | u16::from(d[6]);
        let key = calc_key(seed, method).ok_or_else(|| ProtocolError::InvalidRequest(format!("no key method {}", method)))?;
        debug!(seed = %format!("0x{:04X}", seed), key = %format!("0x{:04X}", key), method, "Security seed");

        tokio::time::sleep(SEED_KEY_DELAY).await;

        let [hi, lo] = key.to_be_bytes();
        let d2 = self
            .request(
                vec![0x40, 0xA1, 0x04, service::SECURITY_ACCESS, DEVELOPMENT_PRIORITY + 1, hi, lo],
                self.timeout * 2,
            )
            .await?;
        check_response(&d2, "SecurityAccess")?;
        require_len(&d2, 6, "SecurityAccess")?;
        self.ack(d2[0], FrameKind::ResponseRequired).await?;

        Ok(d2[3] == service::SECURITY_ACCESS + 0x40 && (d2[4] == 0x34 || d2[5] == 0x34))
    }

    // =========================================================================
    // Dynamically defined local identifier
    // =========================================================================

    pub async fn clear_dynamically_defined_local_id(&self) -> Result<()> {
        let d = self
            .request(
                vec![0x40, 0xA1, 0x02, service::DYNAMICALLY_DEFINE_LOCAL_IDENTIFIER, DM_CDDLI],
                self.timeout * 2,
            )
            .await?;
        check_response(&d, "ClearDynamicallyDefinedLocalId")
    }

    /// Register symbol `number` at position `index` of the composite record
    pub async fn define_local_id(&self, index: u8, number: u16) -> Result<()> {
        let [hi, lo] = number.to_be_bytes();
        let body = [DDLI_RECORD, DM_DBMA, index, 0x00, 0x80, hi, lo];
        let mut message = vec![body.len() as u8 + 1, service::DYNAMICALLY_DEFINE_LOCAL_IDENTIFIER];
        message.extend_from_slice(&body);

        let response_id = self.response_id();
        for frame in split_request(REQ_MSG_ID, &message, false) {
            if frame.expects_response() {
                let d = self
                    .exchange(frame, &[REQ_CHUNK_CONF_ID, response_id], self.timeout)
                    .await?;
                require_len(&d, 6, "DynamicallyDefineLocalId")?;
                translate_error_code(service::DYNAMICALLY_DEFINE_LOCAL_IDENTIFIER, d[5], "DynamicallyDefineLocalId")?;
            } else {
                self.can.send(frame).await?;
            }
        }
        Ok(())
    }

    /// Clear the record, then define `numbers` in order
    pub async fn setup_ddli(&self, numbers: &[u16]) -> Result<()> {
        self.clear_dynamically_defined_local_id().await?;
        for (index, number) in numbers.iter().enumerate() {
            self.define_local_id(index as u8, *number).await?;
            tokio::time::sleep(DDLI_DEFINE_DELAY).await;
        }
        info!(count = numbers.len(), "DDLI configured");
        Ok(())
    }

    // =========================================================================
    // Data transfer
    // =========================================================================

    /// Walk a chained reply. `header` is the number of message bytes before
    /// the data (service echo plus parameters).
    async fn collect_chain(&self, first: Bytes, header: usize, context: &str) -> Result<Vec<u8>> {
        require_len(&first, 8, context)?;
        let start = 3 + header;
        let total = usize::from(first[2]).saturating_sub(header);
        let mut out = Vec::with_capacity(total);

        let take = total.min(8 - start);
        out.extend_from_slice(&first[start..start + take]);

        let response_id = self.response_id();
        let mut d = first;
        while remaining(d[0]) != 0 {
            let ack = CanFrame::response_required(RESP_CHUNK_CONF_ID, vec![0x40, 0xA1, 0x3F, d[0] & !0x40]);
            d = self.exchange(ack, &[response_id], self.timeout).await?;
            require_len(&d, 2, context)?;
            let take = (total - out.len()).min(6).min(d.len() - 2);
            out.extend_from_slice(&d[2..2 + take]);
        }
        if out.len() != total {
            return Err(ProtocolError::LengthMismatch {
                expected: total,
                got: out.len(),
            });
        }
        Ok(out)
    }

    /// ReadDataByLocalIdentifier, following the continuation chain
    pub async fn read_data_by_identifier(&self, id: u8) -> Result<Vec<u8>> {
        let d = self
            .request(vec![0x40, 0xA1, 0x02, service::READ_DATA_BY_LOCAL_IDENTIFIER, id], self.timeout)
            .await?;
        check_response(&d, "ReadDataByIdentifier")?;
        self.collect_chain(d, 2, "ReadDataByIdentifier").await
    }

    pub async fn read_ecu_identification(&self, id: u8) -> Result<Vec<u8>> {
        let d = self
            .request(vec![0x40, 0xA1, 0x02, service::READ_ECU_IDENTIFICATION, id], self.timeout)
            .await?;
        check_response(&d, "ReadEcuIdentification")?;
        self.collect_chain(d, 2, "ReadEcuIdentification").await
    }

    /// ReadMemoryByAddress, paged in [`MAX_READ`]-byte windows
    pub async fn read_memory_by_address(&self, address: u32, length: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(length);
        while out.len() < length {
            let chunk = (length - out.len()).min(MAX_READ);
            let page = self.read_memory_page(address + out.len() as u32, chunk as u8).await?;
            if page.is_empty() {
                return Err(ProtocolError::LengthMismatch {
                    expected: length,
                    got: out.len(),
                });
            }
            out.extend_from_slice(&page);
        }
        Ok(out)
    }

    async fn read_memory_page(&self, address: u32, length: u8) -> Result<Vec<u8>> {
        let [_, a2, a1, a0] = address.to_be_bytes();
        let d = self
            .request(
                vec![0x40, 0xA1, 0x05, service::READ_MEMORY_BY_ADDRESS, a2, a1, a0, length],
                self.timeout,
            )
            .await?;
        check_response(&d, "ReadMemoryByAddress")?;
        self.collect_chain(d, 4, "ReadMemoryByAddress").await
    }

    /// WriteDataByAddress for up to 250 bytes
    pub async fn write_data_by_address(&self, address: u32, data: &[u8]) -> Result<()> {
        if data.len() > 250 {
            return Err(ProtocolError::InvalidRequest(format!(
                "{} bytes is too long for one WriteDataByAddress",
                data.len()
            )));
        }
        let [_, a2, a1, a0] = address.to_be_bytes();
        let mut message = vec![4 + data.len() as u8, service::WRITE_DATA_BY_ADDRESS, a2, a1, a0, data.len() as u8];
        message.extend_from_slice(data);
        self.send_long(&message, "WriteDataByAddress").await
    }

    /// Write `data` in [`WRITE_CHUNK`]-byte pieces
    pub async fn write_memory(&self, address: u32, data: &[u8]) -> Result<()> {
        for (i, chunk) in data.chunks(WRITE_CHUNK).enumerate() {
            self.write_data_by_address(address + (i * WRITE_CHUNK) as u32, chunk)
                .await?;
        }
        Ok(())
    }

    async fn send_long(&self, message: &[u8], context: &str) -> Result<()> {
        let frames = split_request(REQ_MSG_ID, message, true);
        let last = frames.len().saturating_sub(1);
        let response_id = self.response_id();
        for (i, frame) in frames.into_iter().enumerate() {
            let reply_id = if i == last { response_id } else { REQ_CHUNK_CONF_ID };
            let d = self.exchange(frame, &[reply_id], self.timeout).await?;
            check_response(&d, context)?;
        }
        Ok(())
    }

    // =========================================================================
    // Routines and flashing
    // =========================================================================

    pub async fn reset_ecu(&self) -> Result<()> {
        let d = self
            .request(vec![0x40, 0xA1, 0x02, service::ECU_RESET, 0x01], self.timeout)
            .await?;
        check_response(&d, "ResetECU")?;
        require_len(&d, 5, "ResetECU")?;
        if d[3] != service::ECU_RESET + 0x40 || d[4] != 0x81 {
            return Err(ProtocolError::unexpected("ResetECU", hex::encode_upper(&d)));
        }
        Ok(())
    }

    /// StartRoutineByLocalIdentifier with up to three parameter bytes
    pub async fn start_routine_by_identifier(&self, id: u8, extra: &[u8]) -> Result<Bytes> {
        if extra.len() > 3 {
            return Err(ProtocolError::InvalidRequest(format!(
                "routine 0x{:02X}: {} parameter bytes do not fit one frame",
                id,
                extra.len()
            )));
        }
        let mut payload = vec![0x40, 0xA1, 2 + extra.len() as u8, service::START_ROUTINE_BY_LOCAL_IDENTIFIER, id];
        payload.extend_from_slice(extra);
        let d = self.request(payload, self.timeout).await?;
        check_response(&d, "StartRoutineByIdentifier")?;
        Ok(d)
    }

    pub async fn request_download(&self, address: u32, length: u32) -> Result<()> {
        let [_, a2, a1, a0] = address.to_be_bytes();
        let [_, l2, l1, l0] = length.to_be_bytes();
        let message = [0x08, service::REQUEST_DOWNLOAD, a2, a1, a0, 0x00, l2, l1, l0];
        let response_id = self.response_id();
        for frame in split_request2(REQ_MSG_ID, &message) {
            if !frame.expects_response() {
                self.can.send(frame).await?;
                continue;
            }
            let d = self.exchange(frame, &[response_id], self.timeout).await?;
            check_response(&d, "RequestDownload")?;
            require_len(&d, 4, "RequestDownload")?;
            if d[3] != service::REQUEST_DOWNLOAD + 0x40 {
                return Err(ProtocolError::unexpected("RequestDownload", hex::encode_upper(&d)));
            }
        }
        Ok(())
    }

    /// Collect `length` bytes of an upload through repeated TransferData
    pub async fn transfer_data(&self, length: usize) -> Result<Vec<u8>> {
        let response_id = self.response_id();
        let mut out = Vec::with_capacity(length);
        'outer: while out.len() < length {
            let b = self
                .request(vec![0x40, 0xA1, 0x01, service::TRANSFER_DATA], self.timeout)
                .await?;
            check_response(&b, "TransferData")?;
            require_len(&b, 8, "TransferData")?;

            let mut to_read = usize::from(b[2]);
            if to_read >= 5 {
                out.push(b[7]);
                to_read -= 5;
            }
            if is_last(b[0]) {
                self.ack(b[0], FrameKind::Outgoing).await?;
                continue;
            }

            let mut sub = self.can.subscribe(&[response_id]);
            self.ack(b[0], FrameKind::ResponseRequired).await?;
            while to_read > 0 {
                let f = sub.recv_timeout(TRANSFER_FRAME_TIMEOUT).await?;
                let d = &f.data;
                require_len(d, 2, "TransferData")?;
                let take = to_read.min(6).min(d.len() - 2);
                out.extend_from_slice(&d[2..2 + take]);
                to_read -= take;
                let kind = if is_last(d[0]) {
                    FrameKind::Outgoing
                } else {
                    FrameKind::ResponseRequired
                };
                self.ack(d[0], kind).await?;
                if out.len() >= length {
                    break 'outer;
                }
            }
        }
        out.truncate(length);
        Ok(out)
    }

    pub async fn request_transfer_exit(&self) -> Result<()> {
        let d = self
            .request(vec![0x40, 0xA1, 0x01, service::REQUEST_TRANSFER_EXIT], self.timeout)
            .await?;
        check_response(&d, "RequestTransferExit")?;
        require_len(&d, 4, "RequestTransferExit")?;
        if d[3] != service::REQUEST_TRANSFER_EXIT + 0x40 {
            return Err(ProtocolError::unexpected("RequestTransferExit", hex::encode_upper(&d)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MockConfig;
    use crate::mock::{MockCanAdapter, Script};
    use pretty_assertions::assert_eq;

    fn setup() -> (Arc<MockCanAdapter>, KwpClient) {
        let mock = Arc::new(MockCanAdapter::new(&MockConfig::default()));
        let can = Arc::new(CanClient::new(mock.clone()));
        let kwp = KwpClient::new(can)
            .with_timeout(Duration::from_millis(100))
            .with_security_backoff(Duration::from_millis(1));
        (mock, kwp)
    }

    #[tokio::test]
    async fn test_start_session_reads_response_id() {
        let (mock, kwp) = setup();
        mock.script(Script::on(INIT_MSG_ID, [0x3F, 0x81]).reply(INIT_RESP_ID, vec![0x40, 0xBF, 0x21, 0xC1, 0x8F, 0xEF, 0x02, 0x58]));
        assert_eq!(kwp.start_session().await.unwrap(), 0x258);
        assert_eq!(
            mock.sent_to(INIT_MSG_ID)[0].data.as_ref(),
            &[0x3F, 0x81, 0x00, 0x11, 0x02, 0x42, 0x00, 0x00]
        );
    }

    #[tokio::test]
    async fn test_start_session_rejected() {
        let (mock, kwp) = setup();
        mock.script(Script::on(INIT_MSG_ID, [0x3F]).reply(INIT_RESP_ID, vec![0x40, 0xBF, 0x21, 0x7F, 0x81, 0x10, 0x00, 0x00]));
        assert!(matches!(kwp.start_session().await, Err(ProtocolError::Negative { .. })));
    }

    #[tokio::test]
    async fn test_check_response_translates_code() {
        let err = check_response(&[0xC0, 0xBF, 0x03, 0x7F, 0x23, 0x31, 0, 0], "ReadMemoryByAddress").unwrap_err();
        assert_eq!(err.code(), Some(0x31));
        assert!(check_response(&[0xC0, 0xBF, 0x01, 0x7E, 0, 0, 0, 0], "TesterPresent").is_ok());
        assert!(translate_error_code(0x2C, 0x00, "x").is_ok());
        assert!(translate_error_code(0x2C, 0x22, "x").is_err());
    }

    #[tokio::test]
    async fn test_response_pending_is_waited_through() {
        let (mock, kwp) = setup();
        mock.script(
            Script::on(REQ_MSG_ID, [0x40, 0xA1, 0x01, 0x3E])
                .reply(0x258, vec![0xC0, 0xBF, 0x03, 0x7F, 0x3E, 0x78, 0, 0])
                .reply(0x258, vec![0xC0, 0xBF, 0x01, 0x7E, 0, 0, 0, 0]),
        );
        kwp.tester_present().await.unwrap();
    }

    #[tokio::test]
    async fn test_security_access_second_method() {
        let (mock, kwp) = setup();
        let seed_reply = vec![0xC0, 0xBF, 0x04, 0x67, 0x05, 0xA1, 0xB2, 0x00];
        mock.script(Script::on(REQ_MSG_ID, [0x40, 0xA1, 0x02, 0x27, 0x05]).reply(0x258, seed_reply));
        // only the method-1 key is accepted
        mock.script(
            Script::on(REQ_MSG_ID, [0x40, 0xA1, 0x04, 0x27, 0x06, 0xA6, 0xDA])
                .reply(0x258, vec![0xC0, 0xBF, 0x03, 0x67, 0x06, 0x34, 0x00, 0x00]),
        );
        mock.script(
            Script::on(REQ_MSG_ID, [0x40, 0xA1, 0x04, 0x27, 0x06])
                .reply(0x258, vec![0xC0, 0xBF, 0x03, 0x7F, 0x27, 0x35, 0x00, 0x00]),
        );

        kwp.request_security_access(false).await.unwrap();
        assert!(kwp.security_granted());
        let keys: Vec<Vec<u8>> = mock
            .sent_to(REQ_MSG_ID)
            .iter()
            .filter(|f| f.data.get(4) == Some(&0x06))
            .map(|f| f.data[5..7].to_vec())
            .collect();
        assert_eq!(keys, vec![vec![0xE4, 0x34], vec![0xA6, 0xDA]]);

        // cached
        mock.clear_sent();
        kwp.request_security_access(false).await.unwrap();
        assert!(mock.sent().is_empty());
    }

    #[tokio::test]
    async fn test_security_denied_after_all_methods() {
        let (mock, kwp) = setup();
        mock.script(
            Script::on(REQ_MSG_ID, [0x40, 0xA1, 0x02, 0x27, 0x05])
                .reply(0x258, vec![0xC0, 0xBF, 0x04, 0x67, 0x05, 0x12, 0x34, 0x00]),
        );
        mock.script(
            Script::on(REQ_MSG_ID, [0x40, 0xA1, 0x04, 0x27, 0x06])
                .reply(0x258, vec![0xC0, 0xBF, 0x03, 0x7F, 0x27, 0x35, 0x00, 0x00]),
        );
        assert_eq!(
            kwp.request_security_access(false).await.unwrap_err(),
            ProtocolError::SecurityDenied
        );
    }

    #[tokio::test]
    async fn test_define_local_id_frames() {
        let (mock, kwp) = setup();
        mock.script(Script::on(REQ_MSG_ID, [0xC1, 0xA1]).reply(REQ_CHUNK_CONF_ID, vec![0x00, 0xBF, 0x00, 0x6C, 0x00, 0x00, 0, 0]));
        kwp.define_local_id(2, 0x012C).await.unwrap();
        let sent = mock.sent_to(REQ_MSG_ID);
        assert_eq!(sent[0].data.as_ref(), &[0xC1, 0xA1, 0x08, 0x2C, 0xF0, 0x03, 0x02, 0x00]);
        assert_eq!(sent[1].data.as_ref(), &[0x00, 0xA1, 0x80, 0x01, 0x2C]);
    }

    #[tokio::test]
    async fn test_read_data_by_identifier_chain() {
        let (mock, kwp) = setup();
        let message = [0x61, 0xF0, 0x01, 0x2C, 0x00, 0x00, 0x12, 0x34];
        mock.script_kwp_reply(
            Script::on(REQ_MSG_ID, [0x40, 0xA1, 0x02, 0x21, 0xF0]),
            0x258,
            &message,
        );
        let data = kwp.read_data_by_identifier(DDLI_RECORD).await.unwrap();
        assert_eq!(data, vec![0x01, 0x2C, 0x00, 0x00, 0x12, 0x34]);
        assert_eq!(mock.sent_to(RESP_CHUNK_CONF_ID)[0].data.as_ref(), &[0x40, 0xA1, 0x3F, 0x01]);
    }

    #[tokio::test]
    async fn test_read_memory_paginates() {
        let (mock, kwp) = setup();
        let page1: Vec<u8> = (0..244u32).map(|i| i as u8).collect();
        let mut msg1 = vec![0x63, 0x0F, 0x00, 0x00];
        msg1.extend(&page1);
        mock.script_kwp_reply(
            Script::on(REQ_MSG_ID, [0x40, 0xA1, 0x05, 0x23, 0x0F, 0x00, 0x00, 244]).once(),
            0x258,
            &msg1,
        );
        mock.script_kwp_reply(
            Script::on(REQ_MSG_ID, [0x40, 0xA1, 0x05, 0x23, 0x0F, 0x00, 0xF4, 1]).once(),
            0x258,
            &[0x63, 0x0F, 0x00, 0xF4, 0xAA],
        );

        let data = kwp.read_memory_by_address(0x0F_0000, 245).await.unwrap();
        assert_eq!(data.len(), 245);
        assert_eq!(&data[..244], page1.as_slice());
        assert_eq!(data[244], 0xAA);
    }

    #[tokio::test]
    async fn test_write_data_by_address_confirms_chunks() {
        let (mock, kwp) = setup();
        mock.script(Script::on(REQ_MSG_ID, [0xC1, 0xA1]).reply(REQ_CHUNK_CONF_ID, vec![0x00, 0xBF, 0, 0, 0, 0, 0, 0]));
        mock.script(Script::on(REQ_MSG_ID, [0x00, 0xA1]).reply(0x258, vec![0xC0, 0xBF, 0x01, 0x7D, 0, 0, 0, 0]));
        kwp.write_data_by_address(0x0F1234, &[1, 2, 3]).await.unwrap();
        let sent = mock.sent_to(REQ_MSG_ID);
        assert_eq!(sent[0].data.as_ref(), &[0xC1, 0xA1, 0x07, 0x3D, 0x0F, 0x12, 0x34, 0x03]);
        assert_eq!(sent[1].data.as_ref(), &[0x00, 0xA1, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_reset_and_transfer_exit() {
        let (mock, kwp) = setup();
        mock.script(Script::on(REQ_MSG_ID, [0x40, 0xA1, 0x02, 0x11]).reply(0x258, vec![0xC0, 0xBF, 0x02, 0x51, 0x81, 0, 0, 0]));
        mock.script(Script::on(REQ_MSG_ID, [0x40, 0xA1, 0x01, 0x37]).reply(0x258, vec![0xC0, 0xBF, 0x01, 0x76, 0, 0, 0, 0]));
        kwp.reset_ecu().await.unwrap();
        assert!(matches!(
            kwp.request_transfer_exit().await,
            Err(ProtocolError::UnexpectedResponse { .. })
        ));
    }

    #[tokio::test]
    async fn test_timeout_surfaces_as_transport_error() {
        let (_mock, kwp) = setup();
        let err = kwp.tester_present().await.unwrap_err();
        assert!(matches!(err, ProtocolError::Transport(CanError::Timeout(_))));
    }
}
