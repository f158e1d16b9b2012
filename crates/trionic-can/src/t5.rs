//! Trionic 5 RAM access
//!
//! T5 has no diagnostic protocol to speak of. RAM is read six bytes at a
//! time with a `0xC7` poke and written either through the ASCII command
//! channel (single bytes) or in address-framed blocks.

use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use crate::error::{ProtocolError, Result};
use crate::{CanClient, CanFrame};

pub const REQUEST_ID: u32 = 0x05;
pub const RESPONSE_ID: u32 = 0x0C;

const CMD_READ: u8 = 0xC7;
const CMD_CHAR: u8 = 0xC4;
const CMD_CHAR_ACK: u8 = 0xC6;
const CMD_SET_ADDRESS: u8 = 0xA5;

/// Bytes returned by one read poke
pub const READ_CHUNK: usize = 6;
/// Largest block one address frame can announce
pub const MAX_WRITE_BLOCK: usize = 133;
const WRITE_CHUNK: usize = 7;

/// The ECU answers a poke for `a` with the bytes ending at `a`
const READ_BIAS: u32 = 5;

const TIMEOUT: Duration = Duration::from_millis(200);
const CHAR_TIMEOUT: Duration = Duration::from_secs(1);

pub struct T5Client {
    can: Arc<CanClient>,
    timeout: Duration,
}

impl T5Client {
    pub fn new(can: Arc<CanClient>) -> Self {
        Self { can, timeout: TIMEOUT }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn can(&self) -> &Arc<CanClient> {
        &self.can
    }

    async fn exchange(&self, data: Vec<u8>, timeout: Duration) -> Result<CanFrame> {
        let frame = CanFrame::response_required(REQUEST_ID, data);
        Ok(self.can.send_and_wait(frame, timeout, &[RESPONSE_ID]).await?)
    }

    async fn read_chunk(&self, address: u32) -> Result<[u8; READ_CHUNK]> {
        let resp = self
            .exchange(vec![CMD_READ, 0x00, 0x00, (address >> 8) as u8, address as u8], self.timeout)
            .await?;
        if resp.data.len() < 8 {
            return Err(ProtocolError::LengthMismatch {
                expected: 8,
                got: resp.data.len(),
            });
        }
        if resp.data[0] != CMD_READ {
            return Err(ProtocolError::unexpected("T5 read", &resp));
        }
        let mut out = [0u8; READ_CHUNK];
        out.copy_from_slice(&resp.data[2..8]);
        out.reverse();
        Ok(out)
    }

    /// Read `length` bytes of RAM starting at `address`
    pub async fn read_ram(&self, address: u32, length: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(length);
        while out.len() < length {
            let chunk = self.read_chunk(address + READ_BIAS + out.len() as u32).await?;
            let n = (length - out.len()).min(READ_CHUNK);
            out.extend_from_slice(&chunk[..n]);
        }
        trace!(address = %format!("0x{:04X}", address), length, "T5 RAM read");
        Ok(out)
    }

    /// Write RAM. A single byte at a 16-bit address goes through the
    /// command channel; anything else is sent in blocks.
    pub async fn write_ram(&self, address: u32, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if data.len() == 1 && address <= 0xFFFF {
            let command = format!("W{:04X}{:02X}\r", address, data[0]);
            return self.send_command(command.as_bytes()).await;
        }

        let mut address = address;
        for block in data.chunks(MAX_WRITE_BLOCK) {
            self.write_block(address, block).await?;
            address += block.len() as u32;
        }
        Ok(())
    }

    async fn write_block(&self, address: u32, block: &[u8]) -> Result<()> {
        let a = address.to_be_bytes();
        let resp = self
            .exchange(
                vec![CMD_SET_ADDRESS, a[0], a[1], a[2], a[3], block.len() as u8, 0x00, 0x00],
                self.timeout,
            )
            .await?;
        if resp.data.get(1) != Some(&0x00) {
            return Err(ProtocolError::unexpected("T5 set address", &resp));
        }

        for (i, chunk) in block.chunks(WRITE_CHUNK).enumerate() {
            let mut payload = vec![0u8; 8];
            payload[0] = (i * WRITE_CHUNK) as u8;
            payload[1..1 + chunk.len()].copy_from_slice(chunk);
            let resp = self.exchange(payload, self.timeout).await?;
            if resp.data.get(1) != Some(&0x00) {
                return Err(ProtocolError::unexpected(
                    format!("T5 write at offset {}", i * WRITE_CHUNK),
                    &resp,
                ));
            }
        }
        Ok(())
    }

    /// Feed characters into the ECU's command interpreter
    pub async fn send_command(&self, command: &[u8]) -> Result<()> {
        for &ch in command {
            let resp = self.exchange(vec![CMD_CHAR, ch], CHAR_TIMEOUT).await?;
            if resp.data.first() != Some(&CMD_CHAR_ACK) {
                return Err(ProtocolError::unexpected("T5 command", &resp));
            }
        }
        Ok(())
    }
}
