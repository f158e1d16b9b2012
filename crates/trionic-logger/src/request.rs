//! RAM read and write requests handed to the engine

use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::{LoggerError, Result};

/// How long a caller waits for the engine to finish a request
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RamOp {
    Read { length: u32 },
    Write { data: Vec<u8> },
}

/// One request. Completion consumes it, so a reply is sent at most once.
#[derive(Debug)]
pub struct RamRequest {
    pub address: u32,
    pub op: RamOp,
    reply: oneshot::Sender<Result<Vec<u8>>>,
}

/// Caller side of a [`RamRequest`]
#[derive(Debug)]
pub struct RamReply {
    rx: oneshot::Receiver<Result<Vec<u8>>>,
    context: &'static str,
}

impl RamRequest {
    pub fn read(address: u32, length: u32) -> (Self, RamReply) {
        Self::build(address, RamOp::Read { length }, "RAM read timeout")
    }

    pub fn write(address: u32, data: Vec<u8>) -> (Self, RamReply) {
        Self::build(address, RamOp::Write { data }, "RAM write timeout")
    }

    fn build(address: u32, op: RamOp, context: &'static str) -> (Self, RamReply) {
        let (reply, rx) = oneshot::channel();
        (Self { address, op, reply }, RamReply { rx, context })
    }

    pub fn length(&self) -> u32 {
        match &self.op {
            RamOp::Read { length } => *length,
            RamOp::Write { data } => data.len() as u32,
        }
    }

    pub fn complete(self, result: Result<Vec<u8>>) {
        // the caller may have timed out already
        let _ = self.reply.send(result);
    }

    pub fn cancel(self) {
        self.complete(Err(LoggerError::Cancelled));
    }
}

impl RamReply {
    /// Wait up to [`REQUEST_TIMEOUT`]
    pub async fn wait(self) -> Result<Vec<u8>> {
        self.wait_for(REQUEST_TIMEOUT).await
    }

    pub async fn wait_for(self, timeout: Duration) -> Result<Vec<u8>> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LoggerError::Cancelled),
            Err(_) => Err(LoggerError::RequestTimeout(self.context.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_complete() {
        let (req, reply) = RamRequest::read(0xF0_1000, 4);
        assert_eq!(req.length(), 4);
        req.complete(Ok(vec![1, 2, 3, 4]));
        assert_eq!(reply.wait().await.unwrap(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_dropped_request_is_cancelled() {
        let (req, reply) = RamRequest::write(0x1000, vec![0xAA]);
        drop(req);
        assert!(matches!(reply.wait().await, Err(LoggerError::Cancelled)));
    }

    #[tokio::test]
    async fn test_timeout() {
        let (_req, reply) = RamRequest::read(0x1000, 1);
        let err = reply.wait_for(Duration::from_millis(10)).await.unwrap_err();
        assert_eq!(err.to_string(), "RAM read timeout");
    }
}
