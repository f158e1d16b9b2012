//! Scripted CAN adapter for tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use crate::adapter::{CanAdapter, Capabilities};
use crate::config::MockConfig;
use crate::{CanError, CanFrame};

/// One scripted exchange: a sent frame matching `id` and `prefix` makes the
/// adapter emit `responses`.
#[derive(Debug, Clone)]
pub struct Script {
    pub id: Option<u32>,
    pub prefix: Vec<u8>,
    pub responses: Vec<CanFrame>,
    /// Consumed after the first match
    pub once: bool,
}

impl Script {
    pub fn on(id: u32, prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Some(id),
            prefix: prefix.into(),
            responses: Vec::new(),
            once: false,
        }
    }

    /// Match any identifier
    pub fn on_any(prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            id: None,
            prefix: prefix.into(),
            responses: Vec::new(),
            once: false,
        }
    }

    pub fn reply(mut self, id: u32, data: impl Into<Bytes>) -> Self {
        self.responses.push(CanFrame::new(id, data));
        self
    }

    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    fn matches(&self, frame: &CanFrame) -> bool {
        self.id.map_or(true, |id| id == frame.id) && frame.data.starts_with(&self.prefix)
    }
}

/// In-memory adapter that replays [`Script`]s and records everything sent
pub struct MockCanAdapter {
    config: MockConfig,
    connected: AtomicBool,
    incoming_tx: broadcast::Sender<CanFrame>,
    scripts: RwLock<VecDeque<Script>>,
    sent: Mutex<Vec<CanFrame>>,
    adc: RwLock<Vec<f64>>,
}

impl MockCanAdapter {
    pub fn new(config: &MockConfig) -> Self {
        let (incoming_tx, _) = broadcast::channel(1024);
        Self {
            config: config.clone(),
            connected: AtomicBool::new(true),
            incoming_tx,
            scripts: RwLock::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            adc: RwLock::new(Vec::new()),
        }
    }

    pub fn script(&self, script: Script) {
        self.scripts.write().push_back(script);
    }

    /// Answer `trigger` with a chained KWP reply carrying `message`. Each
    /// continuation frame is released by the tester's acknowledgement and
    /// is consumed only when `trigger` is.
    pub fn script_kwp_reply(&self, trigger: Script, response_id: u32, message: &[u8]) {
        let frames = crate::kwp2000::split_response(message);
        let Some((first, rest)) = frames.split_first() else {
            return;
        };
        let once = trigger.once;
        self.script(trigger.reply(response_id, first.clone()));
        let mut prev = first[0];
        for frame in rest {
            let mut chained = Script::on(crate::kwp2000::RESP_CHUNK_CONF_ID, [0x40, 0xA1, 0x3F, prev & !0x40])
                .reply(response_id, frame.clone());
            chained.once = once;
            self.script(chained);
            prev = frame[0];
        }
    }

    /// Simulate unsolicited bus traffic
    pub fn inject(&self, frame: CanFrame) {
        let _ = self.incoming_tx.send(frame);
    }

    pub fn sent(&self) -> Vec<CanFrame> {
        self.sent.lock().clone()
    }

    /// Sent frames carrying identifier `id`
    pub fn sent_to(&self, id: u32) -> Vec<CanFrame> {
        self.sent.lock().iter().filter(|f| f.id == id).cloned().collect()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_adc(&self, values: Vec<f64>) {
        *self.adc.write() = values;
    }

    fn find_responses(&self, frame: &CanFrame) -> Vec<CanFrame> {
        let mut scripts = self.scripts.write();
        let Some(pos) = scripts.iter().position(|s| s.matches(frame)) else {
            return Vec::new();
        };
        if scripts[pos].once {
            scripts.remove(pos).map(|s| s.responses).unwrap_or_default()
        } else {
            scripts[pos].responses.clone()
        }
    }
}

#[async_trait]
impl CanAdapter for MockCanAdapter {
    fn name(&self) -> &str {
        if self.config.bridge {
            "txbridge-mock"
        } else {
            "mock"
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            bridge: self.config.bridge,
            adc: self.config.bridge,
        }
    }

    async fn send(&self, frame: CanFrame) -> Result<(), CanError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(CanError::ConnectionClosed);
        }
        if self.config.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;
        }

        tracing::debug!(%frame, "Mock adapter: sent frame");
        let responses = self.find_responses(&frame);
        self.sent.lock().push(frame);
        for response in responses {
            let _ = self.incoming_tx.send(response);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<CanFrame> {
        self.incoming_tx.subscribe()
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn adc_value(&self, channel: u8) -> Result<f64, CanError> {
        if !self.config.bridge {
            return Err(CanError::Unsupported("mock adapter has no ADC".to_string()));
        }
        self.adc
            .read()
            .get(channel as usize)
            .copied()
            .ok_or_else(|| CanError::Rejected(format!("no ADC channel {}", channel)))
    }

    async fn close(&self) -> Result<(), CanError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_reply() {
        let mock = MockCanAdapter::new(&MockConfig::default());
        mock.script(Script::on(0x242, [0x40, 0xA1]).reply(0x258, vec![0xC0, 0xBF, 0x01]).once());
        let mut rx = mock.subscribe();

        mock.send(CanFrame::new(0x242, vec![0x40, 0xA1, 0x01, 0x3E])).await.unwrap();
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.id, 0x258);

        // consumed
        mock.send(CanFrame::new(0x242, vec![0x40, 0xA1, 0x01, 0x3E])).await.unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(mock.sent_to(0x242).len(), 2);
    }

    #[tokio::test]
    async fn test_disconnected() {
        let mock = MockCanAdapter::new(&MockConfig::default());
        mock.set_connected(false);
        assert_eq!(
            mock.send(CanFrame::new(1, vec![0])).await.unwrap_err(),
            CanError::ConnectionClosed
        );
        assert!(mock.adc_value(0).await.is_err());
    }
}
