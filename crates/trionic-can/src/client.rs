//! Frame router on top of a single adapter

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::adapter::CanAdapter;
use crate::config::ClientConfig;
use crate::{CanError, CanFrame, FrameKind};

struct Route {
    id: u64,
    filter: Vec<u32>,
    tx: mpsc::Sender<CanFrame>,
}

impl Route {
    fn accepts(&self, frame_id: u32) -> bool {
        self.filter.is_empty() || self.filter.contains(&frame_id)
    }
}

type Routes = Arc<Mutex<Vec<Route>>>;

/// Receiving end of [`CanClient::subscribe`]. Dropping it unregisters the route.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<CanFrame>,
    routes: Weak<Mutex<Vec<Route>>>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<CanFrame> {
        self.rx.recv().await
    }

    /// Next frame, or `Timeout` once `timeout` has passed
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<CanFrame, CanError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(CanError::ConnectionClosed),
            Err(_) => Err(CanError::Timeout(format!("no frame within {:?}", timeout))),
        }
    }

    /// Frame already queued, if any
    pub fn try_recv(&mut self) -> Option<CanFrame> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(routes) = self.routes.upgrade() {
            routes.lock().retain(|r| r.id != self.id);
        }
    }
}

/// Owns one adapter and fans its frames out to filtered subscriptions.
///
/// A full subscriber queue drops the frame for that subscriber only; the
/// router never waits on a slow consumer.
pub struct CanClient {
    adapter: Arc<dyn CanAdapter>,
    routes: Routes,
    next_id: AtomicU64,
    capacity: usize,
    router: JoinHandle<()>,
}

impl CanClient {
    pub fn new(adapter: Arc<dyn CanAdapter>) -> Self {
        Self::with_config(adapter, &ClientConfig::default())
    }

    pub fn with_config(adapter: Arc<dyn CanAdapter>, config: &ClientConfig) -> Self {
        let routes: Routes = Arc::new(Mutex::new(Vec::new()));
        let router = Self::start_router(adapter.as_ref(), routes.clone());
        Self {
            adapter,
            routes,
            next_id: AtomicU64::new(1),
            capacity: config.subscriber_capacity.max(1),
            router,
        }
    }

    fn start_router(adapter: &dyn CanAdapter, routes: Routes) -> JoinHandle<()> {
        let mut incoming = adapter.subscribe();
        let name = adapter.name().to_string();
        tokio::spawn(async move {
            loop {
                match incoming.recv().await {
                    Ok(frame) => {
                        debug!(%frame, "Incoming frame");
                        let mut routes = routes.lock();
                        routes.retain(|route| {
                            if !route.accepts(frame.id) {
                                return true;
                            }
                            match route.tx.try_send(frame.clone()) {
                                Ok(()) => true,
                                Err(TrySendError::Full(_)) => {
                                    warn!(
                                        id = %format!("0x{:03X}", frame.id),
                                        subscriber = route.id,
                                        "Subscriber queue full, dropping frame"
                                    );
                                    true
                                }
                                Err(TrySendError::Closed(_)) => false,
                            }
                        });
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!(adapter = %name, skipped = n, "Router lagged behind adapter");
                    }
                    Err(RecvError::Closed) => {
                        debug!(adapter = %name, "Adapter channel closed, router stopped");
                        // drop every sender so waiters see ConnectionClosed
                        routes.lock().clear();
                        break;
                    }
                }
            }
        })
    }

    pub fn adapter(&self) -> &Arc<dyn CanAdapter> {
        &self.adapter
    }

    pub fn adapter_name(&self) -> &str {
        self.adapter.name()
    }

    pub fn is_bridge(&self) -> bool {
        self.adapter.capabilities().bridge
    }

    /// Frames whose identifier is in `ids`; an empty slice matches everything
    pub fn subscribe(&self, ids: &[u32]) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.routes.lock().push(Route {
            id,
            filter: ids.to_vec(),
            tx,
        });
        Subscription {
            id,
            rx,
            routes: Arc::downgrade(&self.routes),
        }
    }

    pub async fn send(&self, frame: CanFrame) -> Result<(), CanError> {
        self.adapter.send(frame).await
    }

    pub async fn send_frame(&self, id: u32, data: impl Into<bytes::Bytes>, kind: FrameKind) -> Result<(), CanError> {
        self.send(CanFrame::new(id, data).with_kind(kind)).await
    }

    /// Send `frame` and return the first subsequent frame carrying one of `ids`
    pub async fn send_and_wait(&self, frame: CanFrame, timeout: Duration, ids: &[u32]) -> Result<CanFrame, CanError> {
        let mut sub = self.subscribe(ids);
        self.send(frame).await?;
        sub.recv_timeout(timeout).await
    }

    /// Next frame carrying one of `ids`
    pub async fn wait(&self, timeout: Duration, ids: &[u32]) -> Result<CanFrame, CanError> {
        self.subscribe(ids).recv_timeout(timeout).await
    }

    pub fn subscriber_count(&self) -> usize {
        self.routes.lock().len()
    }

    pub async fn close(&self) -> Result<(), CanError> {
        self.router.abort();
        self.routes.lock().clear();
        self.adapter.close().await
    }
}

impl Drop for CanClient {
    fn drop(&mut self) {
        self.router.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MockConfig;
    use crate::mock::{MockCanAdapter, Script};

    fn client_with_mock() -> (Arc<MockCanAdapter>, CanClient) {
        let mock = Arc::new(MockCanAdapter::new(&MockConfig::default()));
        let client = CanClient::new(mock.clone());
        (mock, client)
    }

    #[tokio::test]
    async fn test_send_and_wait_filters_ids() {
        let (mock, client) = client_with_mock();
        mock.script(
            Script::on(0x242, [0x40])
                .reply(0x1A0, vec![0x00, 0x0B, 0xB8])
                .reply(0x258, vec![0xC0, 0xBF, 0x02, 0x7E]),
        );
        let resp = client
            .send_and_wait(CanFrame::new(0x242, vec![0x40, 0xA1, 0x01, 0x3E]), Duration::from_millis(200), &[0x258])
            .await
            .unwrap();
        assert_eq!(resp.id, 0x258);
        assert_eq!(resp.data[3], 0x7E);
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let (_mock, client) = client_with_mock();
        let err = client.wait(Duration::from_millis(20), &[0x7E8]).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_full_subscriber_drops_without_blocking() {
        let mock = Arc::new(MockCanAdapter::new(&MockConfig::default()));
        let client = CanClient::with_config(mock.clone(), &ClientConfig { subscriber_capacity: 2 });
        let mut slow = client.subscribe(&[0x3A0]);
        let mut all = client.subscribe(&[]);

        for i in 0..5u8 {
            mock.inject(CanFrame::new(0x3A0, vec![i]));
        }
        // the unfiltered route still sees traffic after the slow one filled up
        let mut seen = Vec::new();
        while let Ok(frame) = all.recv_timeout(Duration::from_millis(50)).await {
            seen.push(frame.data[0]);
        }
        assert_eq!(seen, vec![0, 1]);
        assert_eq!(slow.recv().await.unwrap().data[0], 0);
        assert_eq!(slow.recv().await.unwrap().data[0], 1);
        assert!(slow.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_dropping_subscription_unregisters() {
        let (_mock, client) = client_with_mock();
        let sub = client.subscribe(&[0x280]);
        assert_eq!(client.subscriber_count(), 1);
        drop(sub);
        assert_eq!(client.subscriber_count(), 0);
    }
}
