//! In-process event bus
//!
//! One actor task owns every subscriber queue, the last-value cache and the
//! aggregators. Publishers and subscribers only hold channel ends:
//!
//! ```text
//!  publish(topic, v) --[incoming, 1024]--+
//!                                        v
//!  subscribe/unsubscribe --[control]--> actor --[20 per subscriber]--> BusSubscription
//!                                        |
//!                                        +--> aggregators --> derived topics
//! ```
//!
//! A [`BusSubscription`] is owned by the caller. The actor keeps only its
//! sender, indexed by handle id, and drops it when the handle is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{LoggerError, Result};

/// Inbound queue depth
pub const INCOMING_CAPACITY: usize = 1024;
/// Per-subscriber queue depth
pub const SUBSCRIBER_CAPACITY: usize = 20;

/// Observer invoked for every message the bus processes
pub type MessageHook = Arc<dyn Fn(&str, f64) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub value: f64,
}

/// Reducer over two topics
#[derive(Debug, Clone)]
pub enum Aggregator {
    /// Publishes `second - first` once both inputs changed since the last emit
    Diff {
        first: String,
        second: String,
        output: String,
        values: (f64, f64),
        updated: (bool, bool),
    },
}

impl Aggregator {
    pub fn diff(first: impl Into<String>, second: impl Into<String>, output: impl Into<String>) -> Self {
        Aggregator::Diff {
            first: first.into(),
            second: second.into(),
            output: output.into(),
            values: (0.0, 0.0),
            updated: (false, false),
        }
    }

    /// The two built-in air mass deltas
    pub fn defaults() -> Vec<Aggregator> {
        vec![
            Aggregator::diff("MAF.m_AirInlet", "m_Request", "AirDIFF"),
            Aggregator::diff("MAF.m_AirInlet", "AirMassMast.m_Request", "AirDIFF"),
        ]
    }

    fn inputs(&self) -> [&str; 2] {
        match self {
            Aggregator::Diff { first, second, .. } => [first.as_str(), second.as_str()],
        }
    }

    /// Feed one message, returning the derived message if one is due
    fn update(&mut self, topic: &str, value: f64) -> Option<Message> {
        match self {
            Aggregator::Diff {
                first,
                second,
                output,
                values,
                updated,
            } => {
                if topic == first.as_str() {
                    values.0 = value;
                    updated.0 = true;
                } else if topic == second.as_str() {
                    values.1 = value;
                    updated.1 = true;
                }
                if updated.0 && updated.1 {
                    *updated = (false, false);
                    return Some(Message {
                        topic: output.clone(),
                        value: values.1 - values.0,
                    });
                }
                None
            }
        }
    }
}

enum Inbound {
    Publish(Message),
    /// Queued behind earlier publishes so the reply reflects them
    Snapshot(oneshot::Sender<HashMap<String, f64>>),
}

enum Control {
    Subscribe {
        id: u64,
        topic: String,
        tx: mpsc::Sender<f64>,
    },
    Unsubscribe(u64),
    OnMessage(Option<MessageHook>),
    Close,
}

/// Receiving end of [`Controller::subscribe`]. Dropping it unsubscribes.
pub struct BusSubscription {
    id: u64,
    topic: String,
    rx: mpsc::Receiver<f64>,
    control: mpsc::UnboundedSender<Control>,
}

impl BusSubscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next value, `None` once the bus is closed
    pub async fn recv(&mut self) -> Option<f64> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<f64> {
        self.rx.try_recv().ok()
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        let _ = self.control.send(Control::Unsubscribe(self.id));
    }
}

/// Handle to the bus actor. Cheap to clone; every clone talks to the same actor.
#[derive(Clone)]
pub struct Controller {
    incoming: mpsc::Sender<Inbound>,
    control: mpsc::UnboundedSender<Control>,
    next_id: Arc<AtomicU64>,
}

impl Controller {
    /// Start a bus with the default aggregators. Must be called inside a
    /// tokio runtime.
    pub fn new() -> Self {
        Self::with_aggregators(Aggregator::defaults())
    }

    pub fn with_aggregators(aggregators: Vec<Aggregator>) -> Self {
        let (incoming, incoming_rx) = mpsc::channel(INCOMING_CAPACITY);
        let (control, control_rx) = mpsc::unbounded_channel();
        let actor = Actor::new(aggregators);
        tokio::spawn(actor.run(incoming_rx, control_rx));
        Self {
            incoming,
            control,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Queue a value. Never waits: a full queue is reported as `PublishFull`.
    pub fn publish(&self, topic: &str, value: f64) -> Result<()> {
        let msg = Message {
            topic: topic.to_string(),
            value,
        };
        match self.incoming.try_send(Inbound::Publish(msg)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(LoggerError::PublishFull(topic.to_string())),
            Err(TrySendError::Closed(_)) => Err(LoggerError::BusClosed),
        }
    }

    /// Values published on `topic` from now on. The last cached value, if
    /// any, is delivered first.
    pub fn subscribe(&self, topic: &str) -> BusSubscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.control.send(Control::Subscribe {
            id,
            topic: topic.to_string(),
            tx,
        });
        BusSubscription {
            id,
            topic: topic.to_string(),
            rx,
            control: self.control.clone(),
        }
    }

    pub fn set_on_message(&self, hook: Option<MessageHook>) {
        let _ = self.control.send(Control::OnMessage(hook));
    }

    /// Last value of every topic published before this call
    pub async fn values(&self) -> Result<HashMap<String, f64>> {
        let (tx, rx) = oneshot::channel();
        self.incoming
            .send(Inbound::Snapshot(tx))
            .await
            .map_err(|_| LoggerError::BusClosed)?;
        rx.await.map_err(|_| LoggerError::BusClosed)
    }

    /// Stop the actor. Subscribers see the end of their stream.
    pub fn close(&self) {
        let _ = self.control.send(Control::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.incoming.is_closed()
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

struct Actor {
    subscribers: HashMap<String, Vec<(u64, mpsc::Sender<f64>)>>,
    cache: HashMap<String, f64>,
    aggregators: Vec<Aggregator>,
    /// topic → indices into `aggregators`
    by_topic: HashMap<String, Vec<usize>>,
    hook: Option<MessageHook>,
}

impl Actor {
    fn new(aggregators: Vec<Aggregator>) -> Self {
        let mut by_topic: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, agg) in aggregators.iter().enumerate() {
            for input in agg.inputs() {
                by_topic.entry(input.to_string()).or_default().push(index);
            }
        }
        Self {
            subscribers: HashMap::new(),
            cache: HashMap::new(),
            aggregators,
            by_topic,
            hook: None,
        }
    }

    async fn run(mut self, mut incoming: mpsc::Receiver<Inbound>, mut control: mpsc::UnboundedReceiver<Control>) {
        loop {
            tokio::select! {
                // registrations first, so a subscribe issued before a publish sees it
                biased;
                ctrl = control.recv() => match ctrl {
                    Some(Control::Close) | None => break,
                    Some(ctrl) => self.handle_control(ctrl),
                },
                inbound = incoming.recv() => match inbound {
                    Some(Inbound::Publish(msg)) => self.dispatch(msg),
                    Some(Inbound::Snapshot(reply)) => {
                        let _ = reply.send(self.cache.clone());
                    }
                    None => break,
                },
            }
        }
        debug!("Event bus stopped");
    }

    fn handle_control(&mut self, ctrl: Control) {
        match ctrl {
            Control::Subscribe { id, topic, tx } => {
                if let Some(value) = self.cache.get(&topic) {
                    let _ = tx.try_send(*value);
                }
                self.subscribers.entry(topic).or_default().push((id, tx));
            }
            Control::Unsubscribe(id) => {
                for subs in self.subscribers.values_mut() {
                    subs.retain(|(sub_id, _)| *sub_id != id);
                }
                self.subscribers.retain(|_, subs| !subs.is_empty());
            }
            Control::OnMessage(hook) => self.hook = hook,
            Control::Close => {}
        }
    }

    fn dispatch(&mut self, msg: Message) {
        let mut pending = vec![msg];
        while let Some(msg) = pending.pop() {
            self.cache.insert(msg.topic.clone(), msg.value);
            if let Some(hook) = &self.hook {
                hook(&msg.topic, msg.value);
            }
            if let Some(subs) = self.subscribers.get_mut(&msg.topic) {
                subs.retain(|(id, tx)| match tx.try_send(msg.value) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) => {
                        warn!(topic = %msg.topic, subscriber = id, "Subscriber channel full, dropping value");
                        true
                    }
                    Err(TrySendError::Closed(_)) => false,
                });
            }
            if let Some(indices) = self.by_topic.get(&msg.topic) {
                for &index in indices {
                    if let Some(derived) = self.aggregators[index].update(&msg.topic, msg.value) {
                        pending.push(derived);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    async fn next(sub: &mut BusSubscription) -> Option<f64> {
        tokio::time::timeout(Duration::from_millis(200), sub.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = Controller::new();
        let mut sub = bus.subscribe("ActualIn.n_Engine");
        bus.publish("ActualIn.n_Engine", 850.0).unwrap();
        bus.publish("Out.X_AccPedal", 12.0).unwrap();
        bus.publish("ActualIn.n_Engine", 900.0).unwrap();
        assert_eq!(next(&mut sub).await, Some(850.0));
        assert_eq!(next(&mut sub).await, Some(900.0));
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn test_cached_value_on_subscribe() {
        let bus = Controller::new();
        bus.publish("In.v_Vehicle", 88.5).unwrap();
        // let the actor process it
        let values = bus.values().await.unwrap();
        assert_eq!(values.get("In.v_Vehicle"), Some(&88.5));

        let mut late = bus.subscribe("In.v_Vehicle");
        assert_eq!(next(&mut late).await, Some(88.5));
    }

    #[tokio::test]
    async fn test_air_diff_emits_once() {
        let bus = Controller::new();
        let mut diff = bus.subscribe("AirDIFF");
        bus.publish("MAF.m_AirInlet", 400.0).unwrap();
        bus.publish("m_Request", 450.0).unwrap();
        assert_eq!(next(&mut diff).await, Some(50.0));

        // only one input changed
        bus.publish("m_Request", 500.0).unwrap();
        bus.values().await.unwrap();
        assert_eq!(diff.try_recv(), None);

        bus.publish("MAF.m_AirInlet", 420.0).unwrap();
        assert_eq!(next(&mut diff).await, Some(80.0));
    }

    #[tokio::test]
    async fn test_full_subscriber_drops() {
        let bus = Controller::with_aggregators(Vec::new());
        let mut sub = bus.subscribe("x");
        for i in 0..(SUBSCRIBER_CAPACITY + 5) {
            bus.publish("x", i as f64).unwrap();
        }
        bus.values().await.unwrap();
        let mut received = Vec::new();
        while let Some(v) = sub.try_recv() {
            received.push(v);
        }
        assert_eq!(received.len(), SUBSCRIBER_CAPACITY);
        assert_eq!(received[0], 0.0);
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_removed() {
        let bus = Controller::new();
        let sub = bus.subscribe("LIMP");
        drop(sub);
        let mut other = bus.subscribe("LIMP");
        bus.publish("LIMP", 1.0).unwrap();
        assert_eq!(next(&mut other).await, Some(1.0));
    }

    #[tokio::test]
    async fn test_on_message_hook() {
        let bus = Controller::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.set_on_message(Some(Arc::new(move |topic: &str, value: f64| {
            sink.lock().push((topic.to_string(), value));
        })));
        bus.publish("CEL", 1.0).unwrap();
        bus.values().await.unwrap();
        assert_eq!(seen.lock().clone(), vec![("CEL".to_string(), 1.0)]);
    }

    #[tokio::test]
    async fn test_close_ends_streams() {
        let bus = Controller::new();
        let mut sub = bus.subscribe("CRUISE");
        bus.close();
        assert_eq!(next(&mut sub).await, None);
        assert!(bus.values().await.is_err());
    }
}
