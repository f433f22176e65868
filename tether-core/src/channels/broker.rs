//! Pub/sub broker.
//!
//! `send` pushes onto one message queue. A dedicated broker thread pops each
//! message, finds every subscribed channel whose topic matches and schedules
//! one delivery per match on the channel worker pool. Queue channels get a
//! copy pushed onto their own receiver instead.

use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::bridge::{self, BridgeSink};
use super::message::{Message, SendOptions};
use super::topic::TopicPattern;
use crate::error::BusError;
use crate::worker_pool::{panic_message, WorkerPool};

pub const SUBSCRIBE_TOPIC: &str = "_tether.channel.subscribe";
pub const UNSUBSCRIBE_TOPIC: &str = "_tether.channel.unsubscribe";

pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;
pub type Handler = Arc<dyn Fn(&Message) -> HandlerResult + Send + Sync>;

enum Subscriber {
    Handler(Handler),
    Queue(mpsc::Sender<Message>),
}

struct Subscription {
    topic: TopicPattern,
    subscriber: Subscriber,
}

struct BrokerInner {
    issuer: String,
    channels: DashMap<u64, Arc<Subscription>>,
    queue: Mutex<VecDeque<Message>>,
    wake: Condvar,
    pool: Arc<WorkerPool>,
    shutting_down: AtomicBool,
    next_channel_id: AtomicU64,
    bridge: Mutex<Option<Arc<dyn BridgeSink>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the broker. Cheap to clone.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Broker {
    /// Start the broker thread. Deliveries run on `pool`.
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        let inner = Arc::new(BrokerInner {
            issuer: uuid::Uuid::new_v4().to_string(),
            channels: DashMap::new(),
            queue: Mutex::new(VecDeque::new()),
            wake: Condvar::new(),
            pool,
            shutting_down: AtomicBool::new(false),
            next_channel_id: AtomicU64::new(1),
            bridge: Mutex::new(None),
            thread: Mutex::new(None),
        });
        let broker = Self { inner };
        let looped = broker.clone();
        match std::thread::Builder::new()
            .name("tether-broker".to_string())
            .spawn(move || looped.run())
        {
            Ok(handle) => *lock(&broker.inner.thread) = Some(handle),
            Err(e) => tracing::error!(target: "channels", error = %e, "failed to start broker thread"),
        }
        broker
    }

    /// Unique id of this broker on the bus.
    pub fn issuer(&self) -> &str {
        &self.inner.issuer
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channels.len()
    }

    pub fn set_bridge(&self, sink: Arc<dyn BridgeSink>) {
        *lock(&self.inner.bridge) = Some(sink);
    }

    fn register(&self, topic: &str, subscriber: Subscriber) -> u64 {
        let id = self.inner.next_channel_id.fetch_add(1, Ordering::Relaxed);
        self.inner.channels.insert(
            id,
            Arc::new(Subscription {
                topic: TopicPattern::new(topic),
                subscriber,
            }),
        );
        tracing::debug!(target: "channels", topic, channel_id = id, "subscribed");
        self.publish_lifecycle(SUBSCRIBE_TOPIC, topic, id);
        id
    }

    fn publish_lifecycle(&self, lifecycle: &str, topic: &str, id: u64) {
        let options = SendOptions {
            local: true,
            ..Default::default()
        };
        self.send_with(lifecycle, json!({"topic": topic, "channel_id": id}), options);
    }

    /// Subscribe with a callback run on the channel pool.
    pub fn subscribe<F>(&self, topic: &str, handler: F) -> Channel
    where
        F: Fn(&Message) -> HandlerResult + Send + Sync + 'static,
    {
        let id = self.register(topic, Subscriber::Handler(Arc::new(handler)));
        Channel {
            broker: self.clone(),
            id,
            topic: topic.to_string(),
            queue: None,
            active: AtomicBool::new(true),
        }
    }

    /// Subscribe with a queue read through [`Channel::receive`].
    pub fn subscribe_queue(&self, topic: &str) -> Channel {
        let (tx, rx) = mpsc::channel();
        let id = self.register(topic, Subscriber::Queue(tx));
        Channel {
            broker: self.clone(),
            id,
            topic: topic.to_string(),
            queue: Some(Mutex::new(rx)),
            active: AtomicBool::new(true),
        }
    }

    fn unsubscribe(&self, id: u64) {
        if let Some((_, sub)) = self.inner.channels.remove(&id) {
            tracing::debug!(target: "channels", topic = sub.topic.as_str(), channel_id = id, "unsubscribed");
            self.publish_lifecycle(UNSUBSCRIBE_TOPIC, sub.topic.as_str(), id);
        }
    }

    pub fn send(&self, topic: &str, data: Value) {
        self.send_with(topic, data, SendOptions::default());
    }

    pub fn send_with(&self, topic: &str, data: Value, options: SendOptions) {
        self.enqueue(Message::new(topic, data, &options));
    }

    fn enqueue(&self, message: Message) {
        if self.is_shutting_down() && message.droppable {
            return;
        }
        lock(&self.inner.queue).push_back(message);
        self.inner.wake.notify_one();
    }

    /// Feed a frame received from the bus. Frames we issued ourselves are
    /// ignored; returns whether the frame was published locally.
    pub fn ingest(&self, frame: &str) -> Result<bool, BusError> {
        let (issuer, topic, params) = bridge::decode(frame)?;
        if issuer == self.inner.issuer {
            return Ok(false);
        }
        let options = SendOptions {
            local: true,
            ..Default::default()
        };
        self.send_with(&topic, params, options);
        Ok(true)
    }

    fn run(&self) {
        loop {
            let message = {
                let mut queue = lock(&self.inner.queue);
                loop {
                    if let Some(message) = queue.pop_front() {
                        break Some(message);
                    }
                    if self.is_shutting_down() {
                        break None;
                    }
                    queue = self
                        .inner
                        .wake
                        .wait(queue)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            };
            match message {
                Some(message) => self.dispatch(message),
                None => break,
            }
        }
        tracing::debug!(target: "channels", "broker loop stopped");
    }

    fn dispatch(&self, message: Message) {
        if self.is_shutting_down() && message.droppable {
            return;
        }
        if !message.local {
            let sink = lock(&self.inner.bridge).clone();
            if let Some(sink) = sink {
                match bridge::encode(&self.inner.issuer, &message.topic, &message.data) {
                    Ok(frame) => sink.publish(frame),
                    Err(e) => tracing::warn!(target: "channels", topic = %message.topic, error = %e, "bridge encode failed"),
                }
            }
        }

        let target = TopicPattern::new(&message.topic);
        let matching: Vec<(u64, Arc<Subscription>)> = self
            .inner
            .channels
            .iter()
            .filter(|entry| entry.topic.matches(&target))
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        for (channel_id, sub) in matching {
            let copy = message.copy();
            match &sub.subscriber {
                Subscriber::Queue(tx) => {
                    let _ = tx.send(copy);
                }
                Subscriber::Handler(handler) => {
                    let handler = handler.clone();
                    let broker = self.clone();
                    let scheduled = self.inner.pool.execute(move || {
                        broker.deliver(channel_id, &handler, &copy);
                    });
                    if let Err(e) = scheduled {
                        tracing::debug!(target: "channels", channel_id, error = %e, "delivery not scheduled");
                    }
                }
            }
        }
    }

    fn deliver(&self, channel_id: u64, handler: &Handler, message: &Message) {
        if message.is_dropped() || message.is_expired() {
            return;
        }
        if message.droppable && self.is_shutting_down() {
            return;
        }
        if !self.inner.channels.contains_key(&channel_id) {
            return;
        }
        match catch_unwind(AssertUnwindSafe(|| handler(message))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(target: "channels", topic = %message.topic, channel_id, error = %e, "channel handler failed")
            }
            Err(panic) => {
                tracing::error!(target: "channels", topic = %message.topic, channel_id, panic = %panic_message(&*panic), "channel handler panicked")
            }
        }
    }

    /// Stop accepting droppable messages, drain the queue and join the broker thread.
    pub fn stop(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.wake.notify_all();
        let handle = lock(&self.inner.thread).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        tracing::info!(target: "channels", "broker stopped");
    }
}

/// A live subscription. Unsubscribes when dropped.
pub struct Channel {
    broker: Broker,
    id: u64,
    topic: String,
    queue: Option<Mutex<mpsc::Receiver<Message>>>,
    active: AtomicBool,
}

impl Channel {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Publish on this channel's topic.
    pub fn send(&self, data: Value) {
        self.broker.send(&self.topic, data);
    }

    pub fn send_with(&self, data: Value, options: SendOptions) {
        self.broker.send_with(&self.topic, data, options);
    }

    /// Next live message, waiting at most `timeout`. Expired and dropped
    /// messages are discarded here.
    pub fn receive(&self, timeout: Duration) -> Result<Option<Message>, BusError> {
        let queue = self
            .queue
            .as_ref()
            .ok_or_else(|| BusError::NotAQueue(self.topic.clone()))?;
        let rx = lock(queue);
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(message) if message.is_dropped() || message.is_expired() => continue,
                Ok(message) => return Ok(Some(message)),
                Err(mpsc::RecvTimeoutError::Timeout) => return Ok(None),
                Err(mpsc::RecvTimeoutError::Disconnected) => return Err(BusError::ShutDown),
            }
        }
    }

    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            self.broker.unsubscribe(self.id);
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("queue", &self.queue.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::message::Expiry;
    use std::sync::atomic::AtomicUsize;

    fn broker() -> Broker {
        Broker::new(WorkerPool::new("channels-test", 2))
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn test_queue_channel_receives_matching() {
        let broker = broker();
        let channel = broker.subscribe_queue("room.*");
        broker.send("room.1", json!({"n": 1}));
        broker.send("lobby", json!({"n": 2}));
        let msg = channel.receive(WAIT).unwrap().unwrap();
        assert_eq!(msg.topic, "room.1");
        assert_eq!(msg.data, json!({"n": 1}));
        assert!(channel.receive(Duration::from_millis(50)).unwrap().is_none());
        broker.stop();
    }

    #[test]
    fn test_glob_subscription_matches_multiline_topic() {
        let broker = broker();
        let channel = broker.subscribe_queue("log.*");
        broker.send("log.first\nsecond", json!(1));
        let msg = channel.receive(WAIT).unwrap().unwrap();
        assert_eq!(msg.topic, "log.first\nsecond");
        broker.stop();
    }

    #[test]
    fn test_failing_handler_does_not_block_others() {
        let broker = broker();
        let hits = Arc::new(AtomicUsize::new(0));
        let _bad = broker.subscribe("t", |_| Err("nope".into()));
        let _panics = broker.subscribe("t", |_| panic!("handler panic"));
        let h = hits.clone();
        let _good = broker.subscribe("t", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        broker.send("t", json!(null));
        let start = Instant::now();
        while hits.load(Ordering::SeqCst) == 0 && start.elapsed() < WAIT {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        broker.stop();
    }

    #[test]
    fn test_lifecycle_messages() {
        let broker = broker();
        let watcher = broker.subscribe_queue("_tether.channel.*");
        let channel = broker.subscribe_queue("presence");
        let id = channel.id();
        drop(channel);
        // the watcher sees its own subscription first
        let own = watcher.receive(WAIT).unwrap().unwrap();
        assert_eq!(own.data["topic"], json!("_tether.channel.*"));
        let sub = watcher.receive(WAIT).unwrap().unwrap();
        assert_eq!(sub.topic, SUBSCRIBE_TOPIC);
        assert_eq!(sub.data, json!({"topic": "presence", "channel_id": id}));
        let unsub = watcher.receive(WAIT).unwrap().unwrap();
        assert_eq!(unsub.topic, UNSUBSCRIBE_TOPIC);
        broker.stop();
    }

    #[test]
    fn test_expired_message_not_received() {
        let broker = broker();
        let channel = broker.subscribe_queue("t");
        broker.send_with(
            "t",
            json!("late"),
            SendOptions {
                expiry: Some(Expiry::At(chrono::Utc::now() - chrono::Duration::seconds(1))),
                ..Default::default()
            },
        );
        broker.send_with(
            "t",
            json!("fresh"),
            SendOptions {
                expiry: Some(Expiry::In(Duration::from_secs(60))),
                ..Default::default()
            },
        );
        let msg = channel.receive(WAIT).unwrap().unwrap();
        assert_eq!(msg.data, json!("fresh"));
        broker.stop();
    }

    #[test]
    fn test_droppable_discarded_after_stop() {
        let broker = broker();
        let channel = broker.subscribe_queue("t");
        broker.stop();
        broker.send_with(
            "t",
            json!(1),
            SendOptions {
                droppable: true,
                ..Default::default()
            },
        );
        assert!(channel.receive(Duration::from_millis(20)).unwrap().is_none());
    }

    #[test]
    fn test_receive_on_handler_channel() {
        let broker = broker();
        let channel = broker.subscribe("t", |_| Ok(()));
        assert!(matches!(
            channel.receive(Duration::from_millis(1)),
            Err(BusError::NotAQueue(_))
        ));
        broker.stop();
    }
}
