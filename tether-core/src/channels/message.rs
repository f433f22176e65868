use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// When a message stops being deliverable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Expiry {
    At(DateTime<Utc>),
    /// Relative to send time.
    In(Duration),
}

impl Expiry {
    fn resolve(self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Expiry::At(at) => at,
            Expiry::In(delta) => match chrono::Duration::from_std(delta) {
                Ok(delta) => now.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC),
                Err(_) => DateTime::<Utc>::MAX_UTC,
            },
        }
    }
}

/// Delivery options for [`crate::channels::Broker::send_with`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub expiry: Option<Expiry>,
    /// Never forwarded over the bus bridge.
    pub local: bool,
    /// May be discarded without delivery once the broker is shutting down.
    pub droppable: bool,
}

/// A value object. Every subscriber gets its own copy; all copies share one
/// dropped flag so `drop_message` on any of them affects the rest.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub data: Value,
    pub expires_at: Option<DateTime<Utc>>,
    pub local: bool,
    pub droppable: bool,
    pub sent_at: DateTime<Utc>,
    dropped: Arc<AtomicBool>,
}

impl Message {
    pub fn new(topic: &str, data: Value, options: &SendOptions) -> Self {
        let now = Utc::now();
        Self {
            topic: topic.to_string(),
            data,
            expires_at: options.expiry.map(|e| e.resolve(now)),
            local: options.local,
            droppable: options.droppable,
            sent_at: now,
            dropped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Copy for one subscriber: data is cloned, the dropped flag is shared.
    pub fn copy(&self) -> Self {
        self.clone()
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Mark this message (and every copy of it) as dropped.
    pub fn drop_message(&self) {
        self.dropped.store(true, Ordering::SeqCst);
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }
}
