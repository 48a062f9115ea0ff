//! Process-wide log bus.
//!
//! Every live instance (captured stderr) and the core itself publish here;
//! control-plane subscribers read through per-subscriber bounded rings.
//! A slow subscriber loses its oldest records, never anyone else's.

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    /// `core/<component>` or `server/<name>`.
    pub source: String,
    pub level: LogLevel,
    pub message: String,
}

struct Ring {
    buf: Mutex<VecDeque<LogRecord>>,
    capacity: usize,
    dropped: AtomicU64,
    notify: Notify,
}

impl Ring {
    fn push(&self, record: LogRecord) -> bool {
        let mut buf = self.buf.lock().expect("log ring poisoned");
        let mut dropped = false;
        if buf.len() == self.capacity {
            buf.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            dropped = true;
        }
        buf.push_back(record);
        drop(buf);
        self.notify.notify_one();
        dropped
    }

    fn pop(&self) -> Option<LogRecord> {
        self.buf.lock().expect("log ring poisoned").pop_front()
    }
}

struct Subscriber {
    id: u64,
    min_level: LogLevel,
    ring: Arc<Ring>,
}

pub struct LogBus {
    subscribers: RwLock<Vec<Subscriber>>,
    seq: AtomicU64,
    next_id: AtomicU64,
    dropped_total: AtomicU64,
}

impl Default for LogBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LogBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            seq: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            dropped_total: AtomicU64::new(0),
        }
    }

    pub fn publish(&self, source: &str, level: LogLevel, message: impl Into<String>) {
        let record = LogRecord {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
            source: source.to_string(),
            level,
            message: message.into(),
        };

        // Copy the ring handles under the read lock, deliver outside it.
        let targets: Vec<Arc<Ring>> = {
            let subscribers = self.subscribers.read().expect("log bus poisoned");
            subscribers
                .iter()
                .filter(|sub| level >= sub.min_level)
                .map(|sub| Arc::clone(&sub.ring))
                .collect()
        };

        for ring in targets {
            if ring.push(record.clone()) {
                self.dropped_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn subscribe(
        self: &Arc<Self>,
        min_level: LogLevel,
        capacity: usize,
    ) -> LogStream {
        let ring = Arc::new(Ring {
            buf: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        });
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .expect("log bus poisoned")
            .push(Subscriber {
                id,
                min_level,
                ring: Arc::clone(&ring),
            });
        LogStream {
            bus: Arc::clone(self),
            id,
            ring,
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers
            .write()
            .expect("log bus poisoned")
            .retain(|sub| sub.id != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().expect("log bus poisoned").len()
    }

    /// Records dropped across all subscribers since startup.
    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }
}

/// One subscriber's view of the bus. Dropping it unsubscribes; the bus
/// never closes a subscriber from its side.
pub struct LogStream {
    bus: Arc<LogBus>,
    id: u64,
    ring: Arc<Ring>,
}

impl LogStream {
    /// Next record, waiting if the ring is empty.
    pub async fn recv(&mut self) -> LogRecord {
        loop {
            if let Some(record) = self.ring.pop() {
                return record;
            }
            self.ring.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<LogRecord> {
        self.ring.pop()
    }

    /// Records this subscriber lost to overflow.
    pub fn dropped(&self) -> u64 {
        self.ring.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for LogStream {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_flow_in_order() {
        let bus = Arc::new(LogBus::new());
        let mut stream = bus.subscribe(LogLevel::Info, 8);
        bus.publish("core/test", LogLevel::Info, "one");
        bus.publish("core/test", LogLevel::Warn, "two");

        let first = stream.recv().await;
        let second = stream.recv().await;
        assert_eq!(first.message, "one");
        assert_eq!(second.message, "two");
        assert!(first.seq < second.seq);
    }

    #[tokio::test]
    async fn min_level_filters_records() {
        let bus = Arc::new(LogBus::new());
        let mut stream = bus.subscribe(LogLevel::Warn, 8);
        bus.publish("core/test", LogLevel::Debug, "quiet");
        bus.publish("core/test", LogLevel::Error, "loud");

        let record = stream.recv().await;
        assert_eq!(record.message, "loud");
        assert!(stream.try_recv().is_none());
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest_and_counts() {
        let bus = Arc::new(LogBus::new());
        let capacity = 4;
        let mut slow = bus.subscribe(LogLevel::Info, capacity);
        let mut fast = bus.subscribe(LogLevel::Info, 64);

        for i in 0..40 {
            bus.publish("core/test", LogLevel::Info, format!("m{i}"));
        }

        assert_eq!(slow.dropped(), 40 - capacity as u64);
        assert_eq!(fast.dropped(), 0);

        // After draining, the subscriber sees the newest records.
        let record = slow.recv().await;
        assert_eq!(record.message, "m36");
        bus.publish("core/test", LogLevel::Info, "fresh");
        let mut last = record;
        while let Some(next) = slow.try_recv() {
            last = next;
        }
        assert_eq!(last.message, "fresh");
    }

    #[tokio::test]
    async fn dropping_stream_unsubscribes() {
        let bus = Arc::new(LogBus::new());
        let stream = bus.subscribe(LogLevel::Info, 8);
        assert_eq!(bus.subscriber_count(), 1);
        drop(stream);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
