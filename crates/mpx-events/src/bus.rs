use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::trace;

use crate::event::{Event, EventType};

/// Queue depth per subscriber. A subscriber this far behind starts losing
/// events rather than stalling publishers.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 128;

struct Subscriber {
    /// `None` subscribes to every event type.
    filter: Option<EventType>,
    tx: mpsc::Sender<Event>,
}

struct BusInner {
    subscribers: Vec<Subscriber>,
    closed: bool,
}

/// Fan-out bus for lifecycle events.
///
/// `publish` never blocks and never suspends; it is safe to call while
/// holding unrelated locks. Per subscriber, delivery order equals publish
/// order. Across subscribers no ordering is guaranteed.
pub struct EventBus {
    inner: Mutex<BusInner>,
    capacity: usize,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(BusInner {
                subscribers: Vec::new(),
                closed: false,
            }),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Subscribes to one event type.
    ///
    /// After `close` the returned receiver is already closed.
    pub fn subscribe(&self, event_type: EventType) -> mpsc::Receiver<Event> {
        self.add_subscriber(Some(event_type))
    }

    /// Subscribes to every event type.
    pub fn subscribe_all(&self) -> mpsc::Receiver<Event> {
        self.add_subscriber(None)
    }

    fn add_subscriber(&self, filter: Option<EventType>) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut inner = self.lock();
        if !inner.closed {
            inner.subscribers.push(Subscriber { filter, tx });
        }
        // On a closed bus the sender drops here, leaving rx closed.
        rx
    }

    /// Publishes one event, never blocking.
    ///
    /// Subscribers with a full queue lose this event; the loss is counted.
    /// Publishing on a closed bus is a silent no-op.
    pub fn publish(&self, mut event: Event) {
        if event.timestamp.is_none() {
            event.timestamp = Some(Utc::now());
        }

        let mut inner = self.lock();
        if inner.closed {
            return;
        }

        let mut dropped = 0u64;
        inner.subscribers.retain(|sub| {
            if !sub.matches(&event) {
                return true;
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    dropped += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        drop(inner);

        if dropped > 0 {
            self.dropped.fetch_add(dropped, Ordering::Relaxed);
            trace!(event = %event.event_type, dropped, "subscriber queue full, event dropped");
        }
    }

    /// Test variant of [`publish`](Self::publish) that waits for queue space
    /// instead of dropping.
    pub async fn publish_blocking(&self, mut event: Event) {
        if event.timestamp.is_none() {
            event.timestamp = Some(Utc::now());
        }

        // Senders are cloned out so no lock is held across await points.
        let targets: Vec<mpsc::Sender<Event>> = {
            let inner = self.lock();
            if inner.closed {
                return;
            }
            inner
                .subscribers
                .iter()
                .filter(|sub| sub.matches(&event))
                .map(|sub| sub.tx.clone())
                .collect()
        };

        for tx in targets {
            let _ = tx.send(event.clone()).await;
        }
    }

    /// Events lost to full subscriber queues since construction.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Closes all subscriber queues. Later publishes are silent no-ops.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Subscriber {
    fn matches(&self, event: &Event) -> bool {
        self.filter.is_none_or(|t| t == event.event_type)
    }
}

/// Waits until `pred` matches an event on `rx`, bounded by `timeout`.
///
/// The replacement for sleeping a magic duration before a state check.
pub async fn wait_for_event(
    rx: &mut mpsc::Receiver<Event>,
    timeout: Duration,
    mut pred: impl FnMut(&Event) -> bool,
) -> Option<Event> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let event = tokio::time::timeout_at(deadline, rx.recv()).await.ok()??;
        if pred(&event) {
            return Some(event);
        }
    }
}
