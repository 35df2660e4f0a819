//! Fan-out of log events to stream observers.
//!
//! Every observer gets its own bounded channel and publishing is a
//! non-blocking `try_send` per subscriber. A subscriber whose receiving side
//! is gone, or whose queue is full because it stopped reading, is dropped on
//! that publish.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use microclaw_core::LogEvent;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Events queued per subscriber before it counts as stalled.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 4096;

/// Receiving side of one observer.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<LogEvent>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next event. Returns `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<LogEvent> {
        self.rx.recv().await
    }

    /// Take the next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<LogEvent> {
        self.rx.try_recv().ok()
    }
}

type Subscribers = BTreeMap<u64, mpsc::Sender<LogEvent>>;

/// The subscriber set.
#[derive(Debug)]
pub struct BroadcastHub {
    subscribers: Mutex<Subscribers>,
    next_id: AtomicU64,
    capacity: usize,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hub whose subscribers may fall `capacity` events behind.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    /// Register a new observer.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, tx);
        debug!("Subscriber {} registered", id);
        Subscription { id, rx }
    }

    /// Remove an observer. Removing twice is a no-op.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        self.unsubscribe_id(subscription.id);
    }

    pub fn unsubscribe_id(&self, id: u64) {
        if self.lock().remove(&id).is_some() {
            debug!("Subscriber {} removed", id);
        }
    }

    /// Deliver `event` to every registered observer and return how many got it.
    ///
    /// Subscribers whose channel is closed or full are removed after the
    /// delivery pass; the others in the same call are unaffected.
    pub fn publish(&self, event: LogEvent) -> usize {
        let mut subscribers = self.lock();
        if subscribers.is_empty() {
            return 0;
        }

        let mut dead = Vec::new();
        for (id, tx) in subscribers.iter() {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("Subscriber {} is not keeping up, dropping it", id);
                    dead.push(*id);
                }
                Err(TrySendError::Closed(_)) => dead.push(*id),
            }
        }

        for id in &dead {
            subscribers.remove(id);
            debug!("Subscriber {} dropped after failed delivery", id);
        }

        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Subscribers> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
