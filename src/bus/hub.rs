//! Single-producer, multi-consumer sample distribution
//!
//! Every subscriber owns a bounded queue. `publish` never waits: a
//! subscriber whose queue is full is dropped and flagged as overrun, so a
//! slow consumer can never back-pressure the device link.

use super::batch::BusEvent;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};

/// Identifier handed out by `subscribe`
pub type SubscriberId = u64;

/// Outcome of a single publish call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub overrun: usize,
}

/// Snapshot of bus counters
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusStats {
    pub events_published: u64,
    pub overruns: u64,
    pub subscribers: usize,
}

struct SubscriberSlot {
    id: SubscriberId,
    name: String,
    tx: mpsc::Sender<BusEvent>,
    overrun: Arc<AtomicBool>,
}

struct BusInner {
    subscribers: Mutex<Vec<SubscriberSlot>>,
    next_id: AtomicU64,
    events_published: AtomicU64,
    overruns: AtomicU64,
}

impl BusInner {
    fn remove(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|slot| slot.id != id);
        subscribers.len() != before
    }
}

/// In-process fan-out point between the device link and its consumers
#[derive(Clone)]
pub struct SampleBus {
    inner: Arc<BusInner>,
}

impl SampleBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                events_published: AtomicU64::new(0),
                overruns: AtomicU64::new(0),
            }),
        }
    }

    /// Register a consumer with its own queue of `capacity` events
    pub fn subscribe(&self, name: impl Into<String>, capacity: usize) -> Subscription {
        let name = name.into();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let overrun = Arc::new(AtomicBool::new(false));

        self.inner.subscribers.lock().push(SubscriberSlot {
            id,
            name: name.clone(),
            tx,
            overrun: overrun.clone(),
        });

        tracing::debug!("Bus subscriber {} ({}) attached", id, name);

        Subscription {
            id,
            name,
            rx,
            overrun,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Remove a subscriber. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.inner.remove(id)
    }

    /// Deliver an event to every subscriber without waiting
    pub fn publish(&self, event: BusEvent) -> PublishReport {
        let mut report = PublishReport::default();
        let mut subscribers = self.inner.subscribers.lock();

        subscribers.retain(|slot| match slot.tx.try_send(event.clone()) {
            Ok(()) => {
                report.delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                slot.overrun.store(true, Ordering::Release);
                report.overrun += 1;
                tracing::warn!(
                    "Bus subscriber {} ({}) overran its queue, dropping it",
                    slot.id,
                    slot.name
                );
                false
            }
            // Consumer went away without unsubscribing
            Err(TrySendError::Closed(_)) => false,
        });
        drop(subscribers);

        self.inner.events_published.fetch_add(1, Ordering::Relaxed);
        if report.overrun > 0 {
            self.inner
                .overruns
                .fetch_add(report.overrun as u64, Ordering::Relaxed);
        }

        report
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            events_published: self.inner.events_published.load(Ordering::Relaxed),
            overruns: self.inner.overruns.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}

impl Default for SampleBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A consumer's end of the bus. Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriberId,
    name: String,
    rx: mpsc::Receiver<BusEvent>,
    overrun: Arc<AtomicBool>,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the next event. `None` means the bus dropped this
    /// subscriber (see `is_overrun`) or the bus itself is gone.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        self.rx.recv().await
    }

    /// Take an already-queued event without waiting
    pub fn try_recv(&mut self) -> Option<BusEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// True once the bus dropped this subscriber for falling behind
    pub fn is_overrun(&self) -> bool {
        self.overrun.load(Ordering::Acquire)
    }

    /// Detach from the bus. Safe to call more than once.
    pub fn unsubscribe(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            if bus.remove(self.id) {
                tracing::debug!("Bus subscriber {} ({}) detached", self.id, self.name);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
