//! Live view feed
//!
//! Every connected web client gets its own `LiveClient`, which owns a bus
//! subscription for as long as the client is attached. Samples, stream
//! events, device status transitions and session events are merged into a
//! single ordered stream of serializable `LiveMessage`s.
//!
//! A client that stops reading is dropped by the bus like any other slow
//! subscriber; it receives one final `overrun` message and then ends.

use crate::bus::{BusEvent, SampleBatch, SampleBus, StreamEndReason, Subscription};
use crate::config::Config;
use crate::device::{DeviceLink, DeviceStatus};
use crate::session::{SessionEvent, SessionManager, SessionStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};

/// Messages pushed to a live view client
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LiveMessage {
    /// First message after attaching
    #[serde(rename_all = "camelCase")]
    Snapshot {
        device: DeviceStatus,
        session: SessionStatus,
    },
    Samples {
        batch: SampleBatch,
    },
    DeviceStatus {
        status: DeviceStatus,
    },
    Session {
        event: SessionEvent,
    },
    #[serde(rename_all = "camelCase")]
    LinkLost {
        last_sequence: Option<u64>,
        at: DateTime<Utc>,
    },
    LinkRestored {
        at: DateTime<Utc>,
    },
    StreamEnded {
        reason: StreamEndReason,
        at: DateTime<Utc>,
    },
    /// The client fell behind and was detached from the bus
    Overrun,
}

impl From<BusEvent> for LiveMessage {
    fn from(event: BusEvent) -> Self {
        match event {
            BusEvent::Samples(batch) => LiveMessage::Samples {
                batch: (*batch).clone(),
            },
            BusEvent::LinkLost { last_sequence, at } => LiveMessage::LinkLost { last_sequence, at },
            BusEvent::LinkRestored { at } => LiveMessage::LinkRestored { at },
            BusEvent::StreamEnded { reason, at } => LiveMessage::StreamEnded { reason, at },
        }
    }
}

/// Hands out live clients
#[derive(Clone)]
pub struct LiveViewFeed {
    link: DeviceLink,
    sessions: SessionManager,
    queue_capacity: usize,
    clients: Arc<AtomicUsize>,
    next_client: Arc<AtomicU64>,
}

impl LiveViewFeed {
    pub fn new(link: DeviceLink, sessions: SessionManager, config: &Config) -> Self {
        Self {
            link,
            sessions,
            queue_capacity: config.live_queue_capacity,
            clients: Arc::new(AtomicUsize::new(0)),
            next_client: Arc::new(AtomicU64::new(1)),
        }
    }

    fn bus(&self) -> &SampleBus {
        self.link.bus()
    }

    /// Attach a new client. The bus subscription lives as long as the client.
    pub fn attach(&self) -> LiveClient {
        let id = self.next_client.fetch_add(1, Ordering::Relaxed);
        let samples = self
            .bus()
            .subscribe(format!("live:{}", id), self.queue_capacity);
        let device = self.link.subscribe_status();
        let sessions = self.sessions.subscribe();
        let connected = self.clients.fetch_add(1, Ordering::AcqRel) + 1;

        tracing::info!("Live client {} attached ({} connected)", id, connected);

        LiveClient {
            id,
            snapshot: Some(LiveMessage::Snapshot {
                device: self.link.status(),
                session: self.sessions.status(),
            }),
            samples: Some(samples),
            device: Some(device),
            sessions: Some(sessions),
            clients: self.clients.clone(),
        }
    }

    /// Number of attached clients
    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::Acquire)
    }
}

/// One web client's view of the pipeline
pub struct LiveClient {
    id: u64,
    snapshot: Option<LiveMessage>,
    samples: Option<Subscription>,
    device: Option<broadcast::Receiver<DeviceStatus>>,
    sessions: Option<broadcast::Receiver<SessionEvent>>,
    clients: Arc<AtomicUsize>,
}

impl LiveClient {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next message for this client. `None` once the client has been
    /// detached (after an overrun) or the pipeline has shut down.
    pub async fn next(&mut self) -> Option<LiveMessage> {
        if let Some(snapshot) = self.snapshot.take() {
            return Some(snapshot);
        }

        loop {
            if self.samples.is_none() && self.device.is_none() && self.sessions.is_none() {
                return None;
            }

            tokio::select! {
                biased;

                // Status and session events are rare; never starve them
                result = recv_optional(&mut self.sessions) => match result {
                    Ok(event) => return Some(LiveMessage::Session { event }),
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!("Live client {} missed {} session events", self.id, n);
                    }
                    Err(RecvError::Closed) => self.sessions = None,
                },

                result = recv_optional(&mut self.device) => match result {
                    Ok(status) => return Some(LiveMessage::DeviceStatus { status }),
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!("Live client {} missed {} device status updates", self.id, n);
                    }
                    Err(RecvError::Closed) => self.device = None,
                },

                event = recv_samples(&mut self.samples) => match event {
                    Some(event) => return Some(event.into()),
                    None => {
                        let overrun = self
                            .samples
                            .as_ref()
                            .map(|s| s.is_overrun())
                            .unwrap_or(false);
                        self.samples = None;
                        if overrun {
                            tracing::warn!("Live client {} fell behind and was detached", self.id);
                            self.device = None;
                            self.sessions = None;
                            return Some(LiveMessage::Overrun);
                        }
                    }
                },
            }
        }
    }

    /// Detach from the bus without dropping the client
    pub fn detach(&mut self) {
        if let Some(mut samples) = self.samples.take() {
            samples.unsubscribe();
        }
        self.device = None;
        self.sessions = None;
    }
}

impl Drop for LiveClient {
    fn drop(&mut self) {
        let remaining = self.clients.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        tracing::info!("Live client {} detached ({} connected)", self.id, remaining);
    }
}

async fn recv_optional<T: Clone>(rx: &mut Option<broadcast::Receiver<T>>) -> Result<T, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_samples(samples: &mut Option<Subscription>) -> Option<BusEvent> {
    match samples {
        Some(samples) => samples.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Sample;
    use crate::device::{LinkSettings, SimulatedConfig, SimulatedDevice};

    fn feed(capacity: usize) -> (LiveViewFeed, SampleBus) {
        let dir = std::env::temp_dir();
        let config = Config::default()
            .storage_root(dir.join("neuro-notes-live-tests"))
            .live_queue_capacity(capacity);
        let bus = SampleBus::new();
        let link = DeviceLink::new(
            Arc::new(SimulatedDevice::new(SimulatedConfig::default())),
            bus.clone(),
            LinkSettings::from(&config),
        );
        let sessions = SessionManager::new(link.clone(), &config);
        (LiveViewFeed::new(link, sessions, &config), bus)
    }

    fn batch(seq: u64) -> BusEvent {
        BusEvent::samples(SampleBatch::new(
            seq,
            vec![Sample {
                sequence: seq,
                timestamp_us: seq * 4_000,
                values: vec![0.5; 4],
            }],
        ))
    }

    #[tokio::test]
    async fn test_snapshot_then_samples() {
        let (feed, bus) = feed(16);
        let mut client = feed.attach();
        assert_eq!(feed.client_count(), 1);
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(batch(1));
        bus.publish(BusEvent::stream_ended(StreamEndReason::Stopped));

        assert!(matches!(client.next().await, Some(LiveMessage::Snapshot { .. })));
        match client.next().await {
            Some(LiveMessage::Samples { batch }) => assert_eq!(batch.first_sequence(), Some(1)),
            other => panic!("unexpected message {:?}", other),
        }
        assert!(matches!(
            client.next().await,
            Some(LiveMessage::StreamEnded {
                reason: StreamEndReason::Stopped,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_subscribed_only_while_attached() {
        let (feed, bus) = feed(16);
        let a = feed.attach();
        let b = feed.attach();
        assert_eq!(bus.subscriber_count(), 2);

        drop(a);
        assert_eq!(feed.client_count(), 1);
        drop(b);
        assert_eq!(feed.client_count(), 0);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_client_gets_overrun_and_ends() {
        let (feed, bus) = feed(2);
        let mut client = feed.attach();

        for seq in 1..=10 {
            bus.publish(batch(seq));
        }
        assert_eq!(bus.subscriber_count(), 0);

        let mut samples = 0;
        let mut overrun = false;
        while let Some(message) = client.next().await {
            match message {
                LiveMessage::Samples { .. } => samples += 1,
                LiveMessage::Overrun => overrun = true,
                _ => {}
            }
        }
        assert_eq!(samples, 2);
        assert!(overrun);
    }

    #[test]
    fn test_message_json_shape() {
        let message = LiveMessage::LinkLost {
            last_sequence: Some(500),
            at: Utc::now(),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "linkLost");
        assert_eq!(json["lastSequence"], 500);
    }
}
