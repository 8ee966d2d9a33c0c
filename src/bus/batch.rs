//! Sample and bus event types
//!
//! Batches are immutable once produced and travel through the bus behind
//! an `Arc`, so every subscriber reads the same allocation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One multi-channel reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    /// Link-wide sequence number (session-relative once recorded)
    pub sequence: u64,
    /// Device-relative timestamp in microseconds
    pub timestamp_us: u64,
    /// One value per channel, in device channel order
    pub values: Vec<f32>,
}

/// A small ordered group of samples emitted together by the device link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleBatch {
    /// Batch counter, in publish order
    pub sequence: u64,
    /// Device timestamp of the first sample
    pub timestamp_us: u64,
    pub samples: Vec<Sample>,
}

impl SampleBatch {
    /// Build a batch from samples, taking the timestamp of the first one
    pub fn new(sequence: u64, samples: Vec<Sample>) -> Self {
        let timestamp_us = samples.first().map(|s| s.timestamp_us).unwrap_or(0);
        Self {
            sequence,
            timestamp_us,
            samples,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn first_sequence(&self) -> Option<u64> {
        self.samples.first().map(|s| s.sequence)
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.samples.last().map(|s| s.sequence)
    }
}

/// Why a device stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamEndReason {
    /// `stop_stream` was called; the device is still connected
    Stopped,
    /// `disconnect` was called
    Disconnected,
    /// Link loss that the reconnect policy could not recover
    DeviceLost,
}

/// Everything that travels over the sample bus
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// A batch of samples
    Samples(Arc<SampleBatch>),
    /// The radio link dropped while streaming; a marker, never a sample
    LinkLost {
        last_sequence: Option<u64>,
        at: DateTime<Utc>,
    },
    /// The reconnect policy restored the stream
    LinkRestored { at: DateTime<Utc> },
    /// The stream is over; no more samples follow until a new stream starts
    StreamEnded {
        reason: StreamEndReason,
        at: DateTime<Utc>,
    },
}

impl BusEvent {
    pub fn samples(batch: SampleBatch) -> Self {
        BusEvent::Samples(Arc::new(batch))
    }

    pub fn link_lost(last_sequence: Option<u64>) -> Self {
        BusEvent::LinkLost {
            last_sequence,
            at: Utc::now(),
        }
    }

    pub fn link_restored() -> Self {
        BusEvent::LinkRestored { at: Utc::now() }
    }

    pub fn stream_ended(reason: StreamEndReason) -> Self {
        BusEvent::StreamEnded {
            reason,
            at: Utc::now(),
        }
    }
}
