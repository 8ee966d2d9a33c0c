//! Device capability definitions
//!
//! Vendor-agnostic interface to a biosignal headset. The vendor library owns
//! discovery, pairing and the radio protocol; everything above this trait
//! only sees descriptors, frames and link-loss signals.

use crate::utils::error::DeviceError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Information about a discovered headset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    /// Unique device ID (radio address for BLE devices)
    pub id: String,

    /// Advertised name
    pub name: String,

    /// Radio address
    pub address: String,

    /// Vendor sensor family
    pub family: String,

    /// Native sample rate in Hz
    pub sample_rate: u32,

    /// Channel labels, in the order values appear in a frame
    pub channel_labels: Vec<String>,
}

impl DeviceDescriptor {
    pub fn channel_count(&self) -> u16 {
        self.channel_labels.len() as u16
    }
}

/// Electrode contact quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalQuality {
    Good,
    Fair,
    Poor,
    Unknown,
}

/// Battery and contact quality as reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceReading {
    /// Battery level, 0-100
    pub battery_level: u8,
    pub signal_quality: SignalQuality,
}

/// One frame as delivered by the vendor callback
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    /// Vendor packet counter; keeps advancing while frames are lost
    pub packet_number: u64,
    /// Device clock in microseconds
    pub timestamp_us: u64,
    pub values: Vec<f32>,
}

/// What the vendor callback pushes into the link
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceSignal {
    Frame(RawFrame),
    /// The radio link dropped; no more frames until a reconnect
    LinkLost(String),
}

/// Non-blocking hand-off point for vendor callbacks.
///
/// Frames are pushed with `try_send`; a full queue drops the frame and
/// counts it. A link-loss signal is never dropped: if the queue is full it
/// is parked and delivered once the queued frames are drained.
#[derive(Clone)]
pub struct FrameSink {
    tx: mpsc::Sender<DeviceSignal>,
    dropped: Arc<AtomicU64>,
    parked_loss: Arc<Mutex<Option<String>>>,
}

impl FrameSink {
    /// Create a sink and the receiving end for the pump task
    pub fn new(capacity: usize) -> (Self, FrameReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let parked_loss = Arc::new(Mutex::new(None));
        (
            Self {
                tx,
                dropped: dropped.clone(),
                parked_loss: parked_loss.clone(),
            },
            FrameReceiver {
                rx,
                dropped,
                parked_loss,
            },
        )
    }

    /// Push a frame. Returns false if it was dropped.
    pub fn push_frame(&self, frame: RawFrame) -> bool {
        match self.tx.try_send(DeviceSignal::Frame(frame)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    tracing::warn!("Frame queue full, {} frames dropped so far", dropped);
                }
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Report that the radio link dropped
    pub fn link_lost(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if let Err(TrySendError::Full(DeviceSignal::LinkLost(reason))) =
            self.tx.try_send(DeviceSignal::LinkLost(reason))
        {
            *self.parked_loss.lock() = Some(reason);
        }
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// True once the pump stopped listening
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Pump-side end of a `FrameSink`
pub struct FrameReceiver {
    rx: mpsc::Receiver<DeviceSignal>,
    dropped: Arc<AtomicU64>,
    parked_loss: Arc<Mutex<Option<String>>>,
}

impl FrameReceiver {
    /// Wait for the next signal. `None` once every sink is gone.
    pub async fn recv(&mut self) -> Option<DeviceSignal> {
        if let Some(signal) = self.try_recv() {
            return Some(signal);
        }
        self.rx.recv().await
    }

    /// Next signal if one is ready
    pub fn try_recv(&mut self) -> Option<DeviceSignal> {
        match self.rx.try_recv() {
            Ok(signal) => Some(signal),
            Err(_) => self.parked_loss.lock().take().map(DeviceSignal::LinkLost),
        }
    }

    /// Frames the sink had to drop
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Vendor device capability
#[async_trait]
pub trait DeviceCapability: Send + Sync {
    /// Scan for nearby devices for up to `scan_duration`
    async fn discover_devices(
        &self,
        scan_duration: Duration,
    ) -> Result<Vec<DeviceDescriptor>, DeviceError>;

    /// Connect to a device found by the last scan
    async fn connect(&self, device_id: &str) -> Result<DeviceDescriptor, DeviceError>;

    /// Start delivering frames into `sink`
    async fn start_stream(&self, sink: FrameSink) -> Result<(), DeviceError>;

    /// Stop delivering frames; the device stays connected
    async fn stop_stream(&self) -> Result<(), DeviceError>;

    /// Battery level and contact quality
    async fn read_status(&self) -> Result<DeviceReading, DeviceError>;

    /// Drop the connection
    async fn disconnect(&self) -> Result<(), DeviceError>;
}
