//! Device link
//!
//! Owns the connection state machine around a `DeviceCapability`:
//!
//! ```text
//! Disconnected -> Discovering -> Connecting -> Connected -> Streaming
//!                                                 ^            |
//!                                                 |            v
//!                                       Disconnected <- Reconnecting
//! ```
//!
//! `Error` is entered when the device fails a control operation; only
//! `disconnect` leaves it. While streaming, a single pump task drains the
//! frame sink, assigns link-wide sequence numbers, publishes sample batches
//! to the bus, polls battery and signal quality, and runs the reconnect
//! policy after a link loss.

use super::traits::{DeviceCapability, DeviceDescriptor, DeviceSignal, FrameReceiver, FrameSink, RawFrame, SignalQuality};
use crate::bus::{BusEvent, Sample, SampleBatch, SampleBus, StreamEndReason};
use crate::config::{Config, ReconnectPolicy};
use crate::utils::error::{AppError, AppResult, ConnectionFailure, DeviceError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Connection state of the device link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Discovering,
    Connecting,
    Connected,
    Streaming,
    Reconnecting,
    Error,
}

impl ConnectionState {
    /// A stream is running or being restored
    pub fn is_streaming(&self) -> bool {
        matches!(self, ConnectionState::Streaming | ConnectionState::Reconnecting)
    }

    /// A device is attached and usable for recording
    pub fn is_available(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Streaming)
    }
}

/// Snapshot of the link for the web layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub state: ConnectionState,
    pub device: Option<DeviceDescriptor>,
    pub battery_level: Option<u8>,
    pub signal_quality: Option<SignalQuality>,
    /// Last link sequence number published
    pub last_sequence: Option<u64>,
    /// Current reconnect attempt, 0 when not reconnecting
    pub reconnect_attempt: u32,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Default for DeviceStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            device: None,
            battery_level: None,
            signal_quality: None,
            last_sequence: None,
            reconnect_attempt: 0,
            error: None,
            updated_at: Utc::now(),
        }
    }
}

/// Link thresholds
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub connect_timeout: Duration,
    pub scan_duration: Duration,
    pub reconnect: ReconnectPolicy,
    pub frame_queue_capacity: usize,
    pub batch_max_samples: usize,
    pub status_interval: Duration,
}

impl From<&Config> for LinkSettings {
    fn from(config: &Config) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            scan_duration: config.scan_duration,
            reconnect: config.reconnect.clone(),
            frame_queue_capacity: config.frame_queue_capacity,
            batch_max_samples: config.batch_max_samples.max(1),
            status_interval: config.status_interval,
        }
    }
}

/// Turns vendor packet counters into link-wide sequence numbers.
///
/// Packets lost on the radio consume sequence numbers; duplicates are
/// dropped; a counter that goes backwards (device restarted its count)
/// continues at the next number.
#[derive(Debug, Default)]
struct Sequencer {
    last_sequence: u64,
    last_packet: Option<u64>,
}

impl Sequencer {
    fn assign(&mut self, packet: u64) -> Option<u64> {
        let step = match self.last_packet {
            None => 1,
            Some(last) if packet > last => packet - last,
            Some(last) if packet == last => return None,
            Some(_) => 1,
        };
        self.last_packet = Some(packet);
        self.last_sequence += step;
        Some(self.last_sequence)
    }

    /// A fresh stream may restart the packet counter
    fn new_stream(&mut self) {
        self.last_packet = None;
    }
}

struct Pump {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct LinkInner {
    capability: Arc<dyn DeviceCapability>,
    bus: SampleBus,
    settings: LinkSettings,
    status: Mutex<DeviceStatus>,
    discovered: Mutex<HashMap<String, DeviceDescriptor>>,
    status_tx: broadcast::Sender<DeviceStatus>,
    sequencer: Mutex<Sequencer>,
    batch_counter: AtomicU64,
    pump: Mutex<Option<Pump>>,
    /// Serializes control operations
    control: tokio::sync::Mutex<()>,
}

impl LinkInner {
    fn state(&self) -> ConnectionState {
        self.status.lock().state
    }

    /// Apply a change to the status and broadcast the result
    fn update(&self, f: impl FnOnce(&mut DeviceStatus)) -> DeviceStatus {
        let snapshot = {
            let mut status = self.status.lock();
            let before = status.state;
            f(&mut status);
            status.updated_at = Utc::now();
            if status.state != before {
                tracing::info!("Device link: {:?} -> {:?}", before, status.state);
            }
            status.clone()
        };
        let _ = self.status_tx.send(snapshot.clone());
        snapshot
    }

    fn set_state(&self, state: ConnectionState) -> DeviceStatus {
        self.update(|s| s.state = state)
    }

    fn take_pump(&self) -> Option<Pump> {
        self.pump.lock().take()
    }
}

/// Stateful wrapper around a device capability
#[derive(Clone)]
pub struct DeviceLink {
    inner: Arc<LinkInner>,
}

impl DeviceLink {
    pub fn new(capability: Arc<dyn DeviceCapability>, bus: SampleBus, settings: LinkSettings) -> Self {
        let (status_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(LinkInner {
                capability,
                bus,
                settings,
                status: Mutex::new(DeviceStatus::default()),
                discovered: Mutex::new(HashMap::new()),
                status_tx,
                sequencer: Mutex::new(Sequencer::default()),
                batch_counter: AtomicU64::new(0),
                pump: Mutex::new(None),
                control: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Bus the link publishes to
    pub fn bus(&self) -> &SampleBus {
        &self.inner.bus
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn status(&self) -> DeviceStatus {
        self.inner.status.lock().clone()
    }

    /// Subscribe to device status transitions
    pub fn subscribe_status(&self) -> broadcast::Receiver<DeviceStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Scan for devices. The link state is the same afterwards.
    pub async fn discover(&self) -> AppResult<Vec<DeviceDescriptor>> {
        let _guard = self.inner.control.lock().await;

        let prior = self.inner.state();
        if prior == ConnectionState::Disconnected {
            self.inner.set_state(ConnectionState::Discovering);
        }

        tracing::info!("Scanning for devices ({:?})", self.inner.settings.scan_duration);
        let result = self
            .inner
            .capability
            .discover_devices(self.inner.settings.scan_duration)
            .await;

        if prior == ConnectionState::Disconnected {
            self.inner.set_state(prior);
        }

        match result {
            Ok(devices) => {
                tracing::info!("Found {} device(s)", devices.len());
                let mut discovered = self.inner.discovered.lock();
                discovered.clear();
                for device in &devices {
                    discovered.insert(device.id.clone(), device.clone());
                }
                Ok(devices)
            }
            Err(e) => {
                tracing::warn!("Device scan failed: {}", e);
                Err(AppError::Discovery(e.to_string()))
            }
        }
    }

    /// Connect to a device from the last scan
    pub async fn connect(&self, device_id: &str) -> AppResult<DeviceDescriptor> {
        let _guard = self.inner.control.lock().await;

        let state = self.inner.state();
        if !matches!(state, ConnectionState::Disconnected | ConnectionState::Discovering) {
            return Err(AppError::StateConflict(format!(
                "cannot connect while {:?}",
                state
            )));
        }

        if !self.inner.discovered.lock().contains_key(device_id) {
            return Err(AppError::Connection(ConnectionFailure::UnknownDevice(
                device_id.to_string(),
            )));
        }

        self.inner.set_state(ConnectionState::Connecting);
        tracing::info!("Connecting to {}", device_id);

        let result = timeout(
            self.inner.settings.connect_timeout,
            self.inner.capability.connect(device_id),
        )
        .await;

        let failure = match result {
            Ok(Ok(descriptor)) => {
                let reading = self.inner.capability.read_status().await.ok();
                self.inner.update(|s| {
                    s.state = ConnectionState::Connected;
                    s.device = Some(descriptor.clone());
                    s.battery_level = reading.map(|r| r.battery_level);
                    s.signal_quality = reading.map(|r| r.signal_quality);
                    s.reconnect_attempt = 0;
                    s.error = None;
                });
                tracing::info!("Connected to {} ({})", descriptor.name, descriptor.id);
                return Ok(descriptor);
            }
            Ok(Err(e)) => connection_failure(e),
            Err(_) => {
                if let Err(e) = self.inner.capability.disconnect().await {
                    tracing::debug!("Disconnect after connect timeout failed: {}", e);
                }
                ConnectionFailure::Timeout
            }
        };

        tracing::warn!("Connection to {} failed: {}", device_id, failure);
        self.inner.update(|s| {
            s.state = ConnectionState::Disconnected;
            s.error = Some(failure.to_string());
        });
        Err(AppError::Connection(failure))
    }

    /// Start streaming from the connected device
    pub async fn start_stream(&self) -> AppResult<()> {
        let _guard = self.inner.control.lock().await;

        let state = self.inner.state();
        if state != ConnectionState::Connected {
            return Err(AppError::StateConflict(format!(
                "cannot start streaming while {:?}",
                state
            )));
        }

        let (sink, frames) = FrameSink::new(self.inner.settings.frame_queue_capacity);
        self.inner.sequencer.lock().new_stream();

        if let Err(e) = self.inner.capability.start_stream(sink).await {
            tracing::warn!("Device rejected stream start: {}", e);
            self.inner.update(|s| s.error = Some(e.to_string()));
            return Err(AppError::Stream(e.to_string()));
        }

        // Streaming before the pump runs, so a link loss it sees first wins
        self.inner.update(|s| {
            s.state = ConnectionState::Streaming;
            s.error = None;
        });

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_pump(self.inner.clone(), frames, cancel.clone()));
        *self.inner.pump.lock() = Some(Pump { cancel, task });
        Ok(())
    }

    /// Stop streaming. Safe in any state.
    pub async fn stop_stream(&self) -> AppResult<()> {
        let _guard = self.inner.control.lock().await;

        if !self.halt_pump().await {
            return Ok(());
        }

        if self.inner.state() == ConnectionState::Reconnecting {
            // Nothing to return to: the device is gone
            self.close_device().await;
            self.inner.bus.publish(BusEvent::stream_ended(StreamEndReason::Disconnected));
            return Ok(());
        }

        let result = self.inner.capability.stop_stream().await;
        self.inner.bus.publish(BusEvent::stream_ended(StreamEndReason::Stopped));

        match result {
            Ok(()) => {
                self.inner.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Device failed to stop streaming: {}", e);
                self.inner.update(|s| {
                    s.state = ConnectionState::Error;
                    s.error = Some(e.to_string());
                });
                Err(AppError::Stream(e.to_string()))
            }
        }
    }

    /// Disconnect the device. Safe in any state.
    ///
    /// Leaving any attached state ends the stream for consumers, even when
    /// it was paused or never started.
    pub async fn disconnect(&self) -> AppResult<()> {
        let _guard = self.inner.control.lock().await;

        self.halt_pump().await;
        if self.inner.state() == ConnectionState::Disconnected {
            return Ok(());
        }

        self.close_device().await;
        self.inner.bus.publish(BusEvent::stream_ended(StreamEndReason::Disconnected));
        Ok(())
    }

    /// Cancel and join the pump. True if a stream was still live.
    async fn halt_pump(&self) -> bool {
        let Some(pump) = self.inner.take_pump() else {
            return false;
        };
        pump.cancel.cancel();
        if let Err(e) = pump.task.await {
            tracing::error!("Pump task failed: {}", e);
        }
        // The pump may have ended the stream itself (device lost)
        self.inner.state().is_streaming()
    }

    async fn close_device(&self) {
        let _ = self.inner.capability.stop_stream().await;
        if let Err(e) = self.inner.capability.disconnect().await {
            tracing::warn!("Device disconnect reported an error: {}", e);
        }
        self.inner.update(|s| {
            *s = DeviceStatus {
                last_sequence: s.last_sequence,
                ..DeviceStatus::default()
            };
        });
        tracing::info!("Device disconnected");
    }
}

fn connection_failure(error: DeviceError) -> ConnectionFailure {
    match error {
        DeviceError::Connection(failure) => failure,
        other => ConnectionFailure::Rejected(other.to_string()),
    }
}

/// Batch frames off the sink and publish them until cancelled or the
/// device is lost for good
async fn run_pump(inner: Arc<LinkInner>, mut frames: FrameReceiver, cancel: CancellationToken) {
    let period = inner.settings.status_interval.max(Duration::from_millis(10));
    let mut status_tick = interval_at(Instant::now() + period, period);
    status_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pending: Vec<Sample> = Vec::with_capacity(inner.settings.batch_max_samples);

    loop {
        let signal = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            signal = frames.recv() => signal,
            _ = status_tick.tick() => {
                poll_status(&inner).await;
                continue;
            }
        };

        let mut next = Some(signal.unwrap_or_else(|| {
            DeviceSignal::LinkLost("device closed the frame sink".to_string())
        }));

        while let Some(signal) = next.take() {
            match signal {
                DeviceSignal::Frame(frame) => {
                    if let Some(sample) = sequence_frame(&inner, frame) {
                        pending.push(sample);
                    }
                    if pending.len() >= inner.settings.batch_max_samples {
                        publish_batch(&inner, &mut pending);
                    }
                    next = frames.try_recv();
                }
                DeviceSignal::LinkLost(reason) => {
                    publish_batch(&inner, &mut pending);
                    match reconnect(&inner, &reason, &cancel).await {
                        Some(restored) => frames = restored,
                        None => return,
                    }
                }
            }
        }

        publish_batch(&inner, &mut pending);
    }

    publish_batch(&inner, &mut pending);
}

fn sequence_frame(inner: &LinkInner, frame: RawFrame) -> Option<Sample> {
    let sequence = inner.sequencer.lock().assign(frame.packet_number);
    match sequence {
        Some(sequence) => Some(Sample {
            sequence,
            timestamp_us: frame.timestamp_us,
            values: frame.values,
        }),
        None => {
            tracing::debug!("Dropping duplicate packet {}", frame.packet_number);
            None
        }
    }
}

fn publish_batch(inner: &LinkInner, pending: &mut Vec<Sample>) {
    if pending.is_empty() {
        return;
    }
    let samples = std::mem::take(pending);
    let last_sequence = samples.last().map(|s| s.sequence);
    let batch_sequence = inner.batch_counter.fetch_add(1, Ordering::Relaxed) + 1;

    inner.bus.publish(BusEvent::samples(SampleBatch::new(batch_sequence, samples)));
    inner.status.lock().last_sequence = last_sequence;
}

async fn poll_status(inner: &LinkInner) {
    match inner.capability.read_status().await {
        Ok(reading) => {
            let changed = {
                let status = inner.status.lock();
                status.battery_level != Some(reading.battery_level)
                    || status.signal_quality != Some(reading.signal_quality)
            };
            if changed {
                inner.update(|s| {
                    s.battery_level = Some(reading.battery_level);
                    s.signal_quality = Some(reading.signal_quality);
                });
            }
        }
        Err(e) => tracing::debug!("Status poll failed: {}", e),
    }
}

/// Bounded reconnect after a link loss. Returns the new frame receiver on
/// success, `None` if cancelled or out of retries.
async fn reconnect(
    inner: &Arc<LinkInner>,
    reason: &str,
    cancel: &CancellationToken,
) -> Option<FrameReceiver> {
    tracing::warn!("Link lost: {}", reason);

    let last_sequence = inner.status.lock().last_sequence;
    inner.update(|s| {
        s.state = ConnectionState::Reconnecting;
        s.reconnect_attempt = 0;
        s.error = Some(reason.to_string());
    });
    inner.bus.publish(BusEvent::link_lost(last_sequence));

    let device_id = inner.status.lock().device.as_ref().map(|d| d.id.clone())?;
    let policy = inner.settings.reconnect.clone();

    for attempt in 1..=policy.max_retries {
        inner.update(|s| s.reconnect_attempt = attempt);

        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(policy.backoff(attempt)) => {}
        }

        tracing::info!("Reconnect attempt {}/{}", attempt, policy.max_retries);
        let connected = tokio::select! {
            _ = cancel.cancelled() => return None,
            result = timeout(inner.settings.connect_timeout, inner.capability.connect(&device_id)) => result,
        };

        match connected {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::warn!("Reconnect attempt {} failed: {}", attempt, e);
                continue;
            }
            Err(_) => {
                tracing::warn!("Reconnect attempt {} timed out", attempt);
                continue;
            }
        }

        let (sink, frames) = FrameSink::new(inner.settings.frame_queue_capacity);
        match inner.capability.start_stream(sink).await {
            Ok(()) => {
                inner.update(|s| {
                    s.state = ConnectionState::Streaming;
                    s.reconnect_attempt = 0;
                    s.error = None;
                });
                inner.bus.publish(BusEvent::link_restored());
                tracing::info!("Link restored after {} attempt(s)", attempt);
                return Some(frames);
            }
            Err(e) => tracing::warn!("Stream restart after reconnect failed: {}", e),
        }
    }

    if cancel.is_cancelled() {
        return None;
    }

    tracing::error!("Device lost after {} reconnect attempts", policy.max_retries);
    if let Err(e) = inner.capability.disconnect().await {
        tracing::debug!("Disconnect after device loss failed: {}", e);
    }
    inner.update(|s| {
        *s = DeviceStatus {
            last_sequence: s.last_sequence,
            error: Some(format!(
                "device lost after {} reconnect attempts",
                policy.max_retries
            )),
            ..DeviceStatus::default()
        };
    });
    inner.bus.publish(BusEvent::stream_ended(StreamEndReason::DeviceLost));
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::simulated::{SimulatedConfig, SimulatedDevice, SIMULATED_DEVICE_ID};

    fn settings() -> LinkSettings {
        LinkSettings {
            connect_timeout: Duration::from_secs(1),
            scan_duration: Duration::from_millis(100),
            reconnect: ReconnectPolicy {
                max_retries: 3,
                initial_backoff: Duration::from_millis(100),
                max_backoff: Duration::from_millis(400),
            },
            frame_queue_capacity: 1024,
            batch_max_samples: 5,
            status_interval: Duration::from_secs(1),
        }
    }

    fn link(config: SimulatedConfig) -> DeviceLink {
        DeviceLink::new(
            Arc::new(SimulatedDevice::new(config)),
            SampleBus::new(),
            settings(),
        )
    }

    #[test]
    fn test_sequencer() {
        let mut seq = Sequencer::default();
        assert_eq!(seq.assign(7), Some(1));
        assert_eq!(seq.assign(8), Some(2));
        assert_eq!(seq.assign(8), None);
        assert_eq!(seq.assign(12), Some(6));
        assert_eq!(seq.assign(1), Some(7));

        seq.new_stream();
        assert_eq!(seq.assign(1), Some(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_requires_scanned_device() {
        let link = link(SimulatedConfig::default());

        let err = link.connect(SIMULATED_DEVICE_ID).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Connection(ConnectionFailure::UnknownDevice(_))
        ));
        assert_eq!(link.state(), ConnectionState::Disconnected);

        let devices = link.discover().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(link.state(), ConnectionState::Disconnected);

        link.connect(SIMULATED_DEVICE_ID).await.unwrap();
        let status = link.status();
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.battery_level, Some(85));

        // Not valid from Connected
        assert!(matches!(
            link.connect(SIMULATED_DEVICE_ID).await,
            Err(AppError::StateConflict(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_connect_reverts() {
        let link = link(SimulatedConfig::default().reject_connect(ConnectionFailure::RadioBusy));
        link.discover().await.unwrap();

        let err = link.connect(SIMULATED_DEVICE_ID).await.unwrap_err();
        assert!(matches!(err, AppError::Connection(ConnectionFailure::RadioBusy)));
        assert_eq!(err.status_code(), 503);
        assert_eq!(link.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_fault() {
        let link = link(SimulatedConfig::default().discovery_fault("adapter off"));
        assert!(matches!(link.discover().await, Err(AppError::Discovery(_))));
        assert_eq!(link.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_publishes_batches_and_stop_ends_stream() {
        let link = link(SimulatedConfig::default().total_packets(20));
        let mut sub = link.bus().subscribe("test", 64);

        assert!(matches!(link.start_stream().await, Err(AppError::StateConflict(_))));

        link.discover().await.unwrap();
        link.connect(SIMULATED_DEVICE_ID).await.unwrap();
        link.start_stream().await.unwrap();
        assert_eq!(link.state(), ConnectionState::Streaming);

        let mut received = Vec::new();
        while received.len() < 20 {
            match sub.recv().await.unwrap() {
                BusEvent::Samples(batch) => {
                    assert!(batch.len() <= 5);
                    received.extend(batch.samples.iter().map(|s| s.sequence));
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(received, (1..=20).collect::<Vec<u64>>());

        link.stop_stream().await.unwrap();
        assert_eq!(link.state(), ConnectionState::Connected);
        assert!(matches!(
            sub.recv().await,
            Some(BusEvent::StreamEnded {
                reason: StreamEndReason::Stopped,
                ..
            })
        ));

        // Idempotent
        link.stop_stream().await.unwrap();
        assert!(sub.try_recv().is_none());

        // Disconnecting a paused stream still ends it for consumers
        link.disconnect().await.unwrap();
        assert!(matches!(
            sub.recv().await,
            Some(BusEvent::StreamEnded {
                reason: StreamEndReason::Disconnected,
                ..
            })
        ));
        link.disconnect().await.unwrap();
        assert!(sub.try_recv().is_none());
        assert_eq!(link.state(), ConnectionState::Disconnected);
        assert!(link.status().device.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_without_stream_ends_stream() {
        let link = link(SimulatedConfig::default());
        let mut sub = link.bus().subscribe("test", 16);

        // Nothing attached: nothing to end
        link.disconnect().await.unwrap();
        assert!(sub.try_recv().is_none());

        link.discover().await.unwrap();
        link.connect(SIMULATED_DEVICE_ID).await.unwrap();
        link.disconnect().await.unwrap();

        assert!(matches!(
            sub.try_recv(),
            Some(BusEvent::StreamEnded {
                reason: StreamEndReason::Disconnected,
                ..
            })
        ));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_immediate_link_loss_is_not_overwritten() {
        let link = link(
            SimulatedConfig::default()
                .link_loss(0, 0)
                .failing_reconnects(10),
        );
        let mut sub = link.bus().subscribe("test", 256);
        let mut status = link.subscribe_status();

        link.discover().await.unwrap();
        link.connect(SIMULATED_DEVICE_ID).await.unwrap();
        link.start_stream().await.unwrap();

        let ended = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Some(BusEvent::StreamEnded { reason, .. }) = sub.recv().await {
                    return reason;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(ended, StreamEndReason::DeviceLost);

        let mut states = Vec::new();
        while let Ok(s) = status.try_recv() {
            states.push(s.state);
        }
        let lost_at = states
            .iter()
            .position(|s| *s == ConnectionState::Reconnecting)
            .unwrap();
        assert!(states[..lost_at].contains(&ConnectionState::Streaming));
        assert!(!states[lost_at..].contains(&ConnectionState::Streaming));
        assert_eq!(link.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_reconnects() {
        let link = link(
            SimulatedConfig::default()
                .total_packets(30)
                .link_loss(10, 4)
                .failing_reconnects(1),
        );
        let mut sub = link.bus().subscribe("test", 256);
        let mut status = link.subscribe_status();

        link.discover().await.unwrap();
        link.connect(SIMULATED_DEVICE_ID).await.unwrap();
        link.start_stream().await.unwrap();

        let mut sequences = Vec::new();
        let mut lost_after = None;
        let mut restored = false;
        while sequences.last() != Some(&30) {
            match sub.recv().await.unwrap() {
                BusEvent::Samples(batch) => {
                    sequences.extend(batch.samples.iter().map(|s| s.sequence))
                }
                BusEvent::LinkLost { last_sequence, .. } => lost_after = last_sequence,
                BusEvent::LinkRestored { .. } => restored = true,
                other => panic!("unexpected event {:?}", other),
            }
        }

        assert_eq!(lost_after, Some(10));
        assert!(restored);
        assert_eq!(sequences.len(), 26);
        assert_eq!(sequences[10], 15);

        let mut saw_reconnecting = false;
        while let Ok(s) = status.try_recv() {
            saw_reconnecting |= s.state == ConnectionState::Reconnecting;
        }
        assert!(saw_reconnecting);
        assert_eq!(link.state(), ConnectionState::Streaming);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_exhaustion_loses_device() {
        let link = link(
            SimulatedConfig::default()
                .link_loss(5, 0)
                .failing_reconnects(10),
        );
        let mut sub = link.bus().subscribe("test", 256);

        link.discover().await.unwrap();
        link.connect(SIMULATED_DEVICE_ID).await.unwrap();
        link.start_stream().await.unwrap();

        loop {
            if let BusEvent::StreamEnded { reason, .. } = sub.recv().await.unwrap() {
                assert_eq!(reason, StreamEndReason::DeviceLost);
                break;
            }
        }

        let status = link.status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(status.error.unwrap().contains("device lost"));

        // Disconnect after loss is still safe and publishes nothing
        link.disconnect().await.unwrap();
        assert!(sub.try_recv().is_none());
    }
}
