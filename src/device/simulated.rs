//! Simulated headset
//!
//! Stands in for the vendor library during development and tests: one
//! 4-channel device (O1, O2, T3, T4) at 250 Hz producing a deterministic
//! waveform. Faults (link loss, failing reconnects, rejected connects,
//! adapter errors) are injected through `SimulatedConfig`.

use super::traits::{
    DeviceCapability, DeviceDescriptor, DeviceReading, FrameSink, RawFrame, SignalQuality,
};
use crate::utils::error::{ConnectionFailure, DeviceError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::f32::consts::PI;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Channel labels of the simulated headset
pub const SIMULATED_CHANNELS: [&str; 4] = ["O1", "O2", "T3", "T4"];

/// Id of the single simulated device
pub const SIMULATED_DEVICE_ID: &str = "sim-brainbit-0001";

/// Drop the link once, after a given packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkLossPlan {
    /// Packet number after which the link drops
    pub after_packet: u64,
    /// Packets the device produces while the link is down
    pub lost_packets: u64,
}

/// Simulated device behavior
#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    pub sample_rate: u32,
    pub battery_level: u8,
    /// Stop producing frames after this packet number
    pub total_packets: Option<u64>,
    pub link_loss: Option<LinkLossPlan>,
    /// Reconnect attempts that fail after a link loss
    pub failing_reconnects: u32,
    /// Reject the first connect with this failure
    pub reject_connect: Option<ConnectionFailure>,
    /// Fail discovery with an adapter fault
    pub discovery_fault: Option<String>,
    /// Scan time, capped by the requested scan duration
    pub discovery_delay: Duration,
    pub connect_delay: Duration,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            sample_rate: 250,
            battery_level: 85,
            total_packets: None,
            link_loss: None,
            failing_reconnects: 0,
            reject_connect: None,
            discovery_fault: None,
            discovery_delay: Duration::from_millis(200),
            connect_delay: Duration::from_millis(50),
        }
    }
}

impl SimulatedConfig {
    pub fn total_packets(mut self, packets: u64) -> Self {
        self.total_packets = Some(packets);
        self
    }

    pub fn link_loss(mut self, after_packet: u64, lost_packets: u64) -> Self {
        self.link_loss = Some(LinkLossPlan {
            after_packet,
            lost_packets,
        });
        self
    }

    pub fn failing_reconnects(mut self, attempts: u32) -> Self {
        self.failing_reconnects = attempts;
        self
    }

    pub fn reject_connect(mut self, failure: ConnectionFailure) -> Self {
        self.reject_connect = Some(failure);
        self
    }

    pub fn discovery_fault(mut self, reason: impl Into<String>) -> Self {
        self.discovery_fault = Some(reason.into());
        self
    }
}

#[derive(Default)]
struct SimState {
    connected: bool,
    stream: Option<(CancellationToken, JoinHandle<()>)>,
    packet: u64,
    link_loss_fired: bool,
    reconnect_failures_left: u32,
    connect_rejected: bool,
}

/// What the stream task does on a tick
enum Tick {
    Emit(RawFrame),
    Lose(String),
    Idle,
}

/// Simulated BrainBit-style headset
pub struct SimulatedDevice {
    config: SimulatedConfig,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedDevice {
    pub fn new(config: SimulatedConfig) -> Self {
        let state = SimState {
            reconnect_failures_left: config.failing_reconnects,
            ..SimState::default()
        };
        Self {
            config,
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor {
            id: SIMULATED_DEVICE_ID.to_string(),
            name: "BrainBit (simulated)".to_string(),
            address: "00:00:00:00:00:01".to_string(),
            family: "BrainBit".to_string(),
            sample_rate: self.config.sample_rate,
            channel_labels: SIMULATED_CHANNELS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Last packet number produced
    pub fn packet_number(&self) -> u64 {
        self.state.lock().packet
    }

    fn stop_stream_task(state: &mut SimState) {
        if let Some((cancel, _task)) = state.stream.take() {
            cancel.cancel();
        }
    }
}

/// Deterministic test signal: a 10 Hz rhythm per channel with a slow drift
fn waveform(packet: u64, sample_rate: u32, channels: usize) -> Vec<f32> {
    let t = packet as f32 / sample_rate as f32;
    (0..channels)
        .map(|ch| {
            let phase = ch as f32 * PI / 4.0;
            50.0 * (2.0 * PI * 10.0 * t + phase).sin() + 5.0 * (2.0 * PI * t).sin()
        })
        .collect()
}

fn next_tick(state: &mut SimState, config: &SimulatedConfig) -> Tick {
    if !state.connected {
        return Tick::Idle;
    }
    if let Some(total) = config.total_packets {
        if state.packet >= total {
            return Tick::Idle;
        }
    }
    if let Some(plan) = config.link_loss {
        if !state.link_loss_fired && state.packet >= plan.after_packet {
            state.link_loss_fired = true;
            state.connected = false;
            // The device keeps counting while nobody listens
            state.packet += plan.lost_packets;
            return Tick::Lose(format!(
                "simulated link loss after packet {}",
                plan.after_packet
            ));
        }
    }

    state.packet += 1;
    let period_us = 1_000_000 / config.sample_rate.max(1) as u64;
    Tick::Emit(RawFrame {
        packet_number: state.packet,
        timestamp_us: state.packet * period_us,
        values: waveform(state.packet, config.sample_rate, SIMULATED_CHANNELS.len()),
    })
}

async fn stream_frames(
    state: Arc<Mutex<SimState>>,
    config: SimulatedConfig,
    sink: FrameSink,
    cancel: CancellationToken,
) {
    let period = Duration::from_secs_f64(1.0 / config.sample_rate.max(1) as f64);
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let tick = next_tick(&mut state.lock(), &config);
        match tick {
            Tick::Emit(frame) => {
                sink.push_frame(frame);
            }
            Tick::Lose(reason) => {
                tracing::info!("{}", reason);
                sink.link_lost(reason);
                break;
            }
            Tick::Idle => {}
        }
    }
}

#[async_trait]
impl DeviceCapability for SimulatedDevice {
    async fn discover_devices(
        &self,
        scan_duration: Duration,
    ) -> Result<Vec<DeviceDescriptor>, DeviceError> {
        if let Some(reason) = &self.config.discovery_fault {
            return Err(DeviceError::Adapter(reason.clone()));
        }
        tokio::time::sleep(self.config.discovery_delay.min(scan_duration)).await;
        Ok(vec![self.descriptor()])
    }

    async fn connect(&self, device_id: &str) -> Result<DeviceDescriptor, DeviceError> {
        if device_id != SIMULATED_DEVICE_ID {
            return Err(ConnectionFailure::UnknownDevice(device_id.to_string()).into());
        }
        tokio::time::sleep(self.config.connect_delay).await;

        let mut state = self.state.lock();
        if let Some(failure) = &self.config.reject_connect {
            if !state.connect_rejected {
                state.connect_rejected = true;
                return Err(failure.clone().into());
            }
        }
        if state.link_loss_fired && state.reconnect_failures_left > 0 {
            state.reconnect_failures_left -= 1;
            return Err(ConnectionFailure::RadioBusy.into());
        }
        state.connected = true;
        Ok(self.descriptor())
    }

    async fn start_stream(&self, sink: FrameSink) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(DeviceError::NotConnected);
        }
        Self::stop_stream_task(&mut state);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(stream_frames(
            self.state.clone(),
            self.config.clone(),
            sink,
            cancel.clone(),
        ));
        state.stream = Some((cancel, task));
        Ok(())
    }

    async fn stop_stream(&self) -> Result<(), DeviceError> {
        Self::stop_stream_task(&mut self.state.lock());
        Ok(())
    }

    async fn read_status(&self) -> Result<DeviceReading, DeviceError> {
        if !self.state.lock().connected {
            return Err(DeviceError::NotConnected);
        }
        Ok(DeviceReading {
            battery_level: self.config.battery_level,
            signal_quality: SignalQuality::Good,
        })
    }

    async fn disconnect(&self) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        Self::stop_stream_task(&mut state);
        state.connected = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::traits::DeviceSignal;

    #[tokio::test(start_paused = true)]
    async fn test_streams_deterministic_frames() {
        let device = SimulatedDevice::new(SimulatedConfig::default().total_packets(10));
        let found = device.discover_devices(Duration::from_secs(10)).await.unwrap();
        assert_eq!(found[0].channel_labels, vec!["O1", "O2", "T3", "T4"]);

        device.connect(SIMULATED_DEVICE_ID).await.unwrap();
        let (sink, mut rx) = FrameSink::new(64);
        device.start_stream(sink).await.unwrap();

        for n in 1..=10 {
            match rx.recv().await {
                Some(DeviceSignal::Frame(frame)) => {
                    assert_eq!(frame.packet_number, n);
                    assert_eq!(frame.timestamp_us, n * 4_000);
                    assert_eq!(frame.values, waveform(n, 250, 4));
                }
                other => panic!("unexpected signal {:?}", other),
            }
        }
        assert_eq!(device.read_status().await.unwrap().battery_level, 85);
        device.disconnect().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_advances_packet_counter() {
        let device = SimulatedDevice::new(
            SimulatedConfig::default()
                .link_loss(3, 7)
                .failing_reconnects(1),
        );
        device.connect(SIMULATED_DEVICE_ID).await.unwrap();
        let (sink, mut rx) = FrameSink::new(64);
        device.start_stream(sink).await.unwrap();

        for _ in 0..3 {
            assert!(matches!(rx.recv().await, Some(DeviceSignal::Frame(_))));
        }
        assert!(matches!(rx.recv().await, Some(DeviceSignal::LinkLost(_))));
        assert!(device.read_status().await.is_err());

        assert!(device.connect(SIMULATED_DEVICE_ID).await.is_err());
        device.connect(SIMULATED_DEVICE_ID).await.unwrap();

        let (sink, mut rx) = FrameSink::new(64);
        device.start_stream(sink).await.unwrap();
        match rx.recv().await {
            Some(DeviceSignal::Frame(frame)) => assert_eq!(frame.packet_number, 11),
            other => panic!("unexpected signal {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_faults() {
        let device = SimulatedDevice::new(
            SimulatedConfig::default()
                .discovery_fault("adapter off")
                .reject_connect(ConnectionFailure::RadioBusy),
        );
        assert!(matches!(
            device.discover_devices(Duration::from_millis(1)).await,
            Err(DeviceError::Adapter(_))
        ));
        assert_eq!(
            device.connect("nope").await,
            Err(DeviceError::Connection(ConnectionFailure::UnknownDevice(
                "nope".to_string()
            )))
        );
        assert_eq!(
            device.connect(SIMULATED_DEVICE_ID).await,
            Err(DeviceError::Connection(ConnectionFailure::RadioBusy))
        );
        assert!(device.connect(SIMULATED_DEVICE_ID).await.is_ok());
    }
}
