//! Device link module
//!
//! Provides the vendor-agnostic headset interface and the link that drives
//! it. The simulated device is the development fallback used when no vendor
//! library is available.

pub mod link;
pub mod simulated;
pub mod traits;

pub use link::{ConnectionState, DeviceLink, DeviceStatus, LinkSettings};
pub use simulated::{SimulatedConfig, SimulatedDevice, SIMULATED_DEVICE_ID};
pub use traits::{
    DeviceCapability, DeviceDescriptor, DeviceReading, DeviceSignal, FrameReceiver, FrameSink,
    RawFrame, SignalQuality,
};
