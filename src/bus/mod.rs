//! Sample bus
//!
//! Real-time fan-out of sample batches and stream events from the device
//! link to the recorder and live view consumers.

pub mod batch;
pub mod hub;

pub use batch::{BusEvent, Sample, SampleBatch, StreamEndReason};
pub use hub::{BusStats, PublishReport, SampleBus, SubscriberId, Subscription};
