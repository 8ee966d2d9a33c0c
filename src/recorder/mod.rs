//! Session recording
//!
//! This module turns the sample bus into durable session storage:
//! - Chunk file format (append-only, CRC-framed records, closing footer)
//! - Recorder task with rotation, flush thresholds and markers
//! - Crash recovery for sessions that were cut off mid-recording

pub mod chunk;
pub mod recovery;
pub mod state;
pub mod writer;

pub use chunk::{ChunkRecord, ChunkScan, ChunkWriter};
pub use recovery::{recover_sessions, RecoveryReport};
pub use state::{ChunkRef, EndReason, MarkerKind, MarkerRef, Session, SessionManifest, SessionState};
pub use writer::{start_chunking, RecorderHandle, RecorderSettings};
