//! Recording state management
//!
//! Defines the session state machine, chunk references and the manifest
//! persisted next to the chunk files.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Manifest format identifier
pub const MANIFEST_FORMAT: &str = "neuro-notes-session-v1";

/// Current state of a recording session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No recording in progress
    Idle,
    /// Currently recording
    Recording,
    /// Recording finished, normally or not
    Stopped,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::Idle
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    /// Explicit stop
    Completed,
    /// The device was disconnected while recording
    Disconnected,
    /// The link was lost and reconnection failed
    DeviceLost,
    /// A write, flush or manifest update failed
    StorageFailure,
    /// The recorder fell behind the bus and was dropped
    Overrun,
    /// Rebuilt by crash recovery
    Recovered,
}

impl EndReason {
    /// Anything other than an explicit stop
    pub fn is_abnormal(&self) -> bool {
        !matches!(self, EndReason::Completed)
    }
}

/// Kind of marker record interleaved with samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MarkerKind {
    /// Radio link lost while streaming
    Disconnect,
    /// Stream stopped on request while the session kept running
    StreamPaused,
    /// Sequence numbers jumped without a preceding disconnect
    Gap,
}

impl MarkerKind {
    pub fn code(&self) -> u8 {
        match self {
            MarkerKind::Disconnect => 1,
            MarkerKind::StreamPaused => 2,
            MarkerKind::Gap => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(MarkerKind::Disconnect),
            2 => Some(MarkerKind::StreamPaused),
            3 => Some(MarkerKind::Gap),
            _ => None,
        }
    }
}

/// A marker as listed in the manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkerRef {
    pub kind: MarkerKind,
    /// Last sequence recorded before the marker (0 if none yet)
    pub after_sequence: u64,
    /// Chunk the marker record lives in
    pub chunk_index: u32,
    pub recorded_at: DateTime<Utc>,
}

/// Reference to a chunk file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRef {
    pub index: u32,
    pub file_name: String,
    pub first_sequence: Option<u64>,
    pub last_sequence: Option<u64>,
    pub sample_count: u64,
    pub byte_size: u64,
    /// CRC32 over the chunk's records, as stored in its footer
    pub checksum: u32,
    pub closed: bool,
}

/// One continuous recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub label: String,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    pub total_samples: u64,
    #[serde(default)]
    pub channel_count: u16,
    #[serde(default)]
    pub channel_labels: Vec<String>,
    pub chunks: Vec<ChunkRef>,
    #[serde(default)]
    pub markers: Vec<MarkerRef>,
    #[serde(default)]
    pub end_reason: Option<EndReason>,
    /// Set when the session ended on a fault
    #[serde(default)]
    pub error: Option<String>,
}

impl Session {
    /// Create a new session that is recording as of now
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            state: SessionState::Recording,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            total_samples: 0,
            channel_count: 0,
            channel_labels: Vec::new(),
            chunks: Vec::new(),
            markers: Vec::new(),
            end_reason: None,
            error: None,
        }
    }

    /// Move to the terminal state
    pub fn end(&mut self, reason: EndReason, error: Option<String>) {
        let now = Utc::now();
        self.state = SessionState::Stopped;
        self.ended_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
        self.end_reason = Some(reason);
        self.error = error;
    }

    pub fn is_recording(&self) -> bool {
        self.state == SessionState::Recording
    }

    pub fn is_abnormal(&self) -> bool {
        self.end_reason.map(|r| r.is_abnormal()).unwrap_or(false)
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// Last sequence number across closed chunks
    pub fn last_sequence(&self) -> Option<u64> {
        self.chunks.iter().rev().find_map(|c| c.last_sequence)
    }
}

/// `manifest.json` contents
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionManifest {
    pub format: String,
    pub version: String,
    /// False while recording; recovery treats incomplete manifests as
    /// abnormally terminated sessions
    pub complete: bool,
    #[serde(flatten)]
    pub session: Session,
}

impl SessionManifest {
    pub fn new(session: Session, complete: bool) -> Self {
        Self {
            format: MANIFEST_FORMAT.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            complete,
            session,
        }
    }
}
