//! Pipeline configuration
//!
//! Every threshold the pipeline uses (chunk ceilings, flush cadence, retry
//! bounds, queue sizes) lives here so tests and deployments can tune them.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Bounded reconnect policy applied by the device link after link loss
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Number of reconnect attempts before giving up
    pub max_retries: u32,
    /// Delay before the first attempt
    pub initial_backoff: Duration,
    /// Upper bound for the exponential backoff
    pub max_backoff: Duration,
}

impl ReconnectPolicy {
    /// Delay before the given attempt (1-based), doubling each time
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

/// Pipeline configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory; sessions live under `<root>/sessions`
    pub storage_root: PathBuf,
    /// Rotate the open chunk after this many samples
    pub chunk_max_samples: u64,
    /// Rotate the open chunk once it reaches this many bytes
    pub chunk_max_bytes: u64,
    /// Flush + fsync at least this often while recording
    pub flush_interval: Duration,
    /// Flush + fsync once this many bytes are buffered
    pub flush_bytes: usize,
    /// Reconnect policy for transient link loss
    pub reconnect: ReconnectPolicy,
    /// How long a single connect attempt may take
    pub connect_timeout: Duration,
    /// How long a discovery scan listens
    pub scan_duration: Duration,
    /// Frames buffered between the vendor callback and the pump task
    pub frame_queue_capacity: usize,
    /// Maximum samples folded into one batch by the pump task
    pub batch_max_samples: usize,
    /// Queue depth of the recorder's bus subscription
    pub recorder_queue_capacity: usize,
    /// Queue depth of each live client's bus subscription
    pub live_queue_capacity: usize,
    /// Battery / signal-quality poll cadence while streaming
    pub status_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("data"),
            chunk_max_samples: 75_000, // 5 minutes at 250 Hz
            chunk_max_bytes: 8 * 1024 * 1024,
            flush_interval: Duration::from_secs(1),
            flush_bytes: 64 * 1024,
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(15),
            scan_duration: Duration::from_secs(10),
            frame_queue_capacity: 1024,
            batch_max_samples: 25,
            recorder_queue_capacity: 4096,
            live_queue_capacity: 256,
            status_interval: Duration::from_secs(1),
        }
    }
}

impl Config {
    /// Load configuration from `NEURO_NOTES_*` environment variables,
    /// falling back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let storage_root = std::env::var("NEURO_NOTES_STORAGE_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.storage_root);

        let reconnect = ReconnectPolicy {
            max_retries: env_parse("NEURO_NOTES_RECONNECT_RETRIES")
                .unwrap_or(defaults.reconnect.max_retries),
            initial_backoff: env_millis("NEURO_NOTES_RECONNECT_BACKOFF_MS")
                .unwrap_or(defaults.reconnect.initial_backoff),
            max_backoff: env_millis("NEURO_NOTES_RECONNECT_MAX_BACKOFF_MS")
                .unwrap_or(defaults.reconnect.max_backoff),
        };

        Self {
            storage_root,
            chunk_max_samples: env_parse("NEURO_NOTES_CHUNK_MAX_SAMPLES")
                .unwrap_or(defaults.chunk_max_samples),
            chunk_max_bytes: env_parse("NEURO_NOTES_CHUNK_MAX_BYTES")
                .unwrap_or(defaults.chunk_max_bytes),
            flush_interval: env_millis("NEURO_NOTES_FLUSH_INTERVAL_MS")
                .unwrap_or(defaults.flush_interval),
            flush_bytes: env_parse("NEURO_NOTES_FLUSH_BYTES").unwrap_or(defaults.flush_bytes),
            reconnect,
            connect_timeout: env_millis("NEURO_NOTES_CONNECT_TIMEOUT_MS")
                .unwrap_or(defaults.connect_timeout),
            scan_duration: env_millis("NEURO_NOTES_SCAN_DURATION_MS")
                .unwrap_or(defaults.scan_duration),
            ..defaults
        }
    }

    /// Set the storage root
    pub fn storage_root(mut self, root: impl AsRef<Path>) -> Self {
        self.storage_root = root.as_ref().to_path_buf();
        self
    }

    /// Set the per-chunk sample ceiling
    pub fn chunk_max_samples(mut self, samples: u64) -> Self {
        self.chunk_max_samples = samples;
        self
    }

    /// Set the per-chunk byte ceiling
    pub fn chunk_max_bytes(mut self, bytes: u64) -> Self {
        self.chunk_max_bytes = bytes;
        self
    }

    /// Set the flush interval
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set the flush byte threshold
    pub fn flush_bytes(mut self, bytes: usize) -> Self {
        self.flush_bytes = bytes;
        self
    }

    /// Set the reconnect policy
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Set the recorder subscription depth
    pub fn recorder_queue_capacity(mut self, capacity: usize) -> Self {
        self.recorder_queue_capacity = capacity;
        self
    }

    /// Set the live client subscription depth
    pub fn live_queue_capacity(mut self, capacity: usize) -> Self {
        self.live_queue_capacity = capacity;
        self
    }

    /// Set the scan duration
    pub fn scan_duration(mut self, duration: Duration) -> Self {
        self.scan_duration = duration;
        self
    }

    /// Directory holding every session
    pub fn sessions_dir(&self) -> PathBuf {
        self.storage_root.join("sessions")
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}
