//! Session recorder task
//!
//! Consumes the sample bus for one session and turns it into chunk files.
//! The task is the only writer of its session directory: it owns the open
//! chunk, rotates on the sample or byte ceiling, flushes on a byte threshold
//! or a timer, and finishes with a complete manifest on every exit path it
//! controls.

use super::chunk::{chunk_file_name, ChunkMarker, ChunkWriter};
use super::state::{EndReason, MarkerKind, MarkerRef, Session, SessionManifest};
use crate::bus::{BusEvent, Sample, SampleBatch, SampleBus, StreamEndReason, Subscription};
use crate::config::Config;
use crate::session::layout::write_manifest;
use crate::utils::error::StorageError;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Recorder thresholds
#[derive(Debug, Clone)]
pub struct RecorderSettings {
    pub chunk_max_samples: u64,
    pub chunk_max_bytes: u64,
    pub flush_interval: Duration,
    pub flush_bytes: usize,
    pub queue_capacity: usize,
}

impl From<&Config> for RecorderSettings {
    fn from(config: &Config) -> Self {
        Self {
            chunk_max_samples: config.chunk_max_samples.max(1),
            chunk_max_bytes: config.chunk_max_bytes,
            flush_interval: config.flush_interval,
            flush_bytes: config.flush_bytes,
            queue_capacity: config.recorder_queue_capacity,
        }
    }
}

/// Handle to a running recorder task
pub struct RecorderHandle {
    session_id: String,
    cancel: CancellationToken,
    progress: watch::Receiver<Session>,
    task: Option<JoinHandle<Session>>,
}

impl RecorderHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Latest session snapshot published by the task
    pub fn snapshot(&self) -> Session {
        self.progress.borrow().clone()
    }

    /// Watch the session as the task updates it
    pub fn progress(&self) -> watch::Receiver<Session> {
        self.progress.clone()
    }

    /// Ask the task to drain, close the open chunk and finish
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Take the task handle, for whoever supervises the task
    pub fn take_task(&mut self) -> Option<JoinHandle<Session>> {
        self.task.take()
    }

    /// Stop and wait for the final session
    pub async fn finish(mut self) -> Session {
        self.stop();
        match self.task.take() {
            Some(task) => match task.await {
                Ok(session) => session,
                Err(e) => {
                    tracing::error!("Recorder task for {} failed: {}", self.session_id, e);
                    self.snapshot()
                }
            },
            None => {
                let _ = self.progress.wait_for(|s| !s.is_recording()).await;
                self.snapshot()
            }
        }
    }
}

/// Start recording `session` into `session_dir`.
///
/// Opens chunk 0 and writes an incomplete manifest before subscribing, so a
/// session that fails to start leaves nothing half-recorded behind.
pub fn start_chunking(
    session_dir: &Path,
    session: Session,
    bus: &SampleBus,
    settings: RecorderSettings,
) -> Result<RecorderHandle, StorageError> {
    std::fs::create_dir_all(session_dir)?;

    let first_chunk = ChunkWriter::create(
        &session_dir.join(chunk_file_name(0)),
        0,
        session.channel_count,
    )?;
    write_manifest(session_dir, &SessionManifest::new(session.clone(), false))?;

    let subscription = bus.subscribe(
        format!("recorder:{}", session.id),
        settings.queue_capacity,
    );
    let (progress_tx, progress_rx) = watch::channel(session.clone());
    let cancel = CancellationToken::new();

    tracing::info!("Recording session {} into {:?}", session.id, session_dir);

    let session_id = session.id.clone();
    let task = RecorderTask {
        dir: session_dir.to_path_buf(),
        session,
        settings,
        open: Some(first_chunk),
        next_index: 1,
        sequence: SequenceTracker::default(),
        last_timestamp_us: 0,
        progress: progress_tx,
    };
    let join = tokio::spawn(task.run(subscription, cancel.clone()));

    Ok(RecorderHandle {
        session_id,
        cancel,
        progress: progress_rx,
        task: Some(join),
    })
}

/// Maps link-wide sequence numbers onto session sequence numbers
#[derive(Debug, Default)]
struct SequenceTracker {
    /// link sequence = session sequence + offset
    offset: i64,
    last_link: Option<u64>,
    last_session: Option<u64>,
    /// A disconnect or pause marker already accounts for the next jump
    gap_explained: bool,
}

enum Step {
    Contiguous(u64),
    Jump(u64),
}

impl SequenceTracker {
    fn next(&mut self, link_sequence: u64) -> Step {
        let step = match (self.last_link, self.last_session) {
            (Some(last_link), Some(last_session)) if link_sequence > last_link => {
                let session_seq = (link_sequence as i64 - self.offset) as u64;
                if link_sequence == last_link + 1 || self.gap_explained {
                    Step::Contiguous(session_seq)
                } else {
                    Step::Jump(session_seq.max(last_session + 1))
                }
            }
            // Counter went backwards: keep the session sequence moving
            (Some(_), Some(last_session)) => {
                self.offset = link_sequence as i64 - (last_session + 1) as i64;
                if self.gap_explained {
                    Step::Contiguous(last_session + 1)
                } else {
                    Step::Jump(last_session + 1)
                }
            }
            _ => {
                self.offset = link_sequence as i64 - 1;
                Step::Contiguous(1)
            }
        };

        let session_seq = match step {
            Step::Contiguous(s) | Step::Jump(s) => s,
        };
        self.last_link = Some(link_sequence);
        self.last_session = Some(session_seq);
        self.gap_explained = false;
        step
    }
}

enum Outcome {
    Ended(EndReason),
    Fault(StorageError),
}

struct RecorderTask {
    dir: PathBuf,
    session: Session,
    settings: RecorderSettings,
    open: Option<ChunkWriter>,
    next_index: u32,
    sequence: SequenceTracker,
    last_timestamp_us: u64,
    progress: watch::Sender<Session>,
}

impl RecorderTask {
    async fn run(mut self, mut subscription: Subscription, cancel: CancellationToken) -> Session {
        let period = self.settings.flush_interval.max(Duration::from_millis(1));
        let mut flush_tick = interval_at(Instant::now() + period, period);
        flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    break self.drain(&mut subscription);
                }

                event = subscription.recv() => match event {
                    Some(event) => match self.handle(event) {
                        Ok(None) => {}
                        Ok(Some(reason)) => break Outcome::Ended(reason),
                        Err(e) => break Outcome::Fault(e),
                    },
                    None if subscription.is_overrun() => break Outcome::Ended(EndReason::Overrun),
                    None => break Outcome::Ended(EndReason::Disconnected),
                },

                _ = flush_tick.tick() => {
                    if let Err(e) = self.flush() {
                        break Outcome::Fault(e);
                    }
                    self.publish_progress();
                }
            }
        };

        subscription.unsubscribe();
        self.finish(outcome)
    }

    /// Process everything already queued, then stop
    fn drain(&mut self, subscription: &mut Subscription) -> Outcome {
        while let Some(event) = subscription.try_recv() {
            match self.handle(event) {
                Ok(None) => {}
                Ok(Some(reason)) => return Outcome::Ended(reason),
                Err(e) => return Outcome::Fault(e),
            }
        }
        if subscription.is_overrun() {
            return Outcome::Ended(EndReason::Overrun);
        }
        Outcome::Ended(EndReason::Completed)
    }

    /// Apply one bus event. `Ok(Some(_))` ends the session.
    fn handle(&mut self, event: BusEvent) -> Result<Option<EndReason>, StorageError> {
        match event {
            BusEvent::Samples(batch) => {
                self.append_batch(&batch)?;
                Ok(None)
            }
            BusEvent::LinkLost { .. } => {
                self.append_marker(MarkerKind::Disconnect)?;
                self.sequence.gap_explained = true;
                Ok(None)
            }
            BusEvent::LinkRestored { .. } => {
                tracing::info!("Session {}: link restored", self.session.id);
                Ok(None)
            }
            BusEvent::StreamEnded { reason, .. } => match reason {
                StreamEndReason::Stopped => {
                    self.append_marker(MarkerKind::StreamPaused)?;
                    self.sequence.gap_explained = true;
                    Ok(None)
                }
                StreamEndReason::Disconnected => Ok(Some(EndReason::Disconnected)),
                StreamEndReason::DeviceLost => Ok(Some(EndReason::DeviceLost)),
            },
        }
    }

    fn append_batch(&mut self, batch: &SampleBatch) -> Result<(), StorageError> {
        for sample in &batch.samples {
            let sequence = match self.sequence.next(sample.sequence) {
                Step::Contiguous(seq) => seq,
                Step::Jump(seq) => {
                    tracing::warn!(
                        "Session {}: unexplained sequence jump before link sequence {}",
                        self.session.id,
                        sample.sequence
                    );
                    self.append_marker(MarkerKind::Gap)?;
                    seq
                }
            };

            let record = Sample {
                sequence,
                timestamp_us: sample.timestamp_us,
                values: sample.values.clone(),
            };
            self.writer()?.append_sample(&record)?;
            self.session.total_samples += 1;
            self.last_timestamp_us = sample.timestamp_us;
            self.after_record()?;
        }

        let total = self.session.total_samples;
        self.progress.send_modify(|s| s.total_samples = total);
        Ok(())
    }

    fn append_marker(&mut self, kind: MarkerKind) -> Result<(), StorageError> {
        let after_sequence = self.sequence.last_session.unwrap_or(0);
        let now = Utc::now();
        let marker = ChunkMarker {
            kind,
            after_sequence,
            timestamp_us: self.last_timestamp_us,
            wall_clock_ms: now.timestamp_millis(),
        };

        let writer = self.writer()?;
        writer.append_marker(&marker)?;
        let chunk_index = writer.index();

        tracing::info!(
            "Session {}: {:?} marker after sequence {}",
            self.session.id,
            kind,
            after_sequence
        );

        self.session.markers.push(MarkerRef {
            kind,
            after_sequence,
            chunk_index,
            recorded_at: now,
        });
        self.after_record()?;
        self.publish_progress();
        Ok(())
    }

    /// The open chunk, opening the next one if the last was rotated out
    fn writer(&mut self) -> Result<&mut ChunkWriter, StorageError> {
        if self.open.is_none() {
            let index = self.next_index;
            let path = self.dir.join(chunk_file_name(index));
            self.open = Some(ChunkWriter::create(&path, index, self.session.channel_count)?);
            self.next_index += 1;
        }
        self.open
            .as_mut()
            .ok_or(StorageError::ChunkClosed { index: self.next_index })
    }

    /// Rotation and threshold flush after each record
    fn after_record(&mut self) -> Result<(), StorageError> {
        let Some(writer) = self.open.as_mut() else {
            return Ok(());
        };

        if writer.sample_count() >= self.settings.chunk_max_samples
            || writer.byte_size() >= self.settings.chunk_max_bytes
        {
            return self.rotate();
        }

        if writer.unflushed_bytes() >= self.settings.flush_bytes {
            writer.flush()?;
        }
        Ok(())
    }

    /// Close the open chunk and record it in the manifest
    fn rotate(&mut self) -> Result<(), StorageError> {
        if let Some(writer) = self.open.take() {
            let chunk = writer.close()?;
            self.session.chunks.push(chunk);
            write_manifest(&self.dir, &SessionManifest::new(self.session.clone(), false))?;
            self.publish_progress();
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        match self.open.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }

    fn publish_progress(&self) {
        self.progress.send_replace(self.session.clone());
    }

    fn finish(mut self, outcome: Outcome) -> Session {
        let (mut reason, mut error) = match outcome {
            Outcome::Ended(reason) => (reason, None),
            Outcome::Fault(e) => {
                tracing::error!("Session {}: storage failure: {}", self.session.id, e);
                (EndReason::StorageFailure, Some(e.to_string()))
            }
        };

        if let Some(writer) = self.open.take() {
            match writer.close() {
                Ok(chunk) => self.session.chunks.push(chunk),
                Err(e) => {
                    tracing::error!("Session {}: failed to close chunk: {}", self.session.id, e);
                    if error.is_none() {
                        reason = EndReason::StorageFailure;
                        error = Some(e.to_string());
                    }
                }
            }
        }

        self.session.end(reason, error);

        if let Err(e) = write_manifest(&self.dir, &SessionManifest::new(self.session.clone(), true)) {
            tracing::error!("Session {}: failed to write manifest: {}", self.session.id, e);
            if self.session.error.is_none() {
                self.session.end_reason = Some(EndReason::StorageFailure);
                self.session.error = Some(e.to_string());
            }
        }

        tracing::info!(
            "Session {} stopped ({:?}): {} samples in {} chunks",
            self.session.id,
            reason,
            self.session.total_samples,
            self.session.chunks.len()
        );

        self.publish_progress();
        self.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::chunk::{scan_chunk, ChunkRecord};
    use crate::recorder::state::SessionState;
    use crate::session::layout::read_manifest;
    use tempfile::tempdir;

    fn settings(max_samples: u64) -> RecorderSettings {
        RecorderSettings {
            chunk_max_samples: max_samples,
            chunk_max_bytes: u64::MAX,
            flush_interval: Duration::from_secs(1),
            flush_bytes: 4096,
            queue_capacity: 4096,
        }
    }

    fn batch(seqs: impl IntoIterator<Item = u64>) -> BusEvent {
        let samples: Vec<Sample> = seqs
            .into_iter()
            .map(|seq| Sample {
                sequence: seq,
                timestamp_us: seq * 4_000,
                values: vec![0.5; 4],
            })
            .collect();
        BusEvent::samples(SampleBatch::new(samples[0].sequence, samples))
    }

    fn session(id: &str) -> Session {
        let mut session = Session::new(id, "test");
        session.channel_count = 4;
        session
    }

    #[test]
    fn test_sequence_tracker_rebases_and_flags_jumps() {
        let mut tracker = SequenceTracker::default();
        assert!(matches!(tracker.next(41), Step::Contiguous(1)));
        assert!(matches!(tracker.next(42), Step::Contiguous(2)));
        assert!(matches!(tracker.next(45), Step::Jump(5)));

        tracker.gap_explained = true;
        assert!(matches!(tracker.next(50), Step::Contiguous(10)));

        // Backwards counter continues at +1
        assert!(matches!(tracker.next(3), Step::Jump(11)));
        assert!(matches!(tracker.next(4), Step::Contiguous(12)));
    }

    #[tokio::test]
    async fn test_rotation_and_stop() {
        let dir = tempdir().unwrap();
        let session_dir = dir.path().join("s1");
        let bus = SampleBus::new();

        let handle = start_chunking(&session_dir, session("s1"), &bus, settings(10)).unwrap();
        assert!(!read_manifest(&session_dir).unwrap().unwrap().complete);

        for seq in (1..=25).step_by(5) {
            bus.publish(batch(seq..seq + 5));
        }

        let session = handle.finish().await;
        assert_eq!(session.state, SessionState::Stopped);
        assert_eq!(session.end_reason, Some(EndReason::Completed));
        assert_eq!(session.total_samples, 25);

        let counts: Vec<u64> = session.chunks.iter().map(|c| c.sample_count).collect();
        assert_eq!(counts, vec![10, 10, 5]);
        assert!(session.chunks.iter().all(|c| c.closed));

        let manifest = read_manifest(&session_dir).unwrap().unwrap();
        assert!(manifest.complete);
        assert_eq!(manifest.session.total_samples, 25);

        let last = scan_chunk(&session_dir.join(chunk_file_name(2))).unwrap();
        assert!(last.is_closed());
        assert_eq!(last.first_sequence(), Some(21));
        assert_eq!(last.last_sequence(), Some(25));
    }

    #[tokio::test]
    async fn test_stream_pause_keeps_session_and_disconnect_ends_it() {
        let dir = tempdir().unwrap();
        let session_dir = dir.path().join("s2");
        let bus = SampleBus::new();

        let mut handle = start_chunking(&session_dir, session("s2"), &bus, settings(100)).unwrap();
        let mut progress = handle.progress();
        let task = handle.take_task().unwrap();

        bus.publish(batch(1..=3));
        bus.publish(BusEvent::stream_ended(StreamEndReason::Stopped));
        bus.publish(batch(4..=6));
        bus.publish(BusEvent::stream_ended(StreamEndReason::Disconnected));

        let session = task.await.unwrap();
        assert_eq!(session.end_reason, Some(EndReason::Disconnected));
        assert!(session.is_abnormal());
        assert_eq!(session.total_samples, 6);
        assert_eq!(session.markers.len(), 1);
        assert_eq!(session.markers[0].kind, MarkerKind::StreamPaused);
        assert_eq!(session.markers[0].after_sequence, 3);

        progress.wait_for(|s| !s.is_recording()).await.unwrap();

        let records = scan_chunk(&session_dir.join(chunk_file_name(0))).unwrap().records;
        assert!(matches!(records[3], ChunkRecord::Marker(_)));
        assert_eq!(records.len(), 7);
    }

    #[tokio::test]
    async fn test_unexplained_gap_is_marked() {
        let dir = tempdir().unwrap();
        let session_dir = dir.path().join("s3");
        let bus = SampleBus::new();

        let handle = start_chunking(&session_dir, session("s3"), &bus, settings(100)).unwrap();
        bus.publish(batch(1..=2));
        bus.publish(batch(10..=11));

        let session = handle.finish().await;
        assert_eq!(session.markers.len(), 1);
        assert_eq!(session.markers[0].kind, MarkerKind::Gap);
        assert_eq!(session.markers[0].after_sequence, 2);
        assert_eq!(session.chunks[0].last_sequence, Some(11));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_interval_puts_open_chunk_on_disk() {
        let dir = tempdir().unwrap();
        let session_dir = dir.path().join("s5");
        let bus = SampleBus::new();

        let mut lazy = settings(1_000);
        lazy.flush_bytes = usize::MAX;
        lazy.flush_interval = Duration::from_millis(500);
        let handle = start_chunking(&session_dir, session("s5"), &bus, lazy).unwrap();
        let mut progress = handle.progress();

        bus.publish(batch(1..=20));
        progress.wait_for(|s| s.total_samples == 20).await.unwrap();

        // Still buffered: not even the header has reached the file
        let path = session_dir.join(chunk_file_name(0));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;

        let scan = scan_chunk(&path).unwrap();
        assert!(!scan.is_closed());
        assert_eq!(scan.sample_count(), 20);
        assert_eq!(scan.last_sequence(), Some(20));
        assert_eq!(scan.trailing_bytes, 0);

        let session = handle.finish().await;
        assert_eq!(session.total_samples, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_byte_threshold_without_interval() {
        let dir = tempdir().unwrap();
        let session_dir = dir.path().join("s6");
        let bus = SampleBus::new();

        let mut eager = settings(1_000);
        eager.flush_bytes = 200;
        eager.flush_interval = Duration::from_secs(3600);
        let handle = start_chunking(&session_dir, session("s6"), &bus, eager).unwrap();
        let mut progress = handle.progress();

        bus.publish(batch(1..=12));
        progress.wait_for(|s| s.total_samples == 12).await.unwrap();

        // Everything up to the last threshold crossing is durable
        let scan = scan_chunk(&session_dir.join(chunk_file_name(0))).unwrap();
        assert!(!scan.is_closed());
        assert!(scan.sample_count() >= 5);
        assert!(scan.sample_count() < 12);
        assert_eq!(scan.first_sequence(), Some(1));

        handle.finish().await;
    }

    #[tokio::test]
    async fn test_byte_ceiling_rotates() {
        let dir = tempdir().unwrap();
        let session_dir = dir.path().join("s7");
        let bus = SampleBus::new();

        let mut small = settings(1_000);
        small.chunk_max_bytes = 2_000;
        let handle = start_chunking(&session_dir, session("s7"), &bus, small).unwrap();

        bus.publish(batch(1..=50));
        let session = handle.finish().await;

        assert_eq!(session.total_samples, 50);
        let sizes: Vec<(u64, u64)> = session
            .chunks
            .iter()
            .map(|c| (c.sample_count, c.byte_size))
            .collect();
        assert_eq!(sizes, vec![(47, 2_078), (3, 186)]);
        assert!(session.chunks.iter().all(|c| c.closed));
        assert_eq!(session.chunks[1].first_sequence, Some(48));
    }

    #[tokio::test]
    async fn test_recorder_overrun_ends_session() {
        let dir = tempdir().unwrap();
        let session_dir = dir.path().join("s4");
        let bus = SampleBus::new();

        let mut small = settings(100);
        small.queue_capacity = 2;
        let mut handle = start_chunking(&session_dir, session("s4"), &bus, small).unwrap();
        let task = handle.take_task().unwrap();

        // Publish faster than the task can run on this single-threaded runtime
        for seq in 1..=10 {
            bus.publish(batch(seq..=seq));
        }

        let session = task.await.unwrap();
        assert_eq!(session.end_reason, Some(EndReason::Overrun));
        assert_eq!(session.total_samples, 2);
        assert!(read_manifest(&session_dir).unwrap().unwrap().complete);
    }
}
