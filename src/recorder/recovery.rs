//! Crash recovery
//!
//! Runs once at process start, before any new session. A session whose
//! manifest is missing or still marked incomplete was cut off mid-recording:
//! its open chunk is cut back to the last intact record and sealed, and a
//! complete manifest is synthesized from what the chunks actually hold.

use super::chunk::{scan_chunk, seal_chunk, ChunkRecord};
use super::state::{EndReason, MarkerRef, Session, SessionManifest, SessionState};
use crate::session::layout::{chunk_files, read_manifest, write_manifest, SessionLayout};
use crate::utils::error::StorageError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::Path;

/// What a recovery pass did
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    /// Sessions that were abnormally terminated and now have a manifest
    pub recovered: Vec<String>,
    /// Open chunks cut back and closed
    pub sealed_chunks: usize,
    /// Chunks with no usable header, removed
    pub removed_chunks: usize,
    /// Closed chunks that fail their integrity check, left untouched
    pub corrupt_chunks: Vec<String>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.recovered.is_empty()
    }
}

/// Recover every abnormally terminated session under `layout`
pub fn recover_sessions(layout: &SessionLayout) -> Result<RecoveryReport, StorageError> {
    let mut report = RecoveryReport::default();

    for id in layout.session_ids()? {
        let dir = layout.session_dir(&id);
        match recover_session(&dir, &mut report) {
            Ok(Some(session)) => {
                tracing::info!(
                    "Recovered session {}: {} samples in {} chunks",
                    session.id,
                    session.total_samples,
                    session.chunks.len()
                );
                report.recovered.push(session.id);
            }
            Ok(None) => {}
            Err(e) => {
                // One unreadable session must not block the others
                tracing::error!("Failed to recover session {}: {}", id, e);
            }
        }
    }

    Ok(report)
}

/// Recover one session directory. Returns `None` if it was complete.
pub fn recover_session(
    session_dir: &Path,
    report: &mut RecoveryReport,
) -> Result<Option<Session>, StorageError> {
    let manifest = read_manifest(session_dir)?;
    if manifest.as_ref().map(|m| m.complete).unwrap_or(false) {
        return Ok(None);
    }

    let id = session_dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();

    tracing::warn!("Session {} was not closed cleanly, recovering", id);

    let mut session = match manifest {
        Some(manifest) => manifest.session,
        None => {
            let mut session = Session::new(id.clone(), String::new());
            if let Some(created) = modified_at(session_dir) {
                session.started_at = created;
            }
            session
        }
    };

    let mut chunks = Vec::new();
    let mut markers = Vec::new();
    let mut last_write = None;
    let mut error = None;

    for (index, path) in chunk_files(session_dir)? {
        let scan = match scan_chunk(&path) {
            Ok(scan) => scan,
            Err(StorageError::InvalidChunk(reason)) => {
                tracing::warn!("Removing unreadable chunk {:?}: {}", path, reason);
                fs::remove_file(&path)?;
                report.removed_chunks += 1;
                continue;
            }
            Err(e) => return Err(e),
        };

        if scan.header.channel_count > 0 {
            session.channel_count = scan.header.channel_count;
        }

        for record in &scan.records {
            if let ChunkRecord::Marker(marker) = record {
                markers.push(MarkerRef {
                    kind: marker.kind,
                    after_sequence: marker.after_sequence,
                    chunk_index: index,
                    recorded_at: DateTime::<Utc>::from_timestamp_millis(marker.wall_clock_ms)
                        .unwrap_or_else(Utc::now),
                });
            }
        }

        let chunk = if scan.is_closed() {
            scan.to_chunk_ref()
        } else if let Some(footer) = scan.footer.or(scan.tail_footer) {
            tracing::error!(
                "Chunk {:?} is closed but fails its integrity check; leaving it untouched",
                path
            );
            report.corrupt_chunks.push(format!("{}/{}", id, index));
            error.get_or_insert_with(|| format!("chunk {} failed its integrity check", index));
            let mut chunk = scan.to_chunk_ref();
            chunk.sample_count = footer.sample_count;
            chunk.checksum = footer.digest;
            chunk.byte_size = fs::metadata(&path)?.len();
            chunk.closed = true;
            chunk
        } else {
            report.sealed_chunks += 1;
            seal_chunk(&path, &scan)?
        };

        if let Some(modified) = modified_at(&path) {
            last_write = Some(last_write.map_or(modified, |t: DateTime<Utc>| t.max(modified)));
        }
        chunks.push(chunk);
    }

    let ended_at = last_write.unwrap_or(session.started_at);
    session.total_samples = chunks.iter().map(|c| c.sample_count).sum();
    session.chunks = chunks;
    session.markers = markers;
    session.state = SessionState::Stopped;
    session.ended_at = Some(ended_at);
    session.duration_ms = Some((ended_at - session.started_at).num_milliseconds().max(0) as u64);
    session.end_reason = Some(EndReason::Recovered);
    if session.error.is_none() {
        session.error = error;
    }

    write_manifest(session_dir, &SessionManifest::new(session.clone(), true))?;

    Ok(Some(session))
}

fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Sample;
    use crate::recorder::chunk::{chunk_file_name, ChunkWriter};
    use std::fs::OpenOptions;
    use tempfile::tempdir;

    fn sample(seq: u64) -> Sample {
        Sample {
            sequence: seq,
            timestamp_us: seq * 4_000,
            values: vec![1.0, 2.0, 3.0, 4.0],
        }
    }

    #[test]
    fn test_recovers_truncated_open_chunk() {
        let dir = tempdir().unwrap();
        let layout = SessionLayout::new(dir.path());
        let session_dir = layout.create_session_dir("session_crashed").unwrap();

        let mut session = Session::new("session_crashed", "night");
        session.channel_count = 4;
        write_manifest(&session_dir, &SessionManifest::new(session.clone(), false)).unwrap();

        // Chunk 0 closed, chunk 1 left open by the crash
        let mut first = ChunkWriter::create(&session_dir.join(chunk_file_name(0)), 0, 4).unwrap();
        for seq in 1..=5 {
            first.append_sample(&sample(seq)).unwrap();
        }
        first.close().unwrap();
        {
            let mut open = ChunkWriter::create(&session_dir.join(chunk_file_name(1)), 1, 4).unwrap();
            for seq in 6..=9 {
                open.append_sample(&sample(seq)).unwrap();
            }
        }
        let open_path = session_dir.join(chunk_file_name(1));
        let len = fs::metadata(&open_path).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&open_path)
            .unwrap()
            .set_len(len - 3)
            .unwrap();

        let report = recover_sessions(&layout).unwrap();
        assert_eq!(report.recovered, vec!["session_crashed"]);
        assert_eq!(report.sealed_chunks, 1);

        let manifest = read_manifest(&session_dir).unwrap().unwrap();
        assert!(manifest.complete);
        assert_eq!(manifest.session.end_reason, Some(EndReason::Recovered));
        assert_eq!(manifest.session.label, "night");
        assert_eq!(manifest.session.total_samples, 8);
        assert_eq!(manifest.session.last_sequence(), Some(8));
        assert!(manifest.session.chunks.iter().all(|c| c.closed));

        // A second pass finds nothing to do
        let again = recover_sessions(&layout).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_missing_manifest_and_empty_chunk() {
        let dir = tempdir().unwrap();
        let layout = SessionLayout::new(dir.path());
        let session_dir = layout.create_session_dir("session_bare").unwrap();

        // Crash between creating the file and writing its header
        fs::write(session_dir.join(chunk_file_name(0)), b"NNCH").unwrap();

        let report = recover_sessions(&layout).unwrap();
        assert_eq!(report.recovered, vec!["session_bare"]);
        assert_eq!(report.removed_chunks, 1);
        assert!(!session_dir.join(chunk_file_name(0)).exists());

        let manifest = read_manifest(&session_dir).unwrap().unwrap();
        assert_eq!(manifest.session.id, "session_bare");
        assert_eq!(manifest.session.total_samples, 0);
        assert!(manifest.session.chunks.is_empty());
    }

    #[test]
    fn test_complete_sessions_are_skipped() {
        let dir = tempdir().unwrap();
        let layout = SessionLayout::new(dir.path());
        let session_dir = layout.create_session_dir("session_done").unwrap();

        let mut session = Session::new("session_done", "");
        session.end(EndReason::Completed, None);
        write_manifest(&session_dir, &SessionManifest::new(session, true)).unwrap();

        let report = recover_sessions(&layout).unwrap();
        assert!(report.is_empty());
        let manifest = read_manifest(&session_dir).unwrap().unwrap();
        assert_eq!(manifest.session.end_reason, Some(EndReason::Completed));
    }
}
