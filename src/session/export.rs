//! CSV export of a recorded session
//!
//! One row per sample in sequence order, with marker rows interleaved where
//! they were recorded:
//!
//! ```text
//! sequence,timestamp_us,O1,O2,T3,T4,marker
//! 1,4000,12.5,-3.25,0.5,8,
//! 500,2000000,,,,,disconnect
//! ```

use crate::recorder::chunk::{scan_chunk, ChunkRecord};
use crate::recorder::state::{MarkerKind, Session};
use crate::utils::error::StorageError;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

fn marker_name(kind: MarkerKind) -> &'static str {
    match kind {
        MarkerKind::Disconnect => "disconnect",
        MarkerKind::StreamPaused => "stream-paused",
        MarkerKind::Gap => "gap",
    }
}

fn column_names(session: &Session, channels: usize) -> Vec<String> {
    if session.channel_labels.len() == channels {
        session.channel_labels.clone()
    } else {
        (0..channels).map(|i| format!("ch_{}", i)).collect()
    }
}

/// Write every intact record of the session's chunks to `output`.
/// Returns the number of sample rows written.
pub fn export_session_csv(
    session_dir: &Path,
    session: &Session,
    output: &Path,
) -> Result<u64, StorageError> {
    let channels = session.channel_count as usize;
    let mut out = BufWriter::new(File::create(output)?);

    let mut header = vec!["sequence".to_string(), "timestamp_us".to_string()];
    header.extend(column_names(session, channels));
    header.push("marker".to_string());
    writeln!(out, "{}", header.join(","))?;

    let empty_values = ",".repeat(channels);
    let mut rows = 0u64;

    for chunk in &session.chunks {
        let scan = scan_chunk(&session_dir.join(&chunk.file_name))?;
        for record in &scan.records {
            match record {
                ChunkRecord::Sample(sample) => {
                    write!(out, "{},{}", sample.sequence, sample.timestamp_us)?;
                    for value in &sample.values {
                        write!(out, ",{}", value)?;
                    }
                    // Pad short samples so every row has the same width
                    for _ in sample.values.len()..channels {
                        write!(out, ",")?;
                    }
                    writeln!(out, ",")?;
                    rows += 1;
                }
                ChunkRecord::Marker(marker) => {
                    writeln!(
                        out,
                        "{},{}{},{}",
                        marker.after_sequence,
                        marker.timestamp_us,
                        empty_values,
                        marker_name(marker.kind)
                    )?;
                }
            }
        }
    }

    out.flush()?;
    tracing::info!(
        "Exported session {} ({} samples) to {:?}",
        session.id,
        rows,
        output
    );
    Ok(rows)
}
