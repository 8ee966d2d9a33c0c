//! Session directory layout
//!
//! ```text
//! <root>/sessions/<session_id>/
//!     manifest.json
//!     chunk_0000.dat
//!     chunk_0001.dat
//!     ...
//! ```
//!
//! Manifests are replaced atomically: written to a temp file, fsynced and
//! renamed over the previous version.

use crate::recorder::chunk::parse_chunk_index;
use crate::recorder::state::SessionManifest;
use crate::utils::error::StorageError;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Manifest file name inside a session directory
pub const MANIFEST_FILE: &str = "manifest.json";

const MANIFEST_TMP_FILE: &str = "manifest.json.tmp";

/// Paths of the session store
#[derive(Debug, Clone)]
pub struct SessionLayout {
    sessions_dir: PathBuf,
}

impl SessionLayout {
    pub fn new(sessions_dir: impl Into<PathBuf>) -> Self {
        Self {
            sessions_dir: sessions_dir.into(),
        }
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.sessions_dir.join(session_id)
    }

    /// Create a fresh directory for a new session. Fails if it already exists.
    pub fn create_session_dir(&self, session_id: &str) -> Result<PathBuf, StorageError> {
        fs::create_dir_all(&self.sessions_dir)?;
        let dir = self.session_dir(session_id);
        fs::create_dir(&dir)?;
        Ok(dir)
    }

    /// Ids of every session directory, oldest first
    pub fn session_ids(&self) -> Result<Vec<String>, StorageError> {
        if !self.sessions_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.sessions_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                ids.push(name.to_string());
            }
        }
        // Ids embed their start time, so lexical order is chronological
        ids.sort();
        Ok(ids)
    }
}

/// Whether `id` can safely name a directory under the sessions root
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Chunk files of a session directory, ordered by index
pub fn chunk_files(session_dir: &Path) -> Result<Vec<(u32, PathBuf)>, StorageError> {
    let mut chunks = Vec::new();
    for entry in fs::read_dir(session_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(index) = name.to_str().and_then(parse_chunk_index) {
            chunks.push((index, entry.path()));
        }
    }
    chunks.sort_by_key(|(index, _)| *index);
    Ok(chunks)
}

/// Read a session manifest. `Ok(None)` if the session has none yet.
pub fn read_manifest(session_dir: &Path) -> Result<Option<SessionManifest>, StorageError> {
    let path = session_dir.join(MANIFEST_FILE);
    if !path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(&path)?;
    let manifest: SessionManifest = serde_json::from_str(&content)?;

    Ok(Some(manifest))
}

/// Atomically replace a session manifest
pub fn write_manifest(session_dir: &Path, manifest: &SessionManifest) -> Result<(), StorageError> {
    let tmp_path = session_dir.join(MANIFEST_TMP_FILE);
    let content = serde_json::to_vec_pretty(manifest)?;

    let mut file = File::create(&tmp_path)?;
    file.write_all(&content)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp_path, session_dir.join(MANIFEST_FILE))?;

    // Persist the rename itself
    #[cfg(unix)]
    File::open(session_dir)?.sync_all()?;

    tracing::debug!(
        "Wrote manifest for {} (complete: {}, chunks: {})",
        manifest.session.id,
        manifest.complete,
        manifest.session.chunks.len()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::state::Session;
    use tempfile::tempdir;

    #[test]
    fn test_manifest_replace() {
        let dir = tempdir().unwrap();
        let layout = SessionLayout::new(dir.path().join("sessions"));
        let session_dir = layout.create_session_dir("session_a").unwrap();

        assert!(read_manifest(&session_dir).unwrap().is_none());

        let mut session = Session::new("session_a", "first");
        write_manifest(&session_dir, &SessionManifest::new(session.clone(), false)).unwrap();

        session.label = "second".to_string();
        write_manifest(&session_dir, &SessionManifest::new(session, true)).unwrap();

        let manifest = read_manifest(&session_dir).unwrap().unwrap();
        assert!(manifest.complete);
        assert_eq!(manifest.session.label, "second");
        assert!(!session_dir.join(MANIFEST_TMP_FILE).exists());
    }

    #[test]
    fn test_session_ids_and_chunk_files() {
        let dir = tempdir().unwrap();
        let layout = SessionLayout::new(dir.path().join("sessions"));
        assert!(layout.session_ids().unwrap().is_empty());

        let b = layout.create_session_dir("session_b").unwrap();
        layout.create_session_dir("session_a").unwrap();
        assert!(layout.create_session_dir("session_a").is_err());

        fs::write(b.join("chunk_0001.dat"), b"").unwrap();
        fs::write(b.join("chunk_0000.dat"), b"").unwrap();
        fs::write(b.join(MANIFEST_FILE), b"{}").unwrap();

        assert_eq!(layout.session_ids().unwrap(), vec!["session_a", "session_b"]);
        let indices: Vec<u32> = chunk_files(&b).unwrap().into_iter().map(|(i, _)| i).collect();
        assert_eq!(indices, vec![0, 1]);
    }

    #[test]
    fn test_session_id_validation() {
        assert!(is_valid_session_id("session_20240101_120000_deadbeef"));
        assert!(!is_valid_session_id("../etc"));
        assert!(!is_valid_session_id("a/b"));
        assert!(!is_valid_session_id(""));
    }
}
