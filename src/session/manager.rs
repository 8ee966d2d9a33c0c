//! Session manager
//!
//! Coordinates the session lifecycle and owns the session store. At most one
//! session records at a time; `start` reserves the slot with a synchronous
//! compare-and-transition so concurrent callers cannot both win.

use super::export::export_session_csv;
use super::layout::{is_valid_session_id, read_manifest, write_manifest, SessionLayout};
use crate::bus::SampleBus;
use crate::config::Config;
use crate::device::DeviceLink;
use crate::recorder::recovery::{recover_session, recover_sessions, RecoveryReport};
use crate::recorder::state::{EndReason, Session, SessionManifest, SessionState};
use crate::recorder::writer::{start_chunking, RecorderHandle, RecorderSettings};
use crate::utils::error::{AppError, AppResult};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Session lifecycle events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    Started { session: Session },
    Stopped { session: Session },
    Renamed { id: String, label: String },
}

/// Current session state for the web layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub state: SessionState,
    pub session: Option<Session>,
}

impl SessionStatus {
    fn idle() -> Self {
        Self {
            state: SessionState::Idle,
            session: None,
        }
    }
}

struct ActiveSession {
    handle: RecorderHandle,
    /// Label change requested while recording, applied at stop
    pending_label: Option<String>,
}

enum Slot {
    Idle,
    /// Reserved by a `start` that is still setting up
    Starting,
    Recording(ActiveSession),
    Stopped(Session),
}

struct ManagerInner {
    link: DeviceLink,
    layout: SessionLayout,
    settings: RecorderSettings,
    slot: Mutex<Slot>,
    status_tx: watch::Sender<SessionStatus>,
    event_tx: broadcast::Sender<SessionEvent>,
}

/// Owns session lifecycle and storage
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn new(link: DeviceLink, config: &Config) -> Self {
        let (status_tx, _) = watch::channel(SessionStatus::idle());
        let (event_tx, _) = broadcast::channel(100);
        Self {
            inner: Arc::new(ManagerInner {
                link,
                layout: SessionLayout::new(config.sessions_dir()),
                settings: RecorderSettings::from(config),
                slot: Mutex::new(Slot::Idle),
                status_tx,
                event_tx,
            }),
        }
    }

    pub fn layout(&self) -> &SessionLayout {
        &self.inner.layout
    }

    fn bus(&self) -> &SampleBus {
        self.inner.link.bus()
    }

    /// Subscribe to session lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Current state, with a live snapshot while recording
    pub fn status(&self) -> SessionStatus {
        match &*self.inner.slot.lock() {
            Slot::Idle | Slot::Starting => SessionStatus::idle(),
            Slot::Recording(active) => SessionStatus {
                state: SessionState::Recording,
                session: Some(active.handle.snapshot()),
            },
            Slot::Stopped(session) => SessionStatus {
                state: SessionState::Stopped,
                session: Some(session.clone()),
            },
        }
    }

    /// Seal and close sessions left open by a crash. Refused while recording.
    pub fn recover(&self) -> AppResult<RecoveryReport> {
        if matches!(&*self.inner.slot.lock(), Slot::Starting | Slot::Recording(_)) {
            return Err(AppError::StateConflict(
                "cannot recover while a session is recording".to_string(),
            ));
        }
        Ok(recover_sessions(&self.inner.layout)?)
    }

    /// Start a new recording session
    pub async fn start(&self, label: Option<String>) -> AppResult<Session> {
        let device = self.inner.link.status();
        if !device.state.is_available() {
            return Err(AppError::DeviceUnavailable(format!(
                "device is {:?}",
                device.state
            )));
        }

        let previous = {
            let mut slot = self.inner.slot.lock();
            if matches!(&*slot, Slot::Starting | Slot::Recording(_)) {
                return Err(AppError::StateConflict(
                    "a session is already recording".to_string(),
                ));
            }
            std::mem::replace(&mut *slot, Slot::Starting)
        };

        let id = new_session_id();
        let mut session = Session::new(id.clone(), label.unwrap_or_default());
        if let Some(descriptor) = &device.device {
            session.channel_count = descriptor.channel_count();
            session.channel_labels = descriptor.channel_labels.clone();
        }

        let started = self
            .inner
            .layout
            .create_session_dir(&id)
            .and_then(|dir| {
                start_chunking(&dir, session.clone(), self.bus(), self.inner.settings.clone())
                    .map(|handle| (dir, handle))
            });

        let (dir, mut handle) = match started {
            Ok(started) => started,
            Err(e) => {
                tracing::error!("Failed to start session {}: {}", id, e);
                let dir = self.inner.layout.session_dir(&id);
                if dir.is_dir() {
                    let _ = std::fs::remove_dir_all(&dir);
                }
                *self.inner.slot.lock() = previous;
                return Err(e.into());
            }
        };

        let task = handle.take_task();
        *self.inner.slot.lock() = Slot::Recording(ActiveSession {
            handle,
            pending_label: None,
        });
        self.inner.status_tx.send_replace(SessionStatus {
            state: SessionState::Recording,
            session: Some(session.clone()),
        });
        let _ = self.inner.event_tx.send(SessionEvent::Started {
            session: session.clone(),
        });

        if let Some(task) = task {
            tokio::spawn(supervise(self.inner.clone(), id.clone(), dir, task));
        }

        tracing::info!("Session {} started", id);
        Ok(session)
    }

    /// Stop the current session. Stopping a stopped session returns it again.
    pub async fn stop(&self) -> AppResult<Session> {
        let id = match &*self.inner.slot.lock() {
            Slot::Idle => {
                return Err(AppError::StateConflict("no session is recording".to_string()))
            }
            Slot::Starting => {
                return Err(AppError::StateConflict("session is still starting".to_string()))
            }
            Slot::Stopped(session) => return Ok(session.clone()),
            Slot::Recording(active) => {
                active.handle.stop();
                active.handle.session_id().to_string()
            }
        };

        tracing::info!("Stopping session {}", id);

        let mut status = self.inner.status_tx.subscribe();
        let stopped = status
            .wait_for(|s| {
                s.state == SessionState::Stopped
                    && s.session.as_ref().map(|x| x.id == id).unwrap_or(false)
            })
            .await
            .map(|s| s.session.clone());

        match stopped {
            Ok(Some(session)) => Ok(session),
            _ => Err(AppError::StateConflict(format!(
                "session {} did not stop",
                id
            ))),
        }
    }

    /// Rename a session. While recording, the label is applied at stop.
    pub fn rename(&self, id: &str, label: impl Into<String>) -> AppResult<Session> {
        let label = label.into();

        let session = {
            let mut slot = self.inner.slot.lock();
            match &mut *slot {
                Slot::Recording(active) if active.handle.session_id() == id => {
                    active.pending_label = Some(label.clone());
                    let mut snapshot = active.handle.snapshot();
                    snapshot.label = label.clone();
                    Some(snapshot)
                }
                Slot::Stopped(session) if session.id == id => {
                    session.label = label.clone();
                    let dir = self.inner.layout.session_dir(id);
                    write_manifest(&dir, &SessionManifest::new(session.clone(), true))?;
                    Some(session.clone())
                }
                _ => None,
            }
        };

        let session = match session {
            Some(session) => session,
            None => {
                let dir = self.session_dir(id)?;
                let mut manifest = read_manifest(&dir)?
                    .ok_or_else(|| AppError::NotFound(format!("session {}", id)))?;
                manifest.session.label = label.clone();
                write_manifest(&dir, &manifest)?;
                manifest.session
            }
        };

        tracing::info!("Session {} renamed to {:?}", id, label);
        let _ = self.inner.event_tx.send(SessionEvent::Renamed {
            id: id.to_string(),
            label,
        });
        Ok(session)
    }

    /// Every stored session, newest first
    pub fn list_sessions(&self) -> AppResult<Vec<Session>> {
        let live = self.status().session.filter(|s| s.is_recording());

        let mut sessions = Vec::new();
        for id in self.inner.layout.session_ids()? {
            if let Some(live) = live.as_ref().filter(|s| s.id == id) {
                sessions.push(live.clone());
                continue;
            }
            match read_manifest(&self.inner.layout.session_dir(&id)) {
                Ok(Some(manifest)) => sessions.push(manifest.session),
                Ok(None) => tracing::debug!("Session {} has no manifest yet", id),
                Err(e) => tracing::warn!("Skipping unreadable session {}: {}", id, e),
            }
        }
        sessions.reverse();
        Ok(sessions)
    }

    /// Load a stored session
    pub fn load_session(&self, id: &str) -> AppResult<Session> {
        if let Some(session) = self.status().session.filter(|s| s.id == id) {
            return Ok(session);
        }
        let dir = self.session_dir(id)?;
        read_manifest(&dir)?
            .map(|m| m.session)
            .ok_or_else(|| AppError::NotFound(format!("session {}", id)))
    }

    /// Export a stopped session to CSV. Defaults to `<session dir>/<id>.csv`.
    pub fn export_csv(&self, id: &str, output: Option<PathBuf>) -> AppResult<PathBuf> {
        let session = self.load_session(id)?;
        if session.is_recording() {
            return Err(AppError::StateConflict(format!(
                "session {} is still recording",
                id
            )));
        }
        let dir = self.session_dir(id)?;
        let output = output.unwrap_or_else(|| dir.join(format!("{}.csv", id)));
        export_session_csv(&dir, &session, &output)?;
        Ok(output)
    }

    fn session_dir(&self, id: &str) -> AppResult<PathBuf> {
        let dir = self.inner.layout.session_dir(id);
        if !is_valid_session_id(id) || !dir.is_dir() {
            return Err(AppError::NotFound(format!("session {}", id)));
        }
        Ok(dir)
    }
}

/// `session_<YYYYmmdd_HHMMSS>_<8 hex>`
fn new_session_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "session_{}_{}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        &suffix[..8]
    )
}

/// Wait for the recorder task and finalize its session
async fn supervise(inner: Arc<ManagerInner>, id: String, dir: PathBuf, task: JoinHandle<Session>) {
    let mut session = match task.await {
        Ok(session) => session,
        Err(e) => {
            tracing::error!("Recorder for session {} failed: {}", id, e);
            recovered_after_failure(&dir, &id, &e.to_string())
        }
    };

    let pending_label = match &mut *inner.slot.lock() {
        Slot::Recording(active) if active.handle.session_id() == id => active.pending_label.take(),
        _ => None,
    };
    if let Some(label) = pending_label {
        session.label = label;
    }

    if let Err(e) = write_manifest(&dir, &SessionManifest::new(session.clone(), true)) {
        tracing::error!("Failed to finalize manifest for {}: {}", id, e);
        if session.error.is_none() {
            session.error = Some(e.to_string());
        }
    }

    if session.is_abnormal() {
        tracing::warn!(
            "Session {} ended abnormally: {:?}{}",
            id,
            session.end_reason,
            session
                .error
                .as_deref()
                .map(|e| format!(" ({})", e))
                .unwrap_or_default()
        );
    }

    *inner.slot.lock() = Slot::Stopped(session.clone());
    inner.status_tx.send_replace(SessionStatus {
        state: SessionState::Stopped,
        session: Some(session.clone()),
    });
    let _ = inner.event_tx.send(SessionEvent::Stopped { session });
}

/// The recorder died without finishing: seal what it left on disk
fn recovered_after_failure(dir: &Path, id: &str, reason: &str) -> Session {
    let mut report = RecoveryReport::default();
    let mut session = match recover_session(dir, &mut report) {
        Ok(Some(session)) => session,
        Ok(None) => read_manifest(dir)
            .ok()
            .flatten()
            .map(|m| m.session)
            .unwrap_or_else(|| Session::new(id, "")),
        Err(e) => {
            tracing::error!("Could not seal session {}: {}", id, e);
            Session::new(id, "")
        }
    };
    if session.is_recording() {
        session.end(EndReason::StorageFailure, None);
    }
    session.error = Some(format!("recorder task failed: {}", reason));
    session
}
