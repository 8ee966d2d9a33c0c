//! Session commands

use super::AppState;
use crate::live::LiveClient;
use crate::recorder::state::Session;
use crate::session::SessionStatus;
use crate::utils::error::ErrorResponse;
use std::path::PathBuf;

/// Start a new recording session
pub async fn start_session(state: &AppState, label: Option<String>) -> Result<Session, ErrorResponse> {
    Ok(state.sessions.start(label).await?)
}

/// Stop the current session
pub async fn stop_session(state: &AppState) -> Result<Session, ErrorResponse> {
    Ok(state.sessions.stop().await?)
}

/// Current session state with a live snapshot while recording
pub async fn session_status(state: &AppState) -> Result<SessionStatus, ErrorResponse> {
    Ok(state.sessions.status())
}

/// Attach a live view client. The feed is subscribed while the client lives.
pub async fn live_samples(state: &AppState) -> Result<LiveClient, ErrorResponse> {
    Ok(state.live.attach())
}

/// Every stored session, newest first
pub async fn list_sessions(state: &AppState) -> Result<Vec<Session>, ErrorResponse> {
    Ok(state.sessions.list_sessions()?)
}

/// Change a session's label
pub async fn rename_session(
    state: &AppState,
    session_id: String,
    label: String,
) -> Result<Session, ErrorResponse> {
    Ok(state.sessions.rename(&session_id, label)?)
}

/// Export a stopped session to CSV and return the written path
pub async fn export_session_csv(
    state: &AppState,
    session_id: String,
    output: Option<String>,
) -> Result<String, ErrorResponse> {
    let sessions = state.sessions.clone();
    let output = output.map(PathBuf::from);

    // Chunk reads are blocking file I/O
    let path = tokio::task::spawn_blocking(move || sessions.export_csv(&session_id, output))
        .await
        .map_err(|e| ErrorResponse {
            status: 500,
            code: "EXPORT_FAILED".to_string(),
            message: e.to_string(),
        })??;

    Ok(path.to_string_lossy().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::device::device_connect;
    use crate::config::Config;
    use crate::device::{SimulatedConfig, SimulatedDevice, SIMULATED_DEVICE_ID};
    use crate::live::LiveMessage;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    fn app(root: &std::path::Path) -> AppState {
        AppState::new(
            Arc::new(SimulatedDevice::new(SimulatedConfig::default().total_packets(100))),
            Config::default()
                .storage_root(root)
                .scan_duration(Duration::from_millis(100)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_without_device_is_503() {
        let dir = tempdir().unwrap();
        let state = app(dir.path());

        let err = start_session(&state, None).await.unwrap_err();
        assert_eq!(err.status, 503);
        assert_eq!(err.code, "DEVICE_UNAVAILABLE");

        let err = stop_session(&state).await.unwrap_err();
        assert_eq!(err.status, 409);
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_rename_export() {
        let dir = tempdir().unwrap();
        let state = app(dir.path());
        device_connect(&state, SIMULATED_DEVICE_ID.to_string())
            .await
            .unwrap();

        let mut live = live_samples(&state).await.unwrap();
        assert!(matches!(live.next().await, Some(LiveMessage::Snapshot { .. })));

        let session = start_session(&state, Some("calm".into())).await.unwrap();
        assert_eq!(start_session(&state, None).await.unwrap_err().status, 409);

        // The simulated device runs out after 100 packets at 250 Hz
        tokio::time::sleep(Duration::from_secs(1)).await;
        let stopped = stop_session(&state).await.unwrap();
        assert!(stopped.total_samples > 0);
        assert!(stopped.total_samples <= 100);

        let renamed = rename_session(&state, session.id.clone(), "calm evening".into())
            .await
            .unwrap();
        assert_eq!(renamed.label, "calm evening");

        let listed = list_sessions(&state).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].label, "calm evening");

        let path = export_session_csv(&state, session.id.clone(), None)
            .await
            .unwrap();
        let csv = std::fs::read_to_string(&path).unwrap();
        assert!(csv.starts_with("sequence,timestamp_us,O1,O2,T3,T4,marker"));
        assert_eq!(csv.lines().count() as u64, stopped.total_samples + 1);

        let err = export_session_csv(&state, "missing".into(), None)
            .await
            .unwrap_err();
        assert_eq!(err.status, 404);

        assert_eq!(
            session_status(&state).await.unwrap().session.unwrap().id,
            session.id
        );
    }
}
