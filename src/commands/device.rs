//! Device commands

use super::AppState;
use crate::device::{DeviceDescriptor, DeviceStatus};
use crate::utils::error::{AppError, ConnectionFailure, ErrorResponse};

/// Scan for nearby devices
pub async fn scan_devices(state: &AppState) -> Result<Vec<DeviceDescriptor>, ErrorResponse> {
    Ok(state.link.discover().await?)
}

/// Connect to a device and start streaming from it.
///
/// A device that was not in the last scan triggers one fresh scan before
/// giving up.
pub async fn device_connect(state: &AppState, device_id: String) -> Result<DeviceStatus, ErrorResponse> {
    tracing::info!("Connect requested for {}", device_id);

    match state.link.connect(&device_id).await {
        Ok(_) => {}
        Err(AppError::Connection(ConnectionFailure::UnknownDevice(_))) => {
            state.link.discover().await?;
            state.link.connect(&device_id).await?;
        }
        Err(e) => return Err(e.into()),
    }

    state.link.start_stream().await?;
    Ok(state.link.status())
}

/// Disconnect the device. Safe to call in any state.
pub async fn device_disconnect(state: &AppState) -> Result<DeviceStatus, ErrorResponse> {
    state.link.disconnect().await?;
    Ok(state.link.status())
}

/// Current device status
pub async fn device_status(state: &AppState) -> Result<DeviceStatus, ErrorResponse> {
    Ok(state.link.status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::device::{ConnectionState, SimulatedConfig, SimulatedDevice, SIMULATED_DEVICE_ID};
    use std::sync::Arc;
    use std::time::Duration;

    fn app(config: SimulatedConfig) -> AppState {
        AppState::new(
            Arc::new(SimulatedDevice::new(config)),
            Config::default().scan_duration(Duration::from_millis(100)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_scans_and_streams() {
        let state = app(SimulatedConfig::default());

        let status = device_connect(&state, SIMULATED_DEVICE_ID.to_string())
            .await
            .unwrap();
        assert_eq!(status.state, ConnectionState::Streaming);
        assert_eq!(status.device.unwrap().channel_labels.len(), 4);

        let status = device_disconnect(&state).await.unwrap();
        assert_eq!(status.state, ConnectionState::Disconnected);
        // Idempotent
        assert!(device_disconnect(&state).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_device_is_unavailable() {
        let state = app(SimulatedConfig::default());

        let err = device_connect(&state, "nope".to_string()).await.unwrap_err();
        assert_eq!(err.status, 503);
        assert_eq!(err.code, "CONNECTION_ERROR");
        assert_eq!(
            device_status(&state).await.unwrap().state,
            ConnectionState::Disconnected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_fault_maps_to_discovery_error() {
        let state = app(SimulatedConfig::default().discovery_fault("adapter off"));

        let err = scan_devices(&state).await.unwrap_err();
        assert_eq!(err.status, 503);
        assert_eq!(err.code, "DISCOVERY_ERROR");
    }
}
