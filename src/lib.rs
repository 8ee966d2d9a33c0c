//! Neuro Notes - biosignal headset acquisition and session recording.
//!
//! This is the main library crate. It connects to an EEG headset, fans its
//! samples out to the recorder and the live view, and keeps every session
//! on disk in crash-safe chunks.

pub mod bus;
pub mod commands;
pub mod config;
pub mod device;
pub mod live;
pub mod recorder;
pub mod session;
pub mod utils;

use anyhow::Context;
use commands::AppState;
use config::Config;
use device::{SimulatedConfig, SimulatedDevice};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Run the acquisition service until Ctrl-C
pub async fn run() -> anyhow::Result<()> {
    // Initialize tracing/logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "neuro_notes=debug,neuro_notes_lib=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Neuro Notes v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env();
    tracing::info!("Storing sessions under {:?}", config.sessions_dir());

    // No vendor SDK is linked in; the simulated headset stands in for it
    let state = AppState::new(
        Arc::new(SimulatedDevice::new(SimulatedConfig::default())),
        config,
    );

    let report = state
        .sessions
        .recover()
        .context("crash recovery failed")?;
    if !report.is_empty() {
        tracing::warn!(
            "Recovered {} session(s): {} chunk(s) sealed, {} removed, {} corrupt",
            report.recovered.len(),
            report.sealed_chunks,
            report.removed_chunks,
            report.corrupt_chunks.len()
        );
    }

    let devices = state.link.discover().await.context("device scan failed")?;
    let device = devices
        .first()
        .context("no device found")?
        .id
        .clone();
    commands::device::device_connect(&state, device)
        .await
        .map_err(|e| anyhow::anyhow!(e.message))?;

    let session = state.sessions.start(None).await.context("failed to start session")?;
    tracing::info!("Recording {} - press Ctrl-C to stop", session.id);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    tracing::info!("Shutting down");
    match state.sessions.stop().await {
        Ok(session) => tracing::info!(
            "Session {} stopped with {} samples in {} chunk(s)",
            session.id,
            session.total_samples,
            session.chunks.len()
        ),
        Err(e) => tracing::warn!("Could not stop session: {}", e),
    }
    state.link.disconnect().await.context("disconnect failed")?;

    Ok(())
}
