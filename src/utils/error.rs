//! Error types and handling
//!
//! Common error types used across the acquisition pipeline, plus the
//! response shape handed to the web layer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a device connection attempt failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionFailure {
    #[error("connection timed out")]
    Timeout,

    #[error("device rejected the connection: {0}")]
    Rejected(String),

    #[error("radio is busy")]
    RadioBusy,

    #[error("device {0} was not found in the last scan")]
    UnknownDevice(String),
}

/// Errors reported by a vendor device capability
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("adapter fault: {0}")]
    Adapter(String),

    #[error(transparent)]
    Connection(#[from] ConnectionFailure),

    #[error("stream rejected: {0}")]
    StreamRejected(String),

    #[error("device is not connected")]
    NotConnected,
}

/// Storage-side errors: chunk files, manifests, session directories
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid chunk file: {0}")]
    InvalidChunk(String),

    #[error("Chunk {index} is already closed")]
    ChunkClosed { index: u32 },
}

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("Connection error: {0}")]
    Connection(ConnectionFailure),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("State conflict: {0}")]
    StateConflict(String),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl AppError {
    /// HTTP-style status code for the web layer
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::StateConflict(_) => 409,
            AppError::NotFound(_) => 404,
            AppError::Storage(_) => 500,
            AppError::Discovery(_)
            | AppError::Connection(_)
            | AppError::Stream(_)
            | AppError::DeviceUnavailable(_) => 503,
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(error: std::io::Error) -> Self {
        AppError::Storage(StorageError::Io(error))
    }
}

/// Error response for the web layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub status: u16,
    pub code: String,
    pub message: String,
}

impl From<AppError> for ErrorResponse {
    fn from(error: AppError) -> Self {
        let code = match &error {
            AppError::Discovery(_) => "DISCOVERY_ERROR",
            AppError::Connection(_) => "CONNECTION_ERROR",
            AppError::Stream(_) => "STREAM_ERROR",
            AppError::Storage(_) => "STORAGE_ERROR",
            AppError::StateConflict(_) => "STATE_CONFLICT",
            AppError::DeviceUnavailable(_) => "DEVICE_UNAVAILABLE",
            AppError::NotFound(_) => "NOT_FOUND",
        };

        ErrorResponse {
            status: error.status_code(),
            code: code.to_string(),
            message: error.to_string(),
        }
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;
