//! Error types for the masking controller.
//!
//! Pure functions reject malformed data with [`Error::InvalidInput`];
//! hardware-boundary failures surface as [`CaptureError`] / [`RenderError`]
//! and are never retried inside the loop.

use thiserror::Error;

use crate::control_loop::LoopState;

/// Failure reported by an audio capture device.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("capture timed out after {0} ms")]
    Timeout(u64),

    #[error("capture stream error: {0}")]
    Stream(String),

    /// Offline source ran out of samples.
    #[error("capture source exhausted")]
    Exhausted,
}

/// Failure reported by an audio render device.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RenderError {
    #[error("render device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("render timed out after {0} ms")]
    Timeout(u64),

    #[error("render stream error: {0}")]
    Stream(String),
}

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed data handed to a pure function (empty buffer, non-finite value)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Invalid configuration detected at startup
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Render(#[from] RenderError),

    /// Operation not allowed in the loop's current state
    #[error("cannot {0} while control loop is {1:?}")]
    InvalidState(&'static str, LoopState),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
