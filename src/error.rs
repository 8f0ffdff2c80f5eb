//! Custom error types for the application.
//!
//! This module defines the primary error type, `VrError`, for the entire
//! application. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of errors that can occur,
//! from I/O and configuration issues to hardware and data-integrity problems.
//!
//! ## Error Taxonomy
//!
//! `VrError` variants fall into three groups with distinct handling policies:
//!
//! - **Fatal**: `InsufficientCores`, `ChecksumMismatch`, `CueDecomposition`
//!   and `MixedLogDirectory` abort the current operation outright. They are
//!   never silently retried because retrying cannot change the outcome and
//!   continuing risks misaligned or corrupted data.
//! - **Recoverable**: `Hardware`, `Renderer` and `HeartbeatLost` faults that
//!   occur mid-runtime are intercepted by the state machine, converted into a
//!   paused state plus an operator prompt, and only escalate to termination
//!   on explicit operator choice.
//! - **Retry-safe**: every preprocessing/transfer error leaves the session
//!   tree in a state where re-invoking the same entry point resumes the
//!   pipeline; no manual data surgery is ever required.
//!
//! By using `#[from]`, `VrError` can be seamlessly created from underlying
//! error types, simplifying error handling throughout the application with
//! the `?` operator.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, VrError>;

#[derive(Error, Debug)]
pub enum VrError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session artifact error: {0}")]
    Artifact(#[from] serde_yaml::Error),

    #[error("Message payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Hardware error: {0}")]
    Hardware(String),

    #[error("Serial port not connected")]
    SerialPortNotConnected,

    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,

    #[error("Task renderer error: {0}")]
    Renderer(String),

    #[error("No response on topic '{topic}' within {timeout:?}")]
    RendererTimeout { topic: String, timeout: Duration },

    #[error(
        "Host has {available} logical cores but the runtime requires at least {required}. \
         Acquisition cannot start on this machine."
    )]
    InsufficientCores { required: usize, available: usize },

    #[error("No imaging frame pulse observed for {silent_for:?}")]
    HeartbeatLost { silent_for: Duration },

    #[error("Checksum mismatch at {}: expected {expected}, computed {actual}", .destination.display())]
    ChecksumMismatch {
        destination: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("Cue sequence decomposition failed: {0}")]
    CueDecomposition(String),

    #[error(
        "Log directory {} mixes compressed and uncompressed entries; refusing to compact an \
         ambiguous directory",
        .0.display()
    )]
    MixedLogDirectory(PathBuf),

    #[error("Image stack error: {0}")]
    Stack(#[from] tiff::TiffError),

    #[error("Required artifact missing: {}", .0.display())]
    MissingArtifact(PathBuf),

    #[error("Runtime aborted by operator request")]
    AbortedByOperator,

    #[error("Shutdown finished with errors")]
    ShutdownFailed(Vec<VrError>),
}
