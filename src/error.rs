//! Error types for the pathlight engine.

use thiserror::Error;

/// Main error type for engine operations.
///
/// Device and structure-build failures are fatal and propagate up
/// unchanged. [`Error::UnknownProgram`] is the one recoverable case:
/// the pipeline-reload path catches it and keeps the previous working
/// dispatch table. Degenerate inputs (empty mesh or light lists) are
/// documented no-ops, not errors.
#[derive(Error, Debug)]
pub enum Error {
    /// Unrecoverable device or driver condition
    #[error("Device error: {0}")]
    Device(String),

    /// Buffer allocation was rejected by the device
    #[error("Buffer allocation failed: {label} ({size} bytes)")]
    AllocationFailed { label: String, size: u64 },

    /// Dispatch-table generation referenced a program name with no
    /// matching compiled export
    #[error("Unknown program in dispatch table: {0}")]
    UnknownProgram(String),

    /// Dispatch-table generation was attempted without a
    /// ray-generation program
    #[error("Dispatch table has no ray-generation program")]
    MissingRayGen,

    /// Geometry description violated a build contract
    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    /// CPU access to a buffer that is not host-visible
    #[error("Buffer is not CPU-visible: {0}")]
    NotCpuVisible(String),

    /// Out-of-bounds buffer access
    #[error("Access of {len} bytes at offset {offset} exceeds buffer {label} ({size} bytes)")]
    OutOfBounds {
        label: String,
        offset: u64,
        len: u64,
        size: u64,
    },

    /// An iteration was requested before a scene was set
    #[error("No scene is bound to the path tracer")]
    NoScene,
}

impl Error {
    /// Create a device error from a string.
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device(msg.into())
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
