//! Custom error types for the acquisition scheduler.
//!
//! This module defines the primary error type, `AcqError`, used throughout the crate.
//! Using the `thiserror` crate, it gives every failure that can end an acquisition run
//! a distinct variant, so callers can branch on the kind while observers still receive a
//! single human-readable message.
//!
//! ## Error Hierarchy
//!
//! - **Pre-run rejections** (`InvalidParameters`, `UnsupportedPixelDepth`, `AlreadyRunning`):
//!   returned before the scheduler enters `Running`. No events are emitted.
//! - **Step failures** (`AcquisitionTimeout`, `BufferOverflow`, `Capture`, `StorageWrite`):
//!   abort the current run, trigger cleanup and become the run's terminal failure.
//! - **Collaborator errors** (`DeviceConfig`): surfaced from device configuration that
//!   happens outside the scheduler.
//! - **Programmer errors** (`OutOfRange`, `CoordinateOutOfRange`): misuse of the
//!   coordinate mapper.
//! - **Ambient errors** (`Config`, `Io`, `Json`): configuration loading and metadata
//!   serialization.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AcqResult<T> = std::result::Result<T, AcqError>;

/// Stable classification of an [`AcqError`], used in logs and failure events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Plan or parameter rejected before the run
    InvalidParameters,
    /// Source reports a pixel depth the sink cannot store
    UnsupportedPixelDepth,
    /// Device configuration failed
    DeviceConfig,
    /// No buffered frame within the poll budget
    AcquisitionTimeout,
    /// Source buffer overflowed
    BufferOverflow,
    /// Frame capture failed
    Capture,
    /// Dataset create, write or close failed
    StorageWrite,
    /// Coordinate outside the dataset shape
    OutOfRange,
    /// A run is already in progress
    AlreadyRunning,
    /// Unexpected failure inside the scheduler
    Internal,
    /// Configuration could not be loaded
    Config,
    /// Filesystem error
    Io,
    /// Metadata (de)serialization failed
    Serialization,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::InvalidParameters => "invalid_parameters",
            ErrorKind::UnsupportedPixelDepth => "unsupported_pixel_depth",
            ErrorKind::DeviceConfig => "device_config",
            ErrorKind::AcquisitionTimeout => "acquisition_timeout",
            ErrorKind::BufferOverflow => "buffer_overflow",
            ErrorKind::Capture => "capture",
            ErrorKind::StorageWrite => "storage_write",
            ErrorKind::OutOfRange => "out_of_range",
            ErrorKind::AlreadyRunning => "already_running",
            ErrorKind::Internal => "internal",
            ErrorKind::Config => "config",
            ErrorKind::Io => "io",
            ErrorKind::Serialization => "serialization",
        };
        write!(f, "{}", label)
    }
}

/// Primary error type for acquisition runs.
#[derive(Error, Debug)]
pub enum AcqError {
    /// The plan cannot be executed (zero-length axis, negative interval, empty name...).
    ///
    /// **Error Type**: Permanent - fix the plan and resubmit.
    #[error("Invalid acquisition parameters: {0}")]
    InvalidParameters(String),

    /// The frame source reports a bit depth outside {GRAY8, GRAY16}.
    ///
    /// Raised before a dataset is created.
    #[error("Unsupported pixel depth of {bytes_per_pixel} bytes")]
    UnsupportedPixelDepth {
        /// Bytes per pixel reported by the source
        bytes_per_pixel: u32,
    },

    /// Device configuration failed outside the scheduler.
    #[error("Device configuration error: {0}")]
    DeviceConfig(String),

    /// No frame arrived in the source buffer within the poll budget.
    ///
    /// **Recovery Strategy**: Check trigger wiring; the burst may never have started.
    #[error("Timeout waiting for images at step {step} after {polls} polls")]
    AcquisitionTimeout {
        /// Zero-based step index that was waiting
        step: u64,
        /// Number of polls performed
        polls: u32,
    },

    /// The source's circular buffer overflowed and frames were lost.
    #[error("Circular buffer overflowed at step {step}")]
    BufferOverflow {
        /// Zero-based step index at which the overflow was observed
        step: u64,
    },

    /// The frame source failed to deliver a frame.
    #[error("Frame capture failed: {0}")]
    Capture(String),

    /// The sink rejected a frame or failed to create the dataset.
    #[error("Storage write error: {0}")]
    StorageWrite(String),

    /// A linear index outside `[0, len)` was passed to the coordinate mapper.
    #[error("Index {index} out of range for shape with {len} elements")]
    OutOfRange {
        /// Offending index
        index: u64,
        /// Number of coordinates in the shape
        len: u64,
    },

    /// A coordinate does not fit the shape it was unmapped against.
    #[error("Coordinate {coordinate:?} does not fit shape {shape:?}")]
    CoordinateOutOfRange {
        /// Offending coordinate
        coordinate: Vec<u64>,
        /// Shape it was checked against
        shape: Vec<u64>,
    },

    /// A run is already active on this scheduler.
    #[error("Cannot start: an acquisition is already running")]
    AlreadyRunning,

    /// The scheduler task panicked or was aborted.
    #[error("Scheduler task failed: {0}")]
    Internal(String),

    /// Configuration file parsing or extraction failed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration values parsed but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metadata serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AcqError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AcqError::InvalidParameters(_) => ErrorKind::InvalidParameters,
            AcqError::UnsupportedPixelDepth { .. } => ErrorKind::UnsupportedPixelDepth,
            AcqError::DeviceConfig(_) => ErrorKind::DeviceConfig,
            AcqError::AcquisitionTimeout { .. } => ErrorKind::AcquisitionTimeout,
            AcqError::BufferOverflow { .. } => ErrorKind::BufferOverflow,
            AcqError::Capture(_) => ErrorKind::Capture,
            AcqError::StorageWrite(_) => ErrorKind::StorageWrite,
            AcqError::OutOfRange { .. } | AcqError::CoordinateOutOfRange { .. } => {
                ErrorKind::OutOfRange
            }
            AcqError::AlreadyRunning => ErrorKind::AlreadyRunning,
            AcqError::Internal(_) => ErrorKind::Internal,
            AcqError::Config(_) | AcqError::Configuration(_) => ErrorKind::Config,
            AcqError::Io(_) => ErrorKind::Io,
            AcqError::Json(_) => ErrorKind::Serialization,
        }
    }

    /// True for errors that are rejected before a run enters `Running`.
    pub fn is_pre_run(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::InvalidParameters
                | ErrorKind::UnsupportedPixelDepth
                | ErrorKind::AlreadyRunning
        )
    }
}
