//! Custom error types for the pipeline.
//!
//! This module defines the primary error type, `OctError`, for the entire library.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the kinds of errors that can occur between the acquisition board and the finished
//! sector image.
//!
//! ## Error Hierarchy
//!
//! Every variant maps onto one of three severities (see [`Severity`]):
//!
//! - **Transient**: a single dropped frame, a failed GPU dispatch or readback, a rejected
//!   encoder sample. The affected cycle is skipped and a counter is bumped; these never
//!   stop the pipeline.
//! - **Stall**: the acquisition source stopped delivering buffers. The pipeline asks the
//!   source to attenuate and performs a stop/reconfigure/restart cycle.
//! - **Fatal**: configuration problems, no compute device, allocation or kernel build
//!   failures. These are raised before the live loop starts and must block imaging.
//!
//! By using `#[from]`, `OctError` can be created from underlying error types, so the
//! `?` operator works throughout the crate.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, OctError>;

/// How an error affects the running pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    /// Skip the current cycle, count it, keep going.
    Transient,
    /// Source has stopped producing; reset the acquisition path.
    Stall,
    /// Imaging cannot start or continue.
    Fatal,
}

/// Errors produced by the imaging pipeline.
#[derive(Error, Debug)]
pub enum OctError {
    /// Settings could not be extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Settings were read but cannot be used.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No adapter matched and CPU fallback was not allowed.
    #[error("No usable compute device found (checked {checked} adapters)")]
    NoComputeDevice {
        /// Adapters considered.
        checked: usize,
    },

    /// A pool or device buffer could not be created.
    #[error("Buffer allocation failed: {0}")]
    BufferAllocation(String),

    /// A compute shader failed to compile or link.
    #[error("Kernel build failed: {0}")]
    KernelBuild(String),

    /// A reconstruction dispatch failed. The frame is dropped.
    #[error("Kernel dispatch failed: {0}")]
    Dispatch(String),

    /// Reading results back failed. The frame is dropped.
    #[error("Readback failed: {0}")]
    Readback(String),

    /// Rescale table missing, malformed or the wrong size.
    #[error("Calibration error: {0}")]
    Calibration(String),

    /// Capture file missing, malformed or not matching the settings.
    #[error("Playback error: {0}")]
    Playback(String),

    /// The live source stopped delivering buffers.
    #[error("Acquisition source stalled after {timeouts} consecutive timeouts")]
    SourceStalled {
        /// Consecutive timed-out waits.
        timeouts: u32,
    },

    /// Acquisition resets exhausted.
    #[error("Acquisition reset limit of {0} exceeded")]
    ResetLimitExceeded(u32),

    /// A pipeline thread panicked.
    #[error("Pipeline thread '{0}' panicked")]
    ThreadPanicked(String),

    /// Several errors occurred while stopping threads.
    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<OctError>),
}

impl From<figment::Error> for OctError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

impl From<oct_pool::PoolError> for OctError {
    fn from(err: oct_pool::PoolError) -> Self {
        Self::BufferAllocation(err.to_string())
    }
}

impl OctError {
    /// Classify the error for the pipeline's propagation policy.
    #[must_use]
    pub fn severity(&self) -> Severity {
        match self {
            Self::Dispatch(_) | Self::Readback(_) => Severity::Transient,
            Self::SourceStalled { .. } => Severity::Stall,
            Self::Config(_)
            | Self::Configuration(_)
            | Self::Io(_)
            | Self::NoComputeDevice { .. }
            | Self::BufferAllocation(_)
            | Self::KernelBuild(_)
            | Self::Calibration(_)
            | Self::Playback(_)
            | Self::ResetLimitExceeded(_)
            | Self::ThreadPanicked(_)
            | Self::ShutdownFailed(_) => Severity::Fatal,
        }
    }

    /// Whether the error ends the pipeline.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}
