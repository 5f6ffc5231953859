//! Raw data sources and the acquisition thread.
//!
//! A [`DataSource`] fills one [`RawBuffer`] per call. Two variants exist:
//! [`SimulatedDaq`] stands in for the live board, [`PlaybackManager`]
//! replays a capture file. Either is driven into the raw pool by a
//! [`Producer`] thread; the pool's overflow policy comes from the source
//! (live data is lossy, playback never drops).

pub mod capture;
pub mod playback;
pub mod producer;
pub mod simulated;

pub use capture::{CaptureHeader, CaptureReader, CaptureWriter, RecordingSource};
pub use playback::{PlaybackHandle, PlaybackManager};
pub use producer::{Producer, ProducerConfig, ProducerExit, ProducerOutcome};
pub use simulated::{SimulatedDaq, StallMode};

use std::time::Duration;

use crate::config::Settings;
use crate::data::RawBuffer;
use crate::device::DeviceGeometry;
use crate::error::AppResult;
use oct_pool::OverflowPolicy;

/// Shape and timing a source is configured with.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionParams {
    /// Samples per A-line record.
    pub record_length: usize,
    /// Encoder samples per record.
    pub encoder_record_length: usize,
    /// Records per raw buffer.
    pub lines_per_buffer: usize,
    /// A-lines per catheter revolution.
    pub lines_per_revolution: u32,
    /// Simulated A-line rate.
    pub line_rate_hz: f64,
    /// Simulated rotation rate.
    pub rotation_hz: f64,
}

impl AcquisitionParams {
    /// Resolve from settings and the selected device.
    #[must_use]
    pub fn from_settings(settings: &Settings, geometry: &DeviceGeometry) -> Self {
        let acq = &settings.acquisition;
        Self {
            record_length: acq.record_length,
            encoder_record_length: acq.encoder_record_length,
            lines_per_buffer: acq.lines_per_buffer,
            lines_per_revolution: geometry.lines_per_revolution,
            line_rate_hz: acq.line_rate_hz,
            rotation_hz: acq.rotation_hz,
        }
    }

    /// A-lines per catheter revolution at the configured speeds.
    #[must_use]
    pub fn lines_per_rotation(&self) -> f64 {
        if self.rotation_hz > 0.0 {
            self.line_rate_hz / self.rotation_hz
        } else {
            f64::INFINITY
        }
    }

    /// Time the board needs to fill one buffer.
    #[must_use]
    pub fn buffer_period(&self) -> Duration {
        if self.line_rate_hz > 0.0 {
            Duration::from_secs_f64(self.lines_per_buffer as f64 / self.line_rate_hz)
        } else {
            Duration::ZERO
        }
    }
}

/// Outcome of one [`DataSource::acquire_next`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    /// The buffer holds new data.
    Filled,
    /// Nothing arrived within the timeout (or playback is paused).
    Empty,
}

/// Anything that can fill raw buffers.
pub trait DataSource: Send {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Apply shape and timing. Also called on every pipeline restart.
    fn configure(&mut self, params: &AcquisitionParams) -> AppResult<()>;

    /// Fill `buffer`, waiting at most `timeout`.
    fn acquire_next(&mut self, buffer: &mut RawBuffer, timeout: Duration) -> AppResult<Acquired>;

    /// Raw pool policy this source needs. Only lossy (live) sources are
    /// watched for stalls.
    fn policy(&self) -> OverflowPolicy;

    /// The source has no more data and never will.
    fn is_finished(&self) -> bool {
        false
    }

    /// Release resources when the pipeline shuts down for good.
    fn shutdown(&mut self) -> AppResult<()> {
        Ok(())
    }
}
