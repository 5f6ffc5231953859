//! Spectral post-processing and polar-to-sector reconstruction.
//!
//! One revolution of depth profiles goes through three stages on a
//! [`ComputeBackend`]:
//!
//! 1. **post_process** - magnitude, log scale, noise floor, optional
//!    blend with the previous revolution, clamp to 8 bits (polar image)
//! 2. **contrast_window** - black/white level window and optional invert
//! 3. **polar_to_sector** - nearest-neighbour warp into the square sector
//!    image, catheter and mask radii left black
//!
//! [`gpu::GpuBackend`] runs them as wgpu compute kernels;
//! [`cpu::CpuBackend`] carries the same arithmetic on the host.

pub mod cpu;
pub mod device;
pub mod gpu;
pub mod params;

pub use cpu::CpuBackend;
pub use device::{
    choose_device, create_backend, describe_devices, AdapterCandidate, DeviceChoice, DeviceClass,
};
pub use gpu::GpuBackend;
pub use params::{GpuParams, ReconstructionParams};

use tracing::warn;

use crate::data::ReconstructedFrame;
use crate::error::AppResult;

/// How the depth profiles in a [`SpectralBatch`] are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpectralMode {
    /// `real` and `imag` hold the transform output.
    #[default]
    Complex,
    /// `real` already holds magnitudes; `imag` is ignored.
    Magnitude,
}

/// Depth profiles for one revolution, row-major `lines x depth`.
#[derive(Debug, Clone)]
pub struct SpectralBatch {
    /// Rows (A-lines).
    pub lines: usize,
    /// Depth samples per row.
    pub depth: usize,
    /// How `real`/`imag` are interpreted.
    pub mode: SpectralMode,
    /// Real plane, line-major.
    pub real: Vec<f32>,
    /// Imaginary plane, line-major.
    pub imag: Vec<f32>,
    /// Encoder position each row was binned from.
    pub positions: Vec<f32>,
}

impl SpectralBatch {
    /// Zeroed batch.
    #[must_use]
    pub fn new(lines: usize, depth: usize) -> Self {
        Self {
            lines,
            depth,
            mode: SpectralMode::Complex,
            real: vec![0.0; lines * depth],
            imag: vec![0.0; lines * depth],
            positions: vec![0.0; lines],
        }
    }

    /// Real and imaginary halves of row `line`.
    ///
    /// # Panics
    ///
    /// Panics if `line >= self.lines`.
    pub fn row_mut(&mut self, line: usize) -> (&mut [f32], &mut [f32]) {
        let span = line * self.depth..(line + 1) * self.depth;
        (&mut self.real[span.clone()], &mut self.imag[span])
    }

    /// Zero every row so lines the revolution never hit stay dark.
    pub fn clear(&mut self) {
        self.real.fill(0.0);
        self.imag.fill(0.0);
        self.positions.fill(0.0);
    }
}

/// A device that runs the three reconstruction stages.
///
/// `dispatch` and `read_back` alternate: every dispatch is followed by
/// exactly one read back before the next dispatch.
pub trait ComputeBackend: Send {
    /// Adapter name, or `"cpu"` for the host kernels.
    fn name(&self) -> &str;

    /// Run all three stages on `batch`.
    fn dispatch(&mut self, batch: &SpectralBatch, params: &ReconstructionParams)
        -> AppResult<()>;

    /// Copy the results of the last dispatch into `frame`.
    fn read_back(&mut self, frame: &mut ReconstructedFrame) -> AppResult<()>;

    /// Forget the previous revolution used for averaging.
    fn reset_history(&mut self);

    /// Kernel arguments that were bound with the wrong size so far.
    fn bind_failures(&self) -> u64;
}

/// Check one kernel argument size. A mismatch is logged, not fatal: the
/// backend pads or truncates and carries on.
pub(crate) fn check_argument(
    kernel: &'static str,
    index: u32,
    name: &'static str,
    actual: usize,
    expected: usize,
) -> bool {
    if actual == expected {
        return true;
    }
    warn!(
        kernel,
        index,
        argument = name,
        actual,
        expected,
        "Kernel argument size mismatch"
    );
    false
}

/// Backend plus the parameters and counters of one running pipeline.
pub struct ReconstructionPipeline {
    backend: Box<dyn ComputeBackend>,
    params: ReconstructionParams,
    frames: u64,
}

impl ReconstructionPipeline {
    /// Pipeline over `backend` with `params`.
    #[must_use]
    pub fn new(backend: Box<dyn ComputeBackend>, params: ReconstructionParams) -> Self {
        Self {
            backend,
            params,
            frames: 0,
        }
    }

    /// Parameters used for the next dispatch.
    #[must_use]
    pub fn params(&self) -> &ReconstructionParams {
        &self.params
    }

    /// Replace the parameters. A new frame shape drops the averaging history.
    pub fn set_params(&mut self, params: ReconstructionParams) {
        if params.shape() != self.params.shape() {
            self.backend.reset_history();
        }
        self.params = params;
    }

    /// Update the per-revolution rotation fields without touching the rest.
    pub fn set_orientation(&mut self, display_angle_deg: f32, reverse_direction: bool) {
        self.params.display_angle_deg = display_angle_deg;
        self.params.reverse_direction = reverse_direction;
    }

    /// Forget the averaging history.
    pub fn reset_history(&mut self) {
        self.backend.reset_history();
    }

    /// Reconstruct `batch` into `frame`.
    pub fn reconstruct(
        &mut self,
        batch: &SpectralBatch,
        frame: &mut ReconstructedFrame,
    ) -> AppResult<()> {
        let mut params = self.params.clone();
        params.mode = batch.mode;
        self.backend.dispatch(batch, &params)?;
        self.backend.read_back(frame)?;

        for (dst, src) in frame.encoder_data.iter_mut().zip(&batch.positions) {
            *dst = *src;
        }
        frame.display_angle_deg = params.display_angle_deg;
        self.frames += 1;
        Ok(())
    }

    /// Name of the backend in use.
    #[must_use]
    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Frames reconstructed successfully.
    #[must_use]
    pub fn frames_reconstructed(&self) -> u64 {
        self.frames
    }

    /// Kernel arguments that failed their length check.
    #[must_use]
    pub fn bind_failures(&self) -> u64 {
        self.backend.bind_failures()
    }
}

impl std::fmt::Debug for ReconstructionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconstructionPipeline")
            .field("backend", &self.backend.name())
            .field("params", &self.params)
            .field("frames", &self.frames)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconstructionConfig;
    use crate::data::FrameShape;
    use crate::device::DeviceGeometry;
    use tracing_test::traced_test;

    fn small_params() -> ReconstructionParams {
        let geometry = DeviceGeometry {
            lines_per_revolution: 8,
            aline_length_px: 16,
            catheter_radius_px: 2,
            internal_imaging_mask_px: 1,
            ..DeviceGeometry::default()
        };
        let config = ReconstructionConfig {
            sector_size: 32,
            ..ReconstructionConfig::default()
        };
        ReconstructionParams::from_settings(&config, &geometry)
    }

    fn pipeline() -> ReconstructionPipeline {
        let params = small_params();
        ReconstructionPipeline::new(Box::new(CpuBackend::new(params.shape())), params)
    }

    #[test]
    fn test_batch_rows() {
        let mut batch = SpectralBatch::new(3, 4);
        let (re, im) = batch.row_mut(1);
        re.fill(1.0);
        im.fill(2.0);
        assert_eq!(&batch.real[4..8], &[1.0; 4]);
        assert_eq!(batch.real[0], 0.0);
        assert_eq!(&batch.imag[4..8], &[2.0; 4]);
        batch.clear();
        assert!(batch.real.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_reconstruct_copies_positions_and_angle() {
        let mut pipeline = pipeline();
        pipeline.set_orientation(45.0, false);
        let shape = pipeline.params().shape();
        let mut batch = SpectralBatch::new(shape.lines, shape.depth);
        batch.real.fill(1_000.0);
        for (i, p) in batch.positions.iter_mut().enumerate() {
            *p = i as f32 * 10.0;
        }

        let mut frame = ReconstructedFrame::with_shape(shape);
        pipeline.reconstruct(&batch, &mut frame).unwrap();
        assert_eq!(frame.encoder_data[3], 30.0);
        assert_eq!(frame.display_angle_deg, 45.0);
        assert_eq!(pipeline.frames_reconstructed(), 1);
        assert_eq!(pipeline.backend_name(), "cpu");
    }

    #[test]
    fn test_shape_change_reallocates() {
        let mut pipeline = pipeline();
        let mut params = small_params();
        params.sector_size = 64;
        pipeline.set_params(params);

        let shape = pipeline.params().shape();
        assert_eq!(shape.sector_size, 64);
        let batch = SpectralBatch::new(shape.lines, shape.depth);
        let mut frame = ReconstructedFrame::with_shape(shape);
        pipeline.reconstruct(&batch, &mut frame).unwrap();
    }

    #[test]
    fn test_frame_shape_mismatch_is_a_readback_error() {
        let mut pipeline = pipeline();
        let shape = pipeline.params().shape();
        let batch = SpectralBatch::new(shape.lines, shape.depth);
        let mut frame = ReconstructedFrame::with_shape(FrameShape {
            sector_size: 8,
            ..shape
        });
        let err = pipeline.reconstruct(&batch, &mut frame).unwrap_err();
        assert!(matches!(err, crate::error::OctError::Readback(_)));
    }

    #[test]
    #[traced_test]
    fn test_short_batch_logs_bind_failure() {
        let mut pipeline = pipeline();
        let shape = pipeline.params().shape();
        let batch = SpectralBatch::new(shape.lines - 1, shape.depth);
        let mut frame = ReconstructedFrame::with_shape(shape);

        pipeline.reconstruct(&batch, &mut frame).unwrap();
        assert_eq!(pipeline.bind_failures(), 2);
        assert!(logs_contain("Kernel argument size mismatch"));
        assert!(logs_contain("post_process"));
    }
}
