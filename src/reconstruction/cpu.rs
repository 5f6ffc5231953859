//! Reference kernels on the host.
//!
//! Same arithmetic as `shaders/reconstruction.wgsl`, one pixel at a time.
//! Used when no GPU adapter is available and as the oracle in GPU tests.

use super::params::ReconstructionParams;
use super::{check_argument, ComputeBackend, SpectralBatch, SpectralMode};
use crate::data::{FrameShape, ReconstructedFrame};
use crate::error::{AppResult, OctError};

/// Stage 1: log-scaled magnitude, noise floor, optional blend with the
/// previous frame, clamped to 8 bits.
pub fn post_process(
    real: &[f32],
    imag: &[f32],
    prev_prescale: Option<&[f32]>,
    params: &ReconstructionParams,
    prescale: &mut [f32],
    polar: &mut [u8],
) {
    let blend = params.averaging.then_some(prev_prescale).flatten();
    for (i, (out, pre)) in polar.iter_mut().zip(prescale.iter_mut()).enumerate() {
        let re = real.get(i).copied().unwrap_or(0.0);
        let magnitude = match params.mode {
            SpectralMode::Magnitude => re.max(0.0),
            SpectralMode::Complex => {
                let im = imag.get(i).copied().unwrap_or(0.0);
                (re * re + im * im).sqrt()
            }
        };
        let db = 20.0 * (magnitude + 1.0).log10() * params.scale_factor - params.noise_floor;
        *pre = db;

        let value = match blend {
            Some(prev) => params.prev_weight * prev[i] + params.curr_weight * db,
            None => db,
        };
        *out = value.clamp(0.0, 255.0) as u8;
    }
}

/// Stage 2: map `[black_level, white_level]` onto `[0, 255]`.
pub fn contrast_window(polar: &[u8], params: &ReconstructionParams, windowed: &mut [u8]) {
    let span = (params.white_level - params.black_level).max(1e-6);
    for (out, &v) in windowed.iter_mut().zip(polar) {
        let level = ((f32::from(v) - params.black_level) * 255.0 / span).clamp(0.0, 255.0) as u8;
        *out = if params.invert { 255 - level } else { level };
    }
}

/// Index into the polar image shown at sector pixel `p`, `None` for black.
#[must_use]
pub fn sector_source(p: usize, params: &ReconstructionParams) -> Option<usize> {
    let s = params.sector_size as usize;
    let half = params.sector_size as f32 * 0.5;
    let dx = (p % s) as f32 + 0.5 - half;
    let dy = (p / s) as f32 + 0.5 - half;
    let r = (dx * dx + dy * dy).sqrt();
    if r >= half || r < params.mask_radius_px {
        return None;
    }

    let depth_f =
        r / half * (params.depth as f32 + params.catheter_radius_px) - params.catheter_radius_px;
    if depth_f < 0.0 {
        return None;
    }
    let d = (depth_f as u32).min(params.depth - 1);

    let mut theta = dy.atan2(dx).to_degrees();
    if params.reverse_direction {
        theta = -theta;
    }
    theta -= params.display_angle_deg;
    theta -= 360.0 * (theta / 360.0).floor();
    let line = ((theta / 360.0 * params.lines as f32) as u32).min(params.lines - 1);
    Some((line * params.depth + d) as usize)
}

/// Stage 3: nearest-neighbour warp of the windowed polar image.
pub fn polar_to_sector(
    windowed: &[u8],
    params: &ReconstructionParams,
    display: &mut [u8],
    video: &mut [u8],
) {
    for (p, (d, v)) in display.iter_mut().zip(video.iter_mut()).enumerate() {
        let value = sector_source(p, params)
            .and_then(|src| windowed.get(src).copied())
            .unwrap_or(0);
        *d = value;
        *v = value;
    }
}

/// Host implementation of [`ComputeBackend`].
#[derive(Debug)]
pub struct CpuBackend {
    shape: FrameShape,
    prescale: Vec<f32>,
    prev_prescale: Vec<f32>,
    has_history: bool,
    polar: Vec<u8>,
    windowed: Vec<u8>,
    display: Vec<u8>,
    video: Vec<u8>,
    bind_failures: u64,
    dispatched: bool,
}

impl CpuBackend {
    /// Backend sized for `shape`.
    #[must_use]
    pub fn new(shape: FrameShape) -> Self {
        Self {
            shape,
            prescale: vec![0.0; shape.polar_len()],
            prev_prescale: vec![0.0; shape.polar_len()],
            has_history: false,
            polar: vec![0; shape.polar_len()],
            windowed: vec![0; shape.polar_len()],
            display: vec![0; shape.sector_len()],
            video: vec![0; shape.sector_len()],
            bind_failures: 0,
            dispatched: false,
        }
    }
}

impl ComputeBackend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn dispatch(
        &mut self,
        batch: &SpectralBatch,
        params: &ReconstructionParams,
    ) -> AppResult<()> {
        if params.shape() != self.shape {
            let failures = self.bind_failures;
            *self = Self::new(params.shape());
            self.bind_failures = failures;
        }
        let expected = self.shape.polar_len();

        if !check_argument("post_process", 1, "real", batch.real.len(), expected) {
            self.bind_failures += 1;
        }
        if params.mode == SpectralMode::Complex
            && !check_argument("post_process", 2, "imag", batch.imag.len(), expected)
        {
            self.bind_failures += 1;
        }

        let prev = self.has_history.then_some(self.prev_prescale.as_slice());
        post_process(
            &batch.real,
            &batch.imag,
            prev,
            params,
            &mut self.prescale,
            &mut self.polar,
        );
        contrast_window(&self.polar, params, &mut self.windowed);
        polar_to_sector(&self.windowed, params, &mut self.display, &mut self.video);

        self.prev_prescale.copy_from_slice(&self.prescale);
        self.has_history = true;
        self.dispatched = true;
        Ok(())
    }

    fn read_back(&mut self, frame: &mut ReconstructedFrame) -> AppResult<()> {
        if !self.dispatched {
            return Err(OctError::Readback("nothing dispatched".into()));
        }
        if frame.shape() != self.shape {
            return Err(OctError::Readback(format!(
                "frame shape {:?} does not match backend shape {:?}",
                frame.shape(),
                self.shape
            )));
        }
        frame.raw_data.copy_from_slice(&self.polar);
        frame.spectral_data.copy_from_slice(&self.prescale);
        frame.display_bytes.copy_from_slice(&self.display);
        frame.video_bytes.copy_from_slice(&self.video);
        self.dispatched = false;
        Ok(())
    }

    fn reset_history(&mut self) {
        self.has_history = false;
    }

    fn bind_failures(&self) -> u64 {
        self.bind_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconstructionConfig;
    use crate::device::DeviceGeometry;

    fn params(lines: u32, depth: u32, sector: u32) -> ReconstructionParams {
        let geometry = DeviceGeometry {
            lines_per_revolution: lines,
            aline_length_px: depth,
            catheter_radius_px: 0,
            internal_imaging_mask_px: 0,
            ..DeviceGeometry::default()
        };
        let config = ReconstructionConfig {
            sector_size: sector,
            scale_factor: 1.0,
            noise_floor: 0.0,
            ..ReconstructionConfig::default()
        };
        ReconstructionParams::from_settings(&config, &geometry)
    }

    #[test]
    fn test_post_process_log_scale() {
        let p = params(1, 4, 4);
        let real = [0.0, 9.5, 99.5, 1e15];
        let imag = [0.0; 4];
        let mut prescale = [0.0; 4];
        let mut polar = [0u8; 4];
        post_process(&real, &imag, None, &p, &mut prescale, &mut polar);
        assert_eq!(polar[0], 0);
        assert_eq!(polar[1], 20);
        assert_eq!(polar[2], 40);
        // 300 dB clamps.
        assert_eq!(polar[3], 255);
        assert!((prescale[2] - 40.0).abs() < 0.1);
    }

    #[test]
    fn test_post_process_blends_with_history() {
        let mut p = params(1, 1, 4);
        p.averaging = true;
        p.prev_weight = 0.5;
        p.curr_weight = 0.5;
        let mut prescale = [0.0; 1];
        let mut polar = [0u8; 1];
        post_process(&[99.5], &[0.0], Some(&[100.0]), &p, &mut prescale, &mut polar);
        assert_eq!(polar[0], 70);
        // History is the unblended value.
        assert!((prescale[0] - 40.0).abs() < 0.1);
    }

    #[test]
    fn test_contrast_window_and_invert() {
        let mut p = params(1, 4, 4);
        p.black_level = 50.0;
        p.white_level = 150.0;
        let mut out = [0u8; 4];
        contrast_window(&[0, 50, 100, 200], &p, &mut out);
        assert_eq!(out, [0, 0, 127, 255]);

        p.invert = true;
        contrast_window(&[0, 50, 100, 200], &p, &mut out);
        assert_eq!(out, [255, 255, 128, 0]);
    }

    #[test]
    fn test_sector_corners_are_black_and_center_masked() {
        let mut p = params(4, 8, 16);
        p.mask_radius_px = 2.0;
        assert_eq!(sector_source(0, &p), None);
        // Pixel (8, 8) is 0.7 px from the centre.
        assert_eq!(sector_source(8 * 16 + 8, &p), None);
        // Pixel (15, 8): right edge, angle ~0, deepest sample of line 0.
        assert_eq!(sector_source(8 * 16 + 15, &p), Some(7));
    }

    #[test]
    fn test_sector_quadrants_follow_lines() {
        let p = params(4, 8, 16);
        // Angles grow clockwise on screen (y points down).
        let right = sector_source(8 * 16 + 14, &p).unwrap();
        let below = sector_source(14 * 16 + 7, &p).unwrap();
        let left = sector_source(7 * 16 + 1, &p).unwrap();
        let above = sector_source(16 + 8, &p).unwrap();
        assert_eq!(right / 8, 0);
        assert_eq!(below / 8, 1);
        assert_eq!(left / 8, 2);
        assert_eq!(above / 8, 3);
    }

    #[test]
    fn test_display_angle_rotates_lines() {
        let mut p = params(4, 8, 16);
        p.display_angle_deg = 90.0;
        let right = sector_source(8 * 16 + 14, &p).unwrap();
        assert_eq!(right / 8, 3);
        p.display_angle_deg = 0.0;
        p.reverse_direction = true;
        let below = sector_source(14 * 16 + 8, &p).unwrap();
        assert_eq!(below / 8, 3);
    }

    #[test]
    fn test_cpu_backend_round_trip() {
        let p = params(8, 16, 32);
        let mut backend = CpuBackend::new(p.shape());
        let mut batch = SpectralBatch::new(p.shape().lines, p.shape().depth);
        batch.real.fill(99.5);
        backend.dispatch(&batch, &p).unwrap();

        let mut frame = ReconstructedFrame::with_shape(p.shape());
        backend.read_back(&mut frame).unwrap();
        assert!(frame.raw_data.iter().all(|&b| b == 40));
        let lit = frame.display_bytes.iter().filter(|&&b| b > 0).count();
        assert!(lit > 0);
        assert_eq!(frame.display_bytes, frame.video_bytes);

        // Second read without a dispatch is refused.
        assert!(backend.read_back(&mut frame).is_err());
    }
}
