//! Stage parameters and their GPU uniform layout.

use bytemuck::{Pod, Zeroable};

use super::SpectralMode;
use crate::config::ReconstructionConfig;
use crate::data::FrameShape;
use crate::device::DeviceGeometry;

pub(crate) const FLAG_AVERAGING: u32 = 1;
pub(crate) const FLAG_INVERT: u32 = 1 << 1;
pub(crate) const FLAG_REVERSE: u32 = 1 << 2;
pub(crate) const FLAG_HISTORY: u32 = 1 << 3;
pub(crate) const FLAG_MAGNITUDE: u32 = 1 << 4;

/// Everything the three reconstruction stages need for one revolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconstructionParams {
    /// A-lines per revolution.
    pub lines: u32,
    /// Depth samples per A-line.
    pub depth: u32,
    /// Sector image side, pixels.
    pub sector_size: u32,
    pub mode: SpectralMode,
    /// Multiplier applied to the log magnitude.
    pub scale_factor: f32,
    /// Subtracted after scaling.
    pub noise_floor: f32,
    /// Blend with the previous frame.
    pub averaging: bool,
    /// Weight of the previous frame.
    pub prev_weight: f32,
    /// Weight of the current frame.
    pub curr_weight: f32,
    /// Level mapped to black.
    pub black_level: f32,
    /// Level mapped to white.
    pub white_level: f32,
    /// Invert grey levels.
    pub invert: bool,
    /// Display rotation, degrees. Includes the unwind correction.
    pub display_angle_deg: f32,
    /// Catheter body radius, depth pixels.
    pub catheter_radius_px: f32,
    /// Central mask radius, sector pixels.
    pub mask_radius_px: f32,
    /// Mirror the angular axis.
    pub reverse_direction: bool,
}

impl ReconstructionParams {
    /// Stage parameters from settings and device geometry.
    #[must_use]
    pub fn from_settings(config: &ReconstructionConfig, geometry: &DeviceGeometry) -> Self {
        Self {
            lines: geometry.lines_per_revolution,
            depth: geometry.aline_length_px,
            sector_size: config.sector_size,
            mode: SpectralMode::Complex,
            scale_factor: config.scale_factor,
            noise_floor: config.noise_floor,
            averaging: config.averaging,
            prev_weight: config.prev_weight,
            curr_weight: config.curr_weight,
            black_level: config.black_level,
            white_level: config.white_level,
            invert: config.invert,
            display_angle_deg: config.display_angle_deg,
            catheter_radius_px: geometry.catheter_radius_px as f32,
            mask_radius_px: geometry.internal_imaging_mask_px as f32,
            reverse_direction: false,
        }
    }

    /// Buffer shape these parameters produce.
    #[must_use]
    pub fn shape(&self) -> FrameShape {
        FrameShape {
            lines: self.lines as usize,
            depth: self.depth as usize,
            sector_size: self.sector_size as usize,
        }
    }

    /// Uniform block for the shaders. `has_history` says whether the
    /// previous-frame buffer holds a real frame yet.
    #[must_use]
    pub fn to_gpu(&self, has_history: bool) -> GpuParams {
        let mut flags = 0;
        if self.averaging {
            flags |= FLAG_AVERAGING;
        }
        if self.invert {
            flags |= FLAG_INVERT;
        }
        if self.reverse_direction {
            flags |= FLAG_REVERSE;
        }
        if has_history {
            flags |= FLAG_HISTORY;
        }
        if self.mode == SpectralMode::Magnitude {
            flags |= FLAG_MAGNITUDE;
        }
        GpuParams {
            lines: self.lines,
            depth: self.depth,
            sector_size: self.sector_size,
            flags,
            scale_factor: self.scale_factor,
            noise_floor: self.noise_floor,
            prev_weight: self.prev_weight,
            curr_weight: self.curr_weight,
            black_level: self.black_level,
            white_level: self.white_level,
            display_angle_deg: self.display_angle_deg,
            catheter_radius_px: self.catheter_radius_px,
            mask_radius_px: self.mask_radius_px,
            _pad: [0; 3],
        }
    }
}

/// Mirror of `Params` in `reconstruction.wgsl`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GpuParams {
    /// A-lines per revolution.
    pub lines: u32,
    /// Depth samples per A-line.
    pub depth: u32,
    /// Sector image side, pixels.
    pub sector_size: u32,
    /// Bit set: averaging, invert, reverse, history present, magnitude input.
    pub flags: u32,
    /// Multiplier applied to the log magnitude.
    pub scale_factor: f32,
    /// Subtracted after scaling.
    pub noise_floor: f32,
    /// Weight of the previous frame.
    pub prev_weight: f32,
    /// Weight of the current frame.
    pub curr_weight: f32,
    /// Level mapped to black.
    pub black_level: f32,
    /// Level mapped to white.
    pub white_level: f32,
    /// Display rotation, degrees.
    pub display_angle_deg: f32,
    /// Catheter body radius, depth pixels.
    pub catheter_radius_px: f32,
    /// Central mask radius, sector pixels.
    pub mask_radius_px: f32,
    _pad: [u32; 3],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_params_size() {
        assert_eq!(std::mem::size_of::<GpuParams>(), 64);
    }

    #[test]
    fn test_flags() {
        let mut params = ReconstructionParams::from_settings(
            &ReconstructionConfig::default(),
            &DeviceGeometry::default(),
        );
        assert_eq!(params.to_gpu(false).flags, 0);

        params.averaging = true;
        params.reverse_direction = true;
        params.mode = SpectralMode::Magnitude;
        let gpu = params.to_gpu(true);
        assert_eq!(
            gpu.flags,
            FLAG_AVERAGING | FLAG_REVERSE | FLAG_HISTORY | FLAG_MAGNITUDE
        );
    }

    #[test]
    fn test_geometry_feeds_params() {
        let geometry = DeviceGeometry {
            lines_per_revolution: 256,
            aline_length_px: 128,
            catheter_radius_px: 10,
            internal_imaging_mask_px: 4,
            ..DeviceGeometry::default()
        };
        let params = ReconstructionParams::from_settings(&ReconstructionConfig::default(), &geometry);
        let shape = params.shape();
        assert_eq!((shape.lines, shape.depth, shape.sector_size), (256, 128, 512));
        assert_eq!(params.catheter_radius_px, 10.0);
        assert_eq!(params.mask_radius_px, 4.0);
    }
}
