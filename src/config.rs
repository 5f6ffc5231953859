//! Configuration System using Figment
//!
//! Settings are layered, later layers overriding earlier ones:
//! 1. Built-in defaults ([`Settings::default`])
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `RUSTOCT_`, nested keys split on `__`
//!
//! # Environment Variable Overrides
//!
//! ```text
//! RUSTOCT_LOGGING__LEVEL=debug
//! RUSTOCT_ACQUISITION__RAW_POOL_SLOTS=64
//! RUSTOCT_RECONSTRUCTION__BACKEND=cpu
//! ```
//!
//! # Example
//!
//! ```no_run
//! use rust_oct::config::Settings;
//!
//! let settings = Settings::load(Some(std::path::Path::new("oct.toml")))?;
//! println!("Lines per revolution: {}", settings.device.lines_per_revolution);
//! # Ok::<(), rust_oct::error::OctError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::device::DeviceGeometry;
use crate::error::{AppResult, OctError};
use crate::limits;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "RUSTOCT_";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Acquisition board and raw pool.
    pub acquisition: AcquisitionConfig,
    /// Encoder angle tracking.
    pub angle: AngleConfig,
    /// Spectrometer resampling.
    pub resample: ResampleConfig,
    /// Image reconstruction.
    pub reconstruction: ReconstructionConfig,
    /// Capture playback.
    pub playback: PlaybackConfig,
    /// Imaging device geometry.
    pub device: DeviceGeometry,
    /// Log output.
    pub logging: LoggingConfig,
}

/// Acquisition board and raw pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Interferogram samples per record (one A-line).
    pub record_length: usize,
    /// Encoder channel samples captured alongside each record.
    pub encoder_record_length: usize,
    /// Records delivered per DMA buffer (one raw pool slot).
    pub lines_per_buffer: usize,
    /// Raw buffer pool capacity.
    pub raw_pool_slots: usize,
    /// Bounded wait for one raw buffer.
    #[serde(with = "humantime_serde")]
    pub wait_timeout: Duration,
    /// Consecutive wait timeouts before the source is declared stalled.
    pub stall_threshold: u32,
    /// Stop/reconfigure/restart cycles allowed before giving up.
    pub max_resets: u32,
    /// Simulated source: A-lines per second.
    pub line_rate_hz: f64,
    /// Simulated source: catheter revolutions per second.
    pub rotation_hz: f64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            record_length: 2048,
            encoder_record_length: 48,
            lines_per_buffer: 64,
            raw_pool_slots: 48,
            wait_timeout: Duration::from_millis(250),
            stall_threshold: 10,
            max_resets: 3,
            line_rate_hz: 15_360.0,
            rotation_hz: 30.0,
        }
    }
}

/// Encoder calibration and rotation tracking settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AngleConfig {
    /// Moving-average width for the angle filter (0 or 1 disables it).
    pub averager_width: usize,
    /// Encoder revolutions during which the calibration range is learned.
    pub auto_range_revolutions: u32,
    /// Calibration range used when auto-ranging is disabled.
    pub initial_cal_min: f64,
    /// Initial upper calibration bound.
    pub initial_cal_max: f64,
    /// Encoder revolutions per catheter revolution.
    pub gearing_ratio: f64,
    /// Largest first-to-last sample slew accepted within one encoder record.
    pub max_slew: u16,
    /// Only every Nth position update is used for direction detection.
    pub direction_debounce: u32,
    /// Position change (counts) below which the catheter counts as stopped.
    pub min_angle_change: f64,
    /// Position change (counts) required to report a new direction.
    pub direction_threshold: f64,
    /// Rotational lag between motor and imaging tip, degrees.
    pub wind_angle_deg: f64,
    /// Add half a turn to the wind angle for full-windup catheters.
    pub large_unwind: bool,
    /// Apply the unwind correction at all.
    pub unwind_enabled: bool,
}

impl Default for AngleConfig {
    fn default() -> Self {
        Self {
            averager_width: 4,
            auto_range_revolutions: 5,
            initial_cal_min: 0.0,
            initial_cal_max: 65_535.0,
            gearing_ratio: 1.0,
            max_slew: 4_096,
            direction_debounce: 16,
            min_angle_change: 1.0,
            direction_threshold: 4.0,
            wind_angle_deg: 30.0,
            large_unwind: false,
            unwind_enabled: true,
        }
    }
}

/// Non-uniform to uniform resampling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResampleConfig {
    /// Constant subtracted from every interpolated sample.
    pub dc_offset: f32,
    /// Per-device rescaling table; identity when absent.
    pub calibration_file: Option<PathBuf>,
}

impl Default for ResampleConfig {
    fn default() -> Self {
        Self {
            dc_offset: 32_768.0,
            calibration_file: None,
        }
    }
}

/// Which compute backend runs the reconstruction stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendChoice {
    /// Best GPU adapter, falling back to the CPU kernels if allowed.
    Auto,
    /// GPU adapter only.
    Gpu,
    /// Built-in CPU kernels.
    Cpu,
}

/// Reconstruction stage parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconstructionConfig {
    /// Reconstructed frame pool capacity.
    pub frame_pool_slots: usize,
    /// Side length of the square sector image, pixels (multiple of 4).
    pub sector_size: u32,
    /// Multiplier applied to the log magnitude.
    pub scale_factor: f32,
    /// DC noise floor subtracted after scaling.
    pub noise_floor: f32,
    /// Blend each frame with the previous one.
    pub averaging: bool,
    /// Weight of the previous frame when averaging.
    pub prev_weight: f32,
    /// Weight of the current frame when averaging.
    pub curr_weight: f32,
    /// Level mapped to black.
    pub black_level: f32,
    /// Level mapped to white.
    pub white_level: f32,
    /// Invert grey levels.
    pub invert: bool,
    /// Base display rotation, degrees.
    pub display_angle_deg: f32,
    /// Case-insensitive adapter name fragments, most preferred first.
    pub compute_preference: Vec<String>,
    /// Use the built-in CPU kernels when no adapter qualifies.
    pub allow_cpu_fallback: bool,
    /// Compute backend selection.
    pub backend: BackendChoice,
}

impl Default for ReconstructionConfig {
    fn default() -> Self {
        Self {
            frame_pool_slots: 32,
            sector_size: 512,
            scale_factor: 2.0,
            noise_floor: 40.0,
            averaging: false,
            prev_weight: 0.5,
            curr_weight: 0.5,
            black_level: 0.0,
            white_level: 255.0,
            invert: false,
            display_angle_deg: 0.0,
            compute_preference: vec![
                "intel".to_string(),
                "amd".to_string(),
                "nvidia".to_string(),
                "apple".to_string(),
            ],
            allow_cpu_fallback: true,
            backend: BackendChoice::Auto,
        }
    }
}

/// Playback of captured raw buffers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// 1.0 = recorded rate, 0.0 = paused.
    pub speed: f64,
    /// Restart from the first buffer at the end.
    pub looped: bool,
    /// Interval between buffers at speed 1.0.
    #[serde(with = "humantime_serde")]
    pub base_period: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            speed: 1.0,
            looped: false,
            base_period: Duration::from_millis(4),
        }
    }
}

/// Logging output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive (trace, debug, info, warn, error).
    pub level: String,
    /// Emit JSON lines instead of text.
    pub json: bool,
    /// Colour the text output.
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            ansi: true,
        }
    }
}

impl Settings {
    /// Load defaults, then the optional TOML file, then environment overrides.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(OctError::Configuration(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let settings: Settings = figment.extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a TOML string on top of the defaults.
    pub fn from_toml_str(contents: &str) -> AppResult<Self> {
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::string(contents))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Render the effective settings as TOML, loadable again with [`Settings::load`].
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| OctError::Configuration(format!("cannot serialize settings: {e}")))
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> AppResult<()> {
        let acq = &self.acquisition;
        let rec = &self.reconstruction;
        let angle = &self.angle;
        let dev = &self.device;

        limits::validate_pool_slots("raw", acq.raw_pool_slots)?;
        limits::validate_pool_slots("frame", rec.frame_pool_slots)?;
        limits::validate_raw_buffer(acq.lines_per_buffer, acq.record_length)?;
        limits::validate_sector_size(rec.sector_size, 1)?;

        if acq.record_length < 4 || !acq.record_length.is_power_of_two() {
            return Err(invalid(format!(
                "record_length {} must be a power of two >= 4",
                acq.record_length
            )));
        }
        if acq.encoder_record_length < 3 {
            return Err(invalid("encoder_record_length must be at least 3"));
        }
        if acq.lines_per_buffer == 0 {
            return Err(invalid("lines_per_buffer must be non-zero"));
        }
        if acq.stall_threshold == 0 {
            return Err(invalid("stall_threshold must be non-zero"));
        }
        if acq.wait_timeout.is_zero() {
            return Err(invalid("wait_timeout must be non-zero"));
        }
        if dev.lines_per_revolution == 0 {
            return Err(invalid("lines_per_revolution must be non-zero"));
        }
        if dev.aline_length_px == 0 || dev.aline_length_px as usize > acq.record_length / 2 {
            return Err(invalid(format!(
                "aline_length_px {} must be in 1..={}",
                dev.aline_length_px,
                acq.record_length / 2
            )));
        }
        if rec.sector_size % 4 != 0 {
            return Err(invalid(format!(
                "sector_size {} must be a multiple of 4",
                rec.sector_size
            )));
        }
        if rec.averaging && ((rec.prev_weight + rec.curr_weight) - 1.0).abs() > 1e-3 {
            return Err(invalid(format!(
                "averaging weights must sum to 1 (prev {} + curr {})",
                rec.prev_weight, rec.curr_weight
            )));
        }
        if rec.white_level <= rec.black_level {
            return Err(invalid(format!(
                "white_level {} must exceed black_level {}",
                rec.white_level, rec.black_level
            )));
        }
        if angle.gearing_ratio <= 0.0 {
            return Err(invalid("gearing_ratio must be positive"));
        }
        if angle.min_angle_change >= angle.direction_threshold {
            return Err(invalid(
                "min_angle_change must be smaller than direction_threshold",
            ));
        }
        if angle.initial_cal_max <= angle.initial_cal_min {
            return Err(invalid("initial_cal_max must exceed initial_cal_min"));
        }
        if self.playback.speed < 0.0 {
            return Err(invalid("playback speed must not be negative"));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> OctError {
    OctError::Configuration(message.into())
}
