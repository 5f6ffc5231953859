//! Encoder record to angular position.
//!
//! Each A-line carries a short record of the rotary encoder channel. The
//! record is reduced to one calibrated position in `[0, lines_per_revolution)`.
//! During the first revolutions the calibration range is learned from the
//! signal itself (auto-ranging); afterwards samples are clamped to it.

use serde::Serialize;

use super::WRAP_FRACTION;
use crate::config::AngleConfig;

/// Encoder calibration window and gearing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CalibrationState {
    /// Lowest raw encoder value seen.
    pub cal_min: f64,
    /// Highest raw encoder value seen.
    pub cal_max: f64,
    /// Encoder revolutions per catheter revolution.
    pub gearing_ratio: f64,
    /// Angle counts per revolution.
    pub lines_per_revolution: u32,
}

/// Maps raw encoder records to angle counts.
#[derive(Debug, Clone)]
pub struct EncoderCalibrator {
    config: AngleConfig,
    state: CalibrationState,
    auto_ranging: bool,
    range_seeded: bool,
    revolutions: u32,
    last_raw_angle: Option<f64>,
    revolution_offset: f64,
    last_angle: f64,
    rejected: u64,
}

impl EncoderCalibrator {
    /// Calibrator seeded from `config`, auto-ranging.
    #[must_use]
    pub fn new(config: &AngleConfig, lines_per_revolution: u32) -> Self {
        let mut calibrator = Self {
            state: CalibrationState {
                cal_min: config.initial_cal_min,
                cal_max: config.initial_cal_max,
                gearing_ratio: config.gearing_ratio,
                lines_per_revolution,
            },
            config: config.clone(),
            auto_ranging: false,
            range_seeded: false,
            revolutions: 0,
            last_raw_angle: None,
            revolution_offset: 0.0,
            last_angle: 0.0,
            rejected: 0,
        };
        calibrator.reset_for_device(lines_per_revolution);
        calibrator
    }

    /// Restart calibration for a (possibly different) device.
    pub fn reset_for_device(&mut self, lines_per_revolution: u32) {
        self.state = CalibrationState {
            cal_min: self.config.initial_cal_min,
            cal_max: self.config.initial_cal_max,
            gearing_ratio: self.config.gearing_ratio,
            lines_per_revolution,
        };
        self.auto_ranging = self.config.auto_range_revolutions > 0;
        self.range_seeded = false;
        self.revolutions = 0;
        self.last_raw_angle = None;
        self.revolution_offset = 0.0;
        self.last_angle = 0.0;
    }

    /// Reduce one encoder record to a calibrated position.
    ///
    /// Records that are too short, or whose first and last samples differ by
    /// more than the allowed slew, are rejected and the previous position is
    /// returned unchanged.
    pub fn compute_angle(&mut self, record: &[u16]) -> f64 {
        let len = record.len();
        if len < 3 {
            self.rejected += 1;
            return self.last_angle;
        }
        let slew = record[0].abs_diff(record[len - 1]);
        if slew > self.config.max_slew {
            self.rejected += 1;
            tracing::trace!(slew, "Encoder record rejected");
            return self.last_angle;
        }

        let third = len / 3;
        let central = &record[third..len - third];
        let mut value =
            central.iter().map(|&s| f64::from(s)).sum::<f64>() / central.len() as f64;

        if self.auto_ranging {
            if self.range_seeded {
                self.state.cal_min = self.state.cal_min.min(value);
                self.state.cal_max = self.state.cal_max.max(value);
            } else {
                self.state.cal_min = value;
                self.state.cal_max = value;
                self.range_seeded = true;
            }
        } else {
            value = value.clamp(self.state.cal_min, self.state.cal_max);
        }

        let lpr = f64::from(self.state.lines_per_revolution);
        let raw_angle = lpr * (value - self.state.cal_min + 1.0)
            / (self.state.cal_max - self.state.cal_min + 2.0);

        if let Some(previous) = self.last_raw_angle {
            let delta = raw_angle - previous;
            let per_turn = lpr / self.state.gearing_ratio;
            if delta < -WRAP_FRACTION * lpr {
                self.revolution_offset = (self.revolution_offset + per_turn).rem_euclid(lpr);
                self.count_revolution();
            } else if delta > WRAP_FRACTION * lpr {
                self.revolution_offset = (self.revolution_offset - per_turn).rem_euclid(lpr);
                self.count_revolution();
            }
        }
        self.last_raw_angle = Some(raw_angle);

        let angle =
            (raw_angle / self.state.gearing_ratio + self.revolution_offset).rem_euclid(lpr);
        self.last_angle = angle;
        angle
    }

    fn count_revolution(&mut self) {
        self.revolutions = self.revolutions.saturating_add(1);
        if self.auto_ranging && self.revolutions >= self.config.auto_range_revolutions {
            self.finish_auto_ranging();
        }
    }

    /// Freeze the learned calibration range.
    pub fn finish_auto_ranging(&mut self) {
        if !self.auto_ranging {
            return;
        }
        self.auto_ranging = false;
        if !self.range_seeded || self.state.cal_max <= self.state.cal_min {
            tracing::warn!(
                cal_min = self.state.cal_min,
                cal_max = self.state.cal_max,
                "Encoder auto-ranging saw no usable range; keeping configured range"
            );
            self.state.cal_min = self.config.initial_cal_min;
            self.state.cal_max = self.config.initial_cal_max;
            return;
        }
        tracing::info!(
            cal_min = self.state.cal_min,
            cal_max = self.state.cal_max,
            revolutions = self.revolutions,
            "Encoder auto-ranging complete"
        );
    }

    /// Copy of the calibration.
    #[must_use]
    pub fn state(&self) -> CalibrationState {
        self.state
    }

    /// True while the calibration window is still expanding.
    #[must_use]
    pub fn is_auto_ranging(&self) -> bool {
        self.auto_ranging
    }

    /// Records dropped by the length or slew check.
    #[must_use]
    pub fn rejected_samples(&self) -> u64 {
        self.rejected
    }

    /// Encoder wraps seen since the last reset.
    #[must_use]
    pub fn revolutions(&self) -> u32 {
        self.revolutions
    }

    /// Angle returned by the last accepted record.
    #[must_use]
    pub fn last_angle(&self) -> f64 {
        self.last_angle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(lines: u32) -> EncoderCalibrator {
        let config = AngleConfig {
            auto_range_revolutions: 0,
            initial_cal_min: 0.0,
            initial_cal_max: 1022.0,
            ..AngleConfig::default()
        };
        EncoderCalibrator::new(&config, lines)
    }

    #[test]
    fn test_angle_formula_with_fixed_range() {
        let mut cal = fixed(1024);
        // 1024 * (510 - 0 + 1) / (1022 + 2) = 511
        let angle = cal.compute_angle(&[510; 12]);
        assert!((angle - 511.0).abs() < 1e-9);
    }

    #[test]
    fn test_uses_central_third_average() {
        let mut cal = fixed(1024);
        let mut record = [510u16; 12];
        record[0] = 400;
        record[11] = 400;
        record[1] = 0;
        record[10] = 0;
        let angle = cal.compute_angle(&record);
        assert!((angle - 511.0).abs() < 1e-9);
    }

    #[test]
    fn test_slew_rejection_keeps_previous_angle() {
        let mut cal = fixed(1024);
        let before = cal.compute_angle(&[510; 12]);
        let mut noisy = [510u16; 12];
        noisy[11] = 510 + 5_000;
        assert_eq!(cal.compute_angle(&noisy), before);
        assert_eq!(cal.rejected_samples(), 1);
    }

    #[test]
    fn test_short_record_rejected() {
        let mut cal = fixed(1024);
        assert_eq!(cal.compute_angle(&[1, 2]), 0.0);
        assert_eq!(cal.rejected_samples(), 1);
    }

    #[test]
    fn test_fixed_range_clamps() {
        let mut cal = fixed(1024);
        let top = cal.compute_angle(&[5_000; 9]);
        // Clamped to cal_max: 1024 * 1023 / 1024
        assert!((top - 1023.0).abs() < 1e-9);
        assert_eq!(cal.state().cal_max, 1022.0);
    }

    #[test]
    fn test_auto_ranging_expands_then_clamps() {
        let config = AngleConfig {
            auto_range_revolutions: 3,
            ..AngleConfig::default()
        };
        let mut cal = EncoderCalibrator::new(&config, 512);
        assert!(cal.is_auto_ranging());
        cal.compute_angle(&[30_000; 9]);
        assert_eq!(cal.state().cal_min, 30_000.0);
        cal.compute_angle(&[20_000; 9]);
        assert_eq!(cal.state().cal_min, 20_000.0);
        cal.compute_angle(&[40_000; 9]);
        assert_eq!(cal.state().cal_max, 40_000.0);

        cal.finish_auto_ranging();
        assert!(!cal.is_auto_ranging());
        let low = cal.compute_angle(&[10_000; 9]);
        assert_eq!(cal.state().cal_min, 20_000.0);
        // Clamped to cal_min: 512 * 1 / 20_002
        assert!((low - 512.0 / 20_002.0).abs() < 1e-9);
    }

    #[test]
    fn test_auto_ranging_ends_after_revolutions() {
        let config = AngleConfig {
            auto_range_revolutions: 2,
            max_slew: u16::MAX,
            ..AngleConfig::default()
        };
        let mut cal = EncoderCalibrator::new(&config, 100);
        for _ in 0..3 {
            for raw in (0..=60_000u16).step_by(2_000) {
                cal.compute_angle(&[raw; 6]);
            }
        }
        assert!(!cal.is_auto_ranging());
        assert!(cal.revolutions() >= 2);
        assert_eq!(cal.state().cal_min, 0.0);
        assert_eq!(cal.state().cal_max, 60_000.0);
    }

    #[test]
    fn test_output_always_in_range() {
        let config = AngleConfig {
            gearing_ratio: 2.0,
            auto_range_revolutions: 0,
            max_slew: u16::MAX,
            ..AngleConfig::default()
        };
        let mut cal = EncoderCalibrator::new(&config, 256);
        for turn in 0..4u32 {
            for step in 0..64u32 {
                let raw = ((step * 1_024 + turn) % 65_536) as u16;
                let angle = cal.compute_angle(&[raw; 6]);
                assert!((0.0..256.0).contains(&angle), "angle {angle} out of range");
            }
        }
    }

    #[test]
    fn test_reset_restores_configured_range() {
        let mut cal = EncoderCalibrator::new(&AngleConfig::default(), 512);
        cal.compute_angle(&[1_000; 9]);
        cal.reset_for_device(1024);
        let state = cal.state();
        assert_eq!(state.lines_per_revolution, 1024);
        assert_eq!(state.cal_min, 0.0);
        assert_eq!(state.cal_max, 65_535.0);
        assert!(cal.is_auto_ranging());
    }
}
