//! Catheter angle tracking.
//!
//! Encoder records flow through four stages per A-line:
//!
//! 1. [`EncoderCalibrator`] reduces the record to a calibrated position
//! 2. [`RotaryAverager`] smooths it without breaking at the wrap point
//! 3. [`DirectionTracker`] classifies the rotation direction
//! 4. [`UnwindStateMachine`] tracks the drive-shaft lag after reversals
//!
//! [`AngleTracker`] owns one of each and is driven from the reconstruction
//! thread. A snapshot of its state is published behind a mutex for readers on
//! other threads.

pub mod direction;
pub mod encoder;
pub mod rotary_averager;
pub mod unwind;

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

pub use direction::{DirectionConfig, DirectionTracker};
pub use encoder::{CalibrationState, EncoderCalibrator};
pub use rotary_averager::RotaryAverager;
pub use unwind::{UnwindPhase, UnwindState, UnwindStateMachine};

use crate::config::AngleConfig;
use crate::events::EventBus;

/// Differences larger than this fraction of a full turn are wrap crossings.
pub const WRAP_FRACTION: f64 = 0.75;

/// Deltas smaller than this (degrees) do not count as motion.
const MOTION_EPSILON_DEG: f64 = 1e-6;

/// Telemetry is republished every this many updates.
const TELEMETRY_INTERVAL: u64 = 64;

/// Catheter rotation direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum Direction {
    /// Not moving, or moving less than the minimum change.
    #[default]
    Stopped,
    /// Increasing encoder counts.
    Clockwise,
    /// Decreasing encoder counts.
    CounterClockwise,
}

impl Direction {
    /// Direction of a wrap-corrected position delta, `None` when not moving.
    #[must_use]
    pub fn from_delta(delta: f64) -> Option<Self> {
        if delta > MOTION_EPSILON_DEG {
            Some(Self::Clockwise)
        } else if delta < -MOTION_EPSILON_DEG {
            Some(Self::CounterClockwise)
        } else {
            None
        }
    }

    /// +1 clockwise, -1 counter-clockwise, 0 stopped.
    #[must_use]
    pub fn sign(self) -> f64 {
        match self {
            Self::Clockwise => 1.0,
            Self::CounterClockwise => -1.0,
            Self::Stopped => 0.0,
        }
    }

    /// Opposite direction; `Stopped` stays `Stopped`.
    #[must_use]
    pub fn reversed(self) -> Self {
        match self {
            Self::Clockwise => Self::CounterClockwise,
            Self::CounterClockwise => Self::Clockwise,
            Self::Stopped => Self::Stopped,
        }
    }
}

/// `new - old`, corrected for a crossing of the wrap point of `full_turn`.
#[must_use]
pub fn wrapped_delta(new: f64, old: f64, full_turn: f64) -> f64 {
    let delta = new - old;
    let limit = WRAP_FRACTION * full_turn;
    if delta > limit {
        delta - full_turn
    } else if delta < -limit {
        delta + full_turn
    } else {
        delta
    }
}

/// Wrap degrees into `[0, 360)`.
#[must_use]
pub fn normalize_degrees(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(360.0);
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Position of one A-line after all angle stages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AngleSample {
    /// Smoothed position in `[0, lines_per_revolution)`.
    pub position: f64,
    /// Row of the polar frame this A-line belongs to.
    pub line_index: usize,
    /// Tracked angle, degrees.
    pub angle_deg: f64,
    /// Current rotation direction.
    pub direction: Direction,
    /// Unwind correction currently in effect, degrees.
    pub correction_offset_deg: f64,
    /// The unwind correction was applied on this update.
    pub offset_applied: bool,
    /// This update completed a revolution.
    pub rotation_completed: bool,
}

/// Shared view of the tracker's state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AngleTelemetry {
    /// Encoder calibration in effect.
    pub calibration: CalibrationState,
    /// Calibration is still auto-ranging.
    pub auto_ranging: bool,
    /// Unwind state.
    pub unwind: UnwindState,
    /// Current rotation direction.
    pub direction: Direction,
    /// Revolutions since the last device reset.
    pub revolutions: u64,
    /// Encoder records rejected for slew.
    pub rejected_records: u64,
    /// Last tracked angle count.
    pub last_position: f64,
}

/// Cloneable handle to the latest [`AngleTelemetry`].
#[derive(Debug, Clone)]
pub struct TelemetryHandle(Arc<Mutex<AngleTelemetry>>);

impl TelemetryHandle {
    /// Copy of the latest telemetry.
    #[must_use]
    pub fn snapshot(&self) -> AngleTelemetry {
        *self.0.lock()
    }
}

/// Per-record angle tracking: calibration, averaging, direction and unwind.
pub struct AngleTracker {
    config: AngleConfig,
    lines_per_revolution: u32,
    calibrator: EncoderCalibrator,
    averager: RotaryAverager,
    direction: DirectionTracker,
    unwind: UnwindStateMachine,
    last_position: Option<f64>,
    revolutions: u64,
    updates: u64,
    events: Option<EventBus>,
    telemetry: Arc<Mutex<AngleTelemetry>>,
}

impl AngleTracker {
    /// Tracker for a device with `lines_per_revolution` A-lines.
    #[must_use]
    pub fn new(config: &AngleConfig, lines_per_revolution: u32) -> Self {
        let calibrator = EncoderCalibrator::new(config, lines_per_revolution);
        let unwind = UnwindStateMachine::new(
            config.wind_angle_deg,
            config.large_unwind,
            config.unwind_enabled,
        );
        let telemetry = AngleTelemetry {
            calibration: calibrator.state(),
            auto_ranging: calibrator.is_auto_ranging(),
            unwind: unwind.state(),
            direction: Direction::Stopped,
            revolutions: 0,
            rejected_records: 0,
            last_position: 0.0,
        };
        Self {
            config: config.clone(),
            lines_per_revolution,
            calibrator,
            averager: RotaryAverager::new(config.averager_width, f64::from(lines_per_revolution)),
            direction: DirectionTracker::new(direction_config(config), lines_per_revolution),
            unwind,
            last_position: None,
            revolutions: 0,
            updates: 0,
            events: None,
            telemetry: Arc::new(Mutex::new(telemetry)),
        }
    }

    /// Publish direction and rotation events on `events`.
    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Shared telemetry handle.
    #[must_use]
    pub fn telemetry(&self) -> TelemetryHandle {
        TelemetryHandle(Arc::clone(&self.telemetry))
    }

    /// Run one encoder record through every stage.
    pub fn update(&mut self, encoder_record: &[u16]) -> AngleSample {
        let lpr = f64::from(self.lines_per_revolution);
        let counts = self.calibrator.compute_angle(encoder_record);
        let position = self.averager.next_value(counts);

        if let Some(direction) = self.direction.update_direction(position) {
            if let Some(events) = &self.events {
                events.direction_changed(direction);
            }
        }

        let angle_deg = normalize_degrees(position * 360.0 / lpr);
        let offset_applied = self.unwind.update(angle_deg);

        let mut rotation_completed = false;
        if let Some(previous) = self.last_position.replace(position) {
            if (position - previous).abs() > WRAP_FRACTION * lpr {
                self.revolutions += 1;
                rotation_completed = true;
                if let Some(events) = &self.events {
                    events.full_rotation_completed(self.revolutions);
                }
            }
        }

        self.updates += 1;
        if rotation_completed || offset_applied || self.updates % TELEMETRY_INTERVAL == 0 {
            self.publish();
        }

        AngleSample {
            position,
            line_index: line_index(position, self.lines_per_revolution),
            angle_deg,
            direction: self.direction.direction(),
            correction_offset_deg: self.unwind.offset(),
            offset_applied,
            rotation_completed,
        }
    }

    /// Restart every stage for a device with a different geometry.
    pub fn reset(&mut self, lines_per_revolution: u32) {
        *self = Self {
            events: self.events.take(),
            telemetry: Arc::clone(&self.telemetry),
            ..Self::new(&self.config, lines_per_revolution)
        };
        self.publish();
    }

    /// Change the wind angle; resets the unwind state.
    pub fn set_wind_angle(&mut self, wind_angle_deg: f64) {
        self.config.wind_angle_deg = wind_angle_deg;
        self.unwind.set_wind_angle(wind_angle_deg);
        self.publish();
    }

    /// Switch large-unwind mode; resets the unwind state.
    pub fn enable_large_unwind(&mut self, large_unwind: bool) {
        self.config.large_unwind = large_unwind;
        self.unwind.enable_large_unwind(large_unwind);
        self.publish();
    }

    /// End auto-ranging early and freeze the calibration.
    pub fn finish_auto_ranging(&mut self) {
        self.calibrator.finish_auto_ranging();
        self.publish();
    }

    /// Current rotation direction.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction.direction()
    }

    /// Completed revolutions.
    #[must_use]
    pub fn revolutions(&self) -> u64 {
        self.revolutions
    }

    /// A-lines per revolution.
    #[must_use]
    pub fn lines_per_revolution(&self) -> u32 {
        self.lines_per_revolution
    }

    fn publish(&self) {
        *self.telemetry.lock() = AngleTelemetry {
            calibration: self.calibrator.state(),
            auto_ranging: self.calibrator.is_auto_ranging(),
            unwind: self.unwind.state(),
            direction: self.direction.direction(),
            revolutions: self.revolutions,
            rejected_records: self.calibrator.rejected_samples(),
            last_position: self.last_position.unwrap_or(0.0),
        };
    }
}

fn direction_config(config: &AngleConfig) -> DirectionConfig {
    DirectionConfig {
        debounce: config.direction_debounce,
        min_angle_change: config.min_angle_change,
        direction_threshold: config.direction_threshold,
    }
}

fn line_index(position: f64, lines_per_revolution: u32) -> usize {
    let max = lines_per_revolution.saturating_sub(1) as usize;
    if position <= 0.0 {
        return 0;
    }
    (position.floor() as usize).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventStreams;

    fn config() -> AngleConfig {
        AngleConfig {
            averager_width: 1,
            auto_range_revolutions: 0,
            initial_cal_min: 0.0,
            initial_cal_max: 510.0,
            direction_debounce: 1,
            max_slew: u16::MAX,
            ..AngleConfig::default()
        }
    }

    /// Raw encoder level that calibrates to roughly `line` out of 512.
    fn record_for(line: u32) -> Vec<u16> {
        vec![line as u16; 9]
    }

    #[test]
    fn test_wrapped_delta() {
        assert_eq!(wrapped_delta(10.0, 350.0, 360.0), 20.0);
        assert_eq!(wrapped_delta(350.0, 10.0, 360.0), -20.0);
        assert_eq!(wrapped_delta(100.0, 90.0, 360.0), 10.0);
    }

    #[test]
    fn test_normalize_degrees() {
        assert_eq!(normalize_degrees(-30.0), 330.0);
        assert_eq!(normalize_degrees(720.0), 0.0);
        assert_eq!(normalize_degrees(-1e-18), 0.0);
    }

    #[test]
    fn test_line_index_bounds() {
        assert_eq!(line_index(-0.5, 512), 0);
        assert_eq!(line_index(511.9, 512), 511);
        assert_eq!(line_index(600.0, 512), 511);
    }

    #[test]
    fn test_rotation_and_direction_events() {
        let (bus, mut streams) = EventBus::new(64);
        let mut tracker = AngleTracker::new(&config(), 512).with_events(bus);

        let mut completed = 0;
        for turn in 0..3u32 {
            for line in (0..510).step_by(10) {
                let sample = tracker.update(&record_for(line + turn % 2));
                assert!(sample.line_index < 512);
                if sample.rotation_completed {
                    completed += 1;
                }
            }
        }

        assert_eq!(completed, 2);
        assert_eq!(tracker.revolutions(), 2);
        assert_eq!(EventStreams::drain(&mut streams.rotation), vec![1, 2]);
        assert_eq!(
            EventStreams::drain(&mut streams.direction),
            vec![Direction::Clockwise]
        );
    }

    #[test]
    fn test_telemetry_tracks_unwind_offset() {
        let mut tracker = AngleTracker::new(&config(), 512);
        let telemetry = tracker.telemetry();
        let mut applied = false;
        for step in 0..100 {
            applied |= tracker.update(&record_for(step * 5)).offset_applied;
        }
        assert!(applied);
        let snapshot = telemetry.snapshot();
        assert!(snapshot.unwind.correction_offset_deg > 0.0);
        assert_eq!(snapshot.direction, Direction::Clockwise);
    }

    #[test]
    fn test_reset_keeps_telemetry_handle() {
        let mut tracker = AngleTracker::new(&config(), 512);
        let telemetry = tracker.telemetry();
        tracker.update(&record_for(100));
        tracker.reset(1024);
        assert_eq!(tracker.lines_per_revolution(), 1024);
        assert_eq!(telemetry.snapshot().calibration.lines_per_revolution, 1024);
        assert_eq!(telemetry.snapshot().revolutions, 0);
    }
}
