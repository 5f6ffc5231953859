//! Catheter unwind compensation.
//!
//! The imaging tip lags the motor by a wind angle. When the motor reverses,
//! the tip keeps still until the drive shaft has unwound that much, so the
//! display rotation has to absorb the lag once per reversal.

use serde::Serialize;

use super::{normalize_degrees, wrapped_delta, Direction};

/// Extra unwind for catheters that wind up a full half-turn.
const LARGE_UNWIND_EXTRA_DEG: f64 = 180.0;

/// Wind angles at or below this are treated as zero.
const MIN_WIND_ANGLE_DEG: f64 = 1e-3;

/// Unwind state machine phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum UnwindPhase {
    /// No position seen yet.
    #[default]
    Idle,
    /// Tracking position, waiting for the catheter to reverse.
    WaitingForDirectionChange,
    /// Accumulating motion in the new direction.
    Unwinding,
}

/// Read-only view of the state machine for telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct UnwindState {
    /// Current phase.
    pub phase: UnwindPhase,
    /// Correction is active.
    pub enabled: bool,
    /// Large-unwind mode adds half a turn to the wind angle.
    pub large_unwind: bool,
    /// Wind angle, degrees.
    pub wind_angle_deg: f64,
    /// Last position seen, degrees.
    pub current_angle_deg: f64,
    /// Amount still to travel before the offset is applied.
    pub remaining_unwind_deg: f64,
    /// Correction applied to the display angle, degrees.
    pub correction_offset_deg: f64,
    /// Direction of the last update.
    pub current_direction: Direction,
    /// Direction when winding began.
    pub initial_direction: Direction,
}

/// Tracks catheter windup and yields a display correction.
#[derive(Debug, Clone, Default)]
pub struct UnwindStateMachine {
    phase: UnwindPhase,
    enabled: bool,
    large_unwind: bool,
    wind_angle_deg: f64,
    current_angle_deg: f64,
    unwound_deg: f64,
    correction_offset_deg: f64,
    current_direction: Direction,
    initial_direction: Direction,
}

impl UnwindStateMachine {
    /// Machine with the given wind angle and modes.
    #[must_use]
    pub fn new(wind_angle_deg: f64, large_unwind: bool, enabled: bool) -> Self {
        Self {
            enabled,
            large_unwind,
            wind_angle_deg: wind_angle_deg.max(0.0),
            ..Self::default()
        }
    }

    /// Feed the current catheter position in degrees. Returns true when the
    /// accumulated unwind was folded into the correction offset.
    pub fn update(&mut self, position_deg: f64) -> bool {
        let position = normalize_degrees(position_deg);
        if self.phase == UnwindPhase::Idle {
            self.current_angle_deg = position;
            self.phase = UnwindPhase::WaitingForDirectionChange;
            return false;
        }

        let delta = wrapped_delta(position, self.current_angle_deg, 360.0);
        self.current_angle_deg = position;
        let moving = Direction::from_delta(delta);

        if !self.is_active() {
            if let Some(direction) = moving {
                self.current_direction = direction;
            }
            return false;
        }

        match self.phase {
            UnwindPhase::WaitingForDirectionChange => {
                let Some(direction) = moving else {
                    return false;
                };
                if direction == self.current_direction {
                    return false;
                }
                self.current_direction = direction;
                self.initial_direction = direction;
                self.unwound_deg = delta.abs();
                self.phase = UnwindPhase::Unwinding;
                self.try_complete()
            }
            UnwindPhase::Unwinding => {
                self.unwound_deg += delta * self.initial_direction.sign();
                if self.unwound_deg < 0.0 {
                    // Reversed again before the lag was taken up.
                    self.current_direction = self.initial_direction.reversed();
                    self.unwound_deg = 0.0;
                    self.phase = UnwindPhase::WaitingForDirectionChange;
                    return false;
                }
                self.try_complete()
            }
            UnwindPhase::Idle => false,
        }
    }

    fn try_complete(&mut self) -> bool {
        if self.unwound_deg < self.target_deg() {
            return false;
        }
        self.correction_offset_deg = normalize_degrees(
            self.correction_offset_deg + self.unwound_deg * self.initial_direction.sign(),
        );
        tracing::debug!(
            offset_deg = self.correction_offset_deg,
            direction = ?self.initial_direction,
            "Unwind complete"
        );
        self.unwound_deg = 0.0;
        self.phase = UnwindPhase::WaitingForDirectionChange;
        true
    }

    fn is_active(&self) -> bool {
        self.enabled && self.wind_angle_deg > MIN_WIND_ANGLE_DEG
    }

    fn target_deg(&self) -> f64 {
        if self.large_unwind {
            self.wind_angle_deg + LARGE_UNWIND_EXTRA_DEG
        } else {
            self.wind_angle_deg
        }
    }

    /// Change the wind angle. Resets all state, including the offset.
    pub fn set_wind_angle(&mut self, wind_angle_deg: f64) {
        *self = Self::new(wind_angle_deg, self.large_unwind, self.enabled);
    }

    /// Toggle large-unwind mode. Resets all state, including the offset.
    pub fn enable_large_unwind(&mut self, large_unwind: bool) {
        *self = Self::new(self.wind_angle_deg, large_unwind, self.enabled);
    }

    /// Turn the correction on or off. Disabling abandons an unwind in progress.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled && self.phase == UnwindPhase::Unwinding {
            self.unwound_deg = 0.0;
            self.phase = UnwindPhase::WaitingForDirectionChange;
        }
    }

    /// True while unwinding.
    #[must_use]
    pub fn is_unwinding(&self) -> bool {
        self.phase == UnwindPhase::Unwinding
    }

    /// Degrees left to travel before the correction applies.
    #[must_use]
    pub fn remaining_unwind(&self) -> f64 {
        if self.phase == UnwindPhase::Unwinding {
            (self.target_deg() - self.unwound_deg).max(0.0)
        } else {
            0.0
        }
    }

    /// Correction folded in by completed unwinds, degrees in `[0, 360)`.
    #[must_use]
    pub fn offset(&self) -> f64 {
        self.correction_offset_deg
    }

    /// Direction of the last update.
    #[must_use]
    pub fn current_direction(&self) -> Direction {
        self.current_direction
    }

    /// Direction the current (or last) unwind started in.
    #[must_use]
    pub fn initial_direction(&self) -> Direction {
        self.initial_direction
    }

    /// Copy of the current state.
    #[must_use]
    pub fn state(&self) -> UnwindState {
        UnwindState {
            phase: self.phase,
            enabled: self.enabled,
            large_unwind: self.large_unwind,
            wind_angle_deg: self.wind_angle_deg,
            current_angle_deg: self.current_angle_deg,
            remaining_unwind_deg: self.remaining_unwind(),
            correction_offset_deg: self.correction_offset_deg,
            current_direction: self.current_direction,
            initial_direction: self.initial_direction,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sweep(machine: &mut UnwindStateMachine, positions: impl IntoIterator<Item = f64>) -> usize {
        positions
            .into_iter()
            .filter(|&p| machine.update(p))
            .count()
    }

    #[test]
    fn test_first_update_only_records_position() {
        let mut machine = UnwindStateMachine::new(30.0, false, true);
        assert!(!machine.update(100.0));
        assert_eq!(machine.state().phase, UnwindPhase::WaitingForDirectionChange);
        assert_eq!(machine.state().current_angle_deg, 100.0);
    }

    #[test]
    fn test_monotonic_sweep_applies_offset_once() {
        let mut machine = UnwindStateMachine::new(30.0, false, true);
        let applied = sweep(&mut machine, (0..=40).map(f64::from));
        assert_eq!(applied, 1);
        assert!(!machine.is_unwinding());
        assert!((machine.offset() - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_reversal_before_wind_angle_cancels() {
        let mut machine = UnwindStateMachine::new(30.0, false, true);
        let forward = sweep(&mut machine, (0..=10).map(f64::from));
        assert_eq!(forward, 0);
        assert!(machine.is_unwinding());

        // Back past the start: accumulator would go negative.
        let backward = sweep(&mut machine, (0..10).rev().map(f64::from).chain([359.0]));
        assert_eq!(backward, 0);
        assert!(!machine.is_unwinding());
        assert_eq!(machine.remaining_unwind(), 0.0);
        assert_eq!(machine.offset(), 0.0);
        assert_eq!(machine.current_direction(), Direction::CounterClockwise);
    }

    #[test]
    fn test_large_unwind_adds_half_turn() {
        let mut machine = UnwindStateMachine::new(30.0, true, true);
        let short = sweep(&mut machine, (0..=100).map(f64::from));
        assert_eq!(short, 0);
        assert!((machine.remaining_unwind() - 110.0).abs() < 1e-9);
        let rest = sweep(&mut machine, (101..=260).map(|p| f64::from(p % 360)));
        assert_eq!(rest, 1);
    }

    #[test]
    fn test_sweep_across_zero_uses_wrapped_delta() {
        let mut machine = UnwindStateMachine::new(20.0, false, true);
        let positions = (350..360).chain(0..15).map(f64::from);
        assert_eq!(sweep(&mut machine, positions), 1);
    }

    #[test]
    fn test_counter_clockwise_offset_is_negative_direction() {
        let mut machine = UnwindStateMachine::new(30.0, false, true);
        let positions = (0..=40).map(|p| f64::from((360 - p) % 360));
        assert_eq!(sweep(&mut machine, positions), 1);
        assert!((machine.offset() - 330.0).abs() < 1e-9);
    }

    #[test]
    fn test_disabled_only_tracks_direction() {
        let mut machine = UnwindStateMachine::new(30.0, false, false);
        assert_eq!(sweep(&mut machine, (0..=90).map(f64::from)), 0);
        assert_eq!(machine.current_direction(), Direction::Clockwise);
        assert_eq!(machine.offset(), 0.0);
    }

    #[test]
    fn test_zero_wind_angle_never_applies() {
        let mut machine = UnwindStateMachine::new(0.0, false, true);
        assert_eq!(sweep(&mut machine, (0..=90).map(f64::from)), 0);
    }

    #[test]
    fn test_set_wind_angle_resets_offset() {
        let mut machine = UnwindStateMachine::new(30.0, false, true);
        sweep(&mut machine, (0..=40).map(f64::from));
        assert!(machine.offset() > 0.0);
        machine.set_wind_angle(45.0);
        assert_eq!(machine.offset(), 0.0);
        assert_eq!(machine.state().phase, UnwindPhase::Idle);
        assert_eq!(machine.state().wind_angle_deg, 45.0);
    }
}
