//! Rotation direction detection from the smoothed encoder position.

use super::{wrapped_delta, Direction};

/// Direction detection thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectionConfig {
    /// Only every Nth call is sampled.
    pub debounce: u32,
    /// Below this change (counts) the catheter is considered stopped.
    pub min_angle_change: f64,
    /// At or above this change (counts) a direction is reported.
    pub direction_threshold: f64,
}

impl Default for DirectionConfig {
    fn default() -> Self {
        Self {
            debounce: 16,
            min_angle_change: 1.0,
            direction_threshold: 4.0,
        }
    }
}

/// Debounced Stopped / Clockwise / CounterClockwise classifier.
///
/// Changes between `min_angle_change` and `direction_threshold` keep the
/// previous state, which gives the classifier hysteresis.
#[derive(Debug, Clone)]
pub struct DirectionTracker {
    config: DirectionConfig,
    lines_per_revolution: f64,
    calls: u32,
    last_position: Option<f64>,
    direction: Direction,
}

impl DirectionTracker {
    /// Tracker for `lines_per_revolution` counts per turn.
    #[must_use]
    pub fn new(config: DirectionConfig, lines_per_revolution: u32) -> Self {
        Self {
            config,
            lines_per_revolution: f64::from(lines_per_revolution),
            calls: 0,
            last_position: None,
            direction: Direction::Stopped,
        }
    }

    /// Returns the new direction when it changed on this call.
    pub fn update_direction(&mut self, position: f64) -> Option<Direction> {
        self.calls = self.calls.wrapping_add(1);
        if self.calls % self.config.debounce.max(1) != 0 {
            return None;
        }

        let last = self.last_position.replace(position)?;

        let diff = wrapped_delta(position, last, self.lines_per_revolution);
        let magnitude = diff.abs();
        let next = if magnitude < self.config.min_angle_change {
            Direction::Stopped
        } else if magnitude >= self.config.direction_threshold {
            if diff > 0.0 {
                Direction::Clockwise
            } else {
                Direction::CounterClockwise
            }
        } else {
            self.direction
        };

        if next == self.direction {
            return None;
        }
        tracing::debug!(from = ?self.direction, to = ?next, "Rotation direction changed");
        self.direction = next;
        Some(next)
    }

    /// Current direction.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Forget history, keeping the thresholds.
    pub fn reset(&mut self, lines_per_revolution: u32) {
        *self = Self::new(self.config, lines_per_revolution);
    }
}
