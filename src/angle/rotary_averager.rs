//! Moving average for values that wrap around, such as encoder angles.
//!
//! A plain moving average of 359° and 1° gives 180°. Here every sample is
//! kept in an "unwrapped" form next to its neighbours before it enters the
//! running sum, and the whole buffer is slid by one range whenever the average
//! itself leaves `[0, range)`.

/// Samples whose distance from the current average exceeds this fraction of
/// the range are treated as having crossed the wrap point.
const WRAP_FRACTION: f64 = 0.75;

/// Moving average over a circular domain `[0, range)`.
#[derive(Debug, Clone, Default)]
pub struct RotaryAverager {
    /// Unwrapped samples, circular.
    values: Vec<f64>,
    next: usize,
    sum: f64,
    range: f64,
    last_average: f64,
    primed: bool,
    configured: bool,
}

impl RotaryAverager {
    /// Averager of `width` samples over `[0, range)`.
    #[must_use]
    pub fn new(width: usize, range: f64) -> Self {
        let mut averager = Self::default();
        averager.reset(width, range);
        averager
    }

    /// Configure filter width and wraparound modulus, discarding history.
    pub fn reset(&mut self, width: usize, range: f64) {
        self.values.clear();
        self.values.resize(width, 0.0);
        self.next = 0;
        self.sum = 0.0;
        self.range = range;
        self.last_average = 0.0;
        self.primed = false;
        self.configured = range > 0.0;
    }

    /// False until configured with a positive range.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.configured
    }

    /// Number of samples averaged.
    #[must_use]
    pub fn width(&self) -> usize {
        self.values.len()
    }

    /// Feed one sample and return the wrap-aware average in `[0, range)`.
    ///
    /// Returns 0 before [`reset`](Self::reset) has been called and the input
    /// unchanged when the width is 0 or 1.
    pub fn next_value(&mut self, new_value: f64) -> f64 {
        if !self.configured {
            return 0.0;
        }
        let width = self.values.len();
        if width <= 1 {
            return new_value;
        }

        if !self.primed {
            self.values.fill(new_value);
            self.sum = new_value * width as f64;
            self.last_average = new_value;
            self.primed = true;
            return new_value;
        }

        let mut value = new_value;
        let delta = value - self.last_average;
        if delta.abs() > WRAP_FRACTION * self.range {
            if delta > 0.0 {
                value -= self.range;
            } else {
                value += self.range;
            }
        }

        self.sum += value - self.values[self.next];
        self.values[self.next] = value;
        self.next = (self.next + 1) % width;

        let mut average = self.sum / width as f64;
        if average < 0.0 {
            self.slide(self.range);
            average += self.range;
        } else if average >= self.range {
            self.slide(-self.range);
            average -= self.range;
        }

        self.last_average = average;
        average
    }

    fn slide(&mut self, by: f64) {
        for value in &mut self.values {
            *value += by;
        }
        self.sum += by * self.values.len() as f64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn circular_distance(a: f64, b: f64, range: f64) -> f64 {
        let d = (a - b).rem_euclid(range);
        d.min(range - d)
    }

    #[test]
    fn test_uninitialized_returns_zero() {
        let mut averager = RotaryAverager::default();
        assert_eq!(averager.next_value(123.0), 0.0);
    }

    #[test]
    fn test_width_one_is_passthrough() {
        let mut averager = RotaryAverager::new(1, 360.0);
        assert_eq!(averager.next_value(10.0), 10.0);
        assert_eq!(averager.next_value(350.0), 350.0);
    }

    #[test]
    fn test_constant_input_converges_to_value() {
        let mut averager = RotaryAverager::new(4, 1024.0);
        averager.next_value(100.0);
        averager.next_value(300.0);
        let mut last = 0.0;
        for _ in 0..4 {
            last = averager.next_value(700.0);
        }
        assert!((last - 700.0).abs() < 1e-9);
    }

    #[test]
    fn test_wrap_crossing_is_not_naive_mean() {
        let mut averager = RotaryAverager::new(4, 1024.0);
        let mut result = 0.0;
        for value in [1020.0, 1022.0, 2.0, 4.0] {
            result = averager.next_value(value);
        }
        assert!(
            circular_distance(result, 1012.0, 1024.0) <= 16.0,
            "expected near 1012 (mod 1024), got {result}"
        );
        assert!(circular_distance(result, 512.0, 1024.0) > 400.0);
    }

    #[test]
    fn test_degrees_around_zero() {
        let mut averager = RotaryAverager::new(2, 360.0);
        averager.next_value(359.0);
        let average = averager.next_value(1.0);
        assert!(circular_distance(average, 0.0, 360.0) < 1.0 + 1e-9);
    }

    #[test]
    fn test_output_stays_in_range_for_slow_walks() {
        let range = 1024.0;
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for width in [2usize, 3, 4, 8, 16] {
            let mut averager = RotaryAverager::new(width, range);
            let mut position: f64 = rng.gen_range(0.0..range);
            for _ in 0..5_000 {
                let step: f64 = rng.gen_range(-0.3 * range..0.3 * range);
                position = (position + step).rem_euclid(range);
                let average = averager.next_value(position);
                assert!(
                    (0.0..range).contains(&average),
                    "width {width}: average {average} left [0, {range})"
                );
            }
        }
    }

    #[test]
    fn test_reset_discards_history() {
        let mut averager = RotaryAverager::new(4, 360.0);
        averager.next_value(90.0);
        averager.next_value(100.0);
        averager.reset(4, 360.0);
        assert_eq!(averager.next_value(200.0), 200.0);
    }
}
