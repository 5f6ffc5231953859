//! Simulated acquisition board.
//!
//! Produces interferograms with a few fixed reflectors whose brightness
//! varies around the circumference, plus an encoder channel that ramps once
//! per catheter revolution. Buffers are paced at the configured line rate
//! unless the source is built [`unpaced`](SimulatedDaq::unpaced).

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f32::consts::TAU;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::{Acquired, AcquisitionParams, DataSource};
use crate::data::RawBuffer;
use crate::error::{AppResult, OctError};
use oct_pool::OverflowPolicy;

const DC_LEVEL: f32 = 32_768.0;
const ENCODER_MIN: f64 = 2_000.0;
const ENCODER_MAX: f64 = 62_000.0;
const ENCODER_NOISE: i32 = 2;

/// Injected failure used to exercise the stall and reset path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StallMode {
    /// Deliver normally.
    #[default]
    None,
    /// Stop delivering after `after` buffers; the next `configure` cures it.
    UntilReconfigure {
        /// Buffers delivered before the stall.
        after: u64,
    },
    /// Stop delivering after `after` buffers for good.
    Permanent {
        /// Buffers delivered before the stall.
        after: u64,
    },
}

#[derive(Debug, Clone, Copy)]
struct Reflector {
    /// Fringe cycles across one record, i.e. the FFT bin it lands in.
    cycles: f32,
    amplitude: f32,
    /// Relative brightness swing around the circumference.
    modulation: f32,
    lobes: f32,
}

/// Synthetic live board: reflectors in depth plus an encoder sawtooth.
pub struct SimulatedDaq {
    params: Option<AcquisitionParams>,
    rng: StdRng,
    reflectors: Vec<Reflector>,
    fringes: Vec<Vec<f32>>,
    noise: f32,
    line: u64,
    sequence: u64,
    filled: u64,
    paced: bool,
    reversed: bool,
    next_due: Option<Instant>,
    stall: StallMode,
}

impl std::fmt::Debug for SimulatedDaq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedDaq")
            .field("params", &self.params)
            .field("sequence", &self.sequence)
            .field("paced", &self.paced)
            .field("stall", &self.stall)
            .finish()
    }
}

impl SimulatedDaq {
    /// Unconfigured board with a reproducible noise `seed`.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            params: None,
            rng: StdRng::seed_from_u64(seed),
            reflectors: Vec::new(),
            fringes: Vec::new(),
            noise: 40.0,
            line: 0,
            sequence: 0,
            filled: 0,
            paced: true,
            reversed: false,
            next_due: None,
            stall: StallMode::None,
        }
    }

    /// Deliver buffers as fast as they are requested.
    #[must_use]
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }

    /// Rotate counter-clockwise (encoder counts down).
    #[must_use]
    pub fn reversed(mut self) -> Self {
        self.reversed = true;
        self
    }

    /// Inject stalls.
    #[must_use]
    pub fn with_stall(mut self, stall: StallMode) -> Self {
        self.stall = stall;
        self
    }

    /// Uniform noise amplitude in ADC counts.
    #[must_use]
    pub fn with_noise(mut self, amplitude: f32) -> Self {
        self.noise = amplitude.max(0.0);
        self
    }

    /// Buffers filled so far.
    #[must_use]
    pub fn buffers_filled(&self) -> u64 {
        self.filled
    }

    fn is_stalled(&self) -> bool {
        match self.stall {
            StallMode::None => false,
            StallMode::UntilReconfigure { after } | StallMode::Permanent { after } => {
                self.filled >= after
            }
        }
    }

    fn build_reflectors(&mut self, record_length: usize) {
        let n = record_length as f32;
        self.reflectors = vec![
            Reflector {
                cycles: (n / 16.0).round(),
                amplitude: 2_500.0,
                modulation: 0.2,
                lobes: 1.0,
            },
            Reflector {
                cycles: (n / 10.0).round(),
                amplitude: 1_500.0,
                modulation: 0.6,
                lobes: 3.0,
            },
            Reflector {
                cycles: (n / 7.0).round(),
                amplitude: 800.0,
                modulation: 0.9,
                lobes: 5.0,
            },
        ];
        self.fringes = self
            .reflectors
            .iter()
            .map(|r| {
                (0..record_length)
                    .map(|i| (TAU * r.cycles * i as f32 / n).cos())
                    .collect()
            })
            .collect();
    }

    /// Fraction of a revolution the catheter is at for global line `line`.
    fn rotation_fraction(&self, params: &AcquisitionParams, line: u64) -> f64 {
        let per_rotation = params.lines_per_rotation();
        let fraction = if per_rotation.is_finite() && per_rotation > 0.0 {
            (line as f64 / per_rotation).fract()
        } else {
            0.0
        };
        if self.reversed {
            1.0 - fraction
        } else {
            fraction
        }
    }

    fn fill(&mut self, params: &AcquisitionParams, raw: &mut RawBuffer) {
        let lines = raw.lines();
        for line in 0..lines {
            let fraction = self.rotation_fraction(params, self.line);
            let encoder_value = ENCODER_MIN + fraction * (ENCODER_MAX - ENCODER_MIN);
            let theta = (fraction as f32) * TAU;

            let (record, encoder) = raw.line_mut(line);
            for (i, sample) in record.iter_mut().enumerate() {
                let mut value = DC_LEVEL;
                for (reflector, fringe) in self.reflectors.iter().zip(&self.fringes) {
                    let brightness =
                        1.0 + reflector.modulation * (reflector.lobes * theta).sin();
                    value += reflector.amplitude * brightness * fringe[i];
                }
                if self.noise > 0.0 {
                    value += self.rng.gen_range(-self.noise..self.noise);
                }
                *sample = value.clamp(0.0, f32::from(u16::MAX)) as u16;
            }
            for sample in encoder.iter_mut() {
                let jitter = self.rng.gen_range(-ENCODER_NOISE..=ENCODER_NOISE);
                *sample = (encoder_value as i32 + jitter).clamp(0, i32::from(u16::MAX)) as u16;
            }
            self.line += 1;
        }
        raw.valid_lines = lines;
        raw.sequence = self.sequence;
        raw.acquired_at = Some(Instant::now());
        self.sequence += 1;
        self.filled += 1;
    }
}

impl DataSource for SimulatedDaq {
    fn name(&self) -> &str {
        "simulated"
    }

    fn configure(&mut self, params: &AcquisitionParams) -> AppResult<()> {
        if params.record_length == 0 || params.lines_per_buffer == 0 {
            return Err(OctError::Configuration(format!(
                "simulated board cannot run with {params:?}"
            )));
        }
        if let StallMode::UntilReconfigure { .. } = self.stall {
            if self.is_stalled() {
                info!(buffers = self.filled, "Simulated board recovered after reconfigure");
                self.stall = StallMode::None;
            }
        }
        self.build_reflectors(params.record_length);
        self.params = Some(params.clone());
        self.next_due = None;
        debug!(
            record_length = params.record_length,
            lines_per_buffer = params.lines_per_buffer,
            lines_per_rotation = params.lines_per_rotation(),
            "Simulated board configured"
        );
        Ok(())
    }

    fn acquire_next(&mut self, buffer: &mut RawBuffer, timeout: Duration) -> AppResult<Acquired> {
        let params = self
            .params
            .clone()
            .ok_or_else(|| OctError::Configuration("simulated board not configured".into()))?;

        if self.is_stalled() {
            thread::sleep(timeout);
            return Ok(Acquired::Empty);
        }

        if self.paced {
            let now = Instant::now();
            let due = *self.next_due.get_or_insert(now);
            if due > now {
                let wait = due - now;
                if wait > timeout {
                    thread::sleep(timeout);
                    return Ok(Acquired::Empty);
                }
                thread::sleep(wait);
            }
            // A late consumer does not get a burst of catch-up buffers.
            self.next_due = Some(due.max(now) + params.buffer_period());
        }

        self.fill(&params, buffer);
        Ok(Acquired::Filled)
    }

    fn policy(&self) -> OverflowPolicy {
        OverflowPolicy::Lossy
    }
}
