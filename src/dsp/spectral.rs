//! Depth profile from one resampled interferogram.
//!
//! A Hann window is applied to the uniform record, then a forward FFT. Only
//! the first `depth` bins (positive depths) are kept, as separate real and
//! imaginary planes for the reconstruction kernels.

use num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// Hann window and forward FFT from resampled records to spectral planes.
pub struct SpectralTransform {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    buffer: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    depth: usize,
}

impl SpectralTransform {
    /// `record_len` input samples, `depth` output bins (at most `record_len / 2`).
    #[must_use]
    pub fn new(record_len: usize, depth: usize) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(record_len);
        let scratch = vec![Complex::default(); fft.get_inplace_scratch_len()];

        let window = if record_len > 1 {
            (0..record_len)
                .map(|i| {
                    0.5 * (1.0
                        - (2.0 * std::f32::consts::PI * i as f32 / (record_len - 1) as f32)
                            .cos())
                })
                .collect()
        } else {
            vec![1.0; record_len]
        };

        Self {
            fft,
            window,
            buffer: vec![Complex::default(); record_len],
            scratch,
            depth: depth.min(record_len / 2).max(1),
        }
    }

    /// Input record length.
    #[must_use]
    pub fn record_len(&self) -> usize {
        self.window.len()
    }

    /// Depth samples kept per record.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Transform `record` and write `depth` bins into `real` and `imag`.
    ///
    /// A short record is zero-padded.
    pub fn transform(&mut self, record: &[f32], real: &mut [f32], imag: &mut [f32]) {
        for (i, slot) in self.buffer.iter_mut().enumerate() {
            let sample = record.get(i).copied().unwrap_or(0.0);
            *slot = Complex::new(sample * self.window[i], 0.0);
        }
        self.fft
            .process_with_scratch(&mut self.buffer, &mut self.scratch);

        let bins = self.depth.min(real.len()).min(imag.len());
        for (k, bin) in self.buffer.iter().take(bins).enumerate() {
            real[k] = bin.re;
            imag[k] = bin.im;
        }
    }
}
