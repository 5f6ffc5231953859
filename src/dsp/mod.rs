//! Signal processing ahead of the reconstruction kernels.

pub mod resample;
pub mod rescale;
pub mod spectral;

pub use resample::{resample, Resampler};
pub use rescale::{CalibrationFile, RescaleTable};
pub use spectral::SpectralTransform;
