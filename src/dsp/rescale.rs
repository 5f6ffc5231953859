//! Per-device rescale tables.
//!
//! Tables are stored as JSON calibration files next to the service date of
//! the laser they were measured on:
//!
//! ```json
//! {
//!   "device": "probe-a",
//!   "service_due": "2027-03-01",
//!   "whole": [0, 1, 2],
//!   "fractional": [0.0, 0.12, 0.31]
//! }
//! ```
//!
//! An overdue service date is only logged. It never blocks imaging.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

use crate::error::{AppResult, OctError};

/// Whole/fractional sample index pairs, one per output sample.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RescaleTable {
    whole: Vec<u32>,
    fractional: Vec<f32>,
}

impl RescaleTable {
    /// Table that copies the input unchanged.
    #[must_use]
    pub fn identity(len: usize) -> Self {
        Self {
            whole: (0..len as u32).collect(),
            fractional: vec![0.0; len],
        }
    }

    /// Build a table from fractional input positions.
    #[must_use]
    pub fn from_positions(positions: &[f64]) -> Self {
        let (whole, fractional) = positions
            .iter()
            .map(|&p| {
                let p = p.max(0.0);
                let w = p.floor();
                (w as u32, (p - w) as f32)
            })
            .unzip();
        Self { whole, fractional }
    }

    /// Table from explicit index parts; both must have the same length.
    pub fn from_parts(whole: Vec<u32>, fractional: Vec<f32>) -> AppResult<Self> {
        if whole.len() != fractional.len() {
            return Err(OctError::Calibration(format!(
                "rescale table has {} whole and {} fractional entries",
                whole.len(),
                fractional.len()
            )));
        }
        if let Some(bad) = fractional.iter().find(|f| !(0.0..1.0).contains(*f)) {
            return Err(OctError::Calibration(format!(
                "fractional index {bad} outside [0, 1)"
            )));
        }
        Ok(Self { whole, fractional })
    }

    /// Load the table from a calibration file, warning when service is due.
    pub fn load(path: &Path) -> AppResult<Self> {
        let file = CalibrationFile::load(path)?;
        let today = chrono::Local::now().date_naive();
        if file.is_service_overdue(today) {
            warn!(
                device = %file.device,
                service_due = ?file.service_due,
                "Laser service is overdue"
            );
        }
        Self::from_parts(file.whole, file.fractional)
    }

    /// Whole sample index per output sample.
    #[must_use]
    pub fn whole(&self) -> &[u32] {
        &self.whole
    }

    /// Interpolation fraction per output sample.
    #[must_use]
    pub fn fractional(&self) -> &[f32] {
        &self.fractional
    }

    /// Output samples per record.
    #[must_use]
    pub fn len(&self) -> usize {
        self.whole.len()
    }

    /// True when empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.whole.is_empty()
    }

    /// Highest input index the table reads (including interpolation).
    #[must_use]
    pub fn max_input_index(&self) -> Option<usize> {
        self.whole
            .iter()
            .zip(&self.fractional)
            .map(|(&w, &f)| if f > 0.0 { w as usize + 1 } else { w as usize })
            .max()
    }
}

/// On-disk calibration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationFile {
    /// Device the table was measured on.
    pub device: String,
    /// Date the calibration is due for renewal.
    #[serde(default)]
    pub service_due: Option<NaiveDate>,
    /// Whole sample indices.
    pub whole: Vec<u32>,
    /// Interpolation fractions.
    pub fractional: Vec<f32>,
}

impl CalibrationFile {
    /// Read a calibration file.
    pub fn load(path: &Path) -> AppResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            OctError::Calibration(format!(
                "failed to read calibration file {}: {e}",
                path.display()
            ))
        })?;
        let file: Self = serde_json::from_str(&contents).map_err(|e| {
            OctError::Calibration(format!(
                "failed to parse calibration file {}: {e}",
                path.display()
            ))
        })?;
        info!(
            path = %path.display(),
            device = %file.device,
            entries = file.whole.len(),
            "Loaded rescale calibration"
        );
        Ok(file)
    }

    /// Write the calibration as pretty JSON.
    pub fn save(&self, path: &Path) -> AppResult<()> {
        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| OctError::Calibration(format!("failed to serialize calibration: {e}")))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// True if `today` is past the service date.
    #[must_use]
    pub fn is_service_overdue(&self, today: NaiveDate) -> bool {
        self.service_due.is_some_and(|due| due < today)
    }
}
