//! Imaging device geometry.
//!
//! Geometry comes from the device-configuration collaborator. The pipeline
//! reads it once at device selection and again whenever a stage needs it, via
//! [`DeviceProvider`].

use serde::{Deserialize, Serialize};

/// Catheter and imaging geometry of the selected device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceGeometry {
    /// Device model name.
    pub name: String,
    /// Radius of the catheter body in A-line depth pixels.
    pub catheter_radius_px: u32,
    /// Radius of the central mask drawn black in the sector image.
    pub internal_imaging_mask_px: u32,
    /// Depth samples kept per A-line after the spectral transform.
    pub aline_length_px: u32,
    /// A-lines per catheter revolution.
    pub lines_per_revolution: u32,
    /// Device images in both rotation directions.
    pub bidirectional: bool,
    /// High-speed pullback model.
    pub high_speed: bool,
}

impl Default for DeviceGeometry {
    fn default() -> Self {
        Self {
            name: "generic".to_string(),
            catheter_radius_px: 24,
            internal_imaging_mask_px: 12,
            aline_length_px: 512,
            lines_per_revolution: 512,
            bidirectional: false,
            high_speed: false,
        }
    }
}

/// Source of device geometry.
pub trait DeviceProvider: Send + Sync {
    /// Geometry of the attached device.
    fn geometry(&self) -> DeviceGeometry;
}

/// Fixed geometry, typically taken from [`Settings`](crate::config::Settings).
#[derive(Debug, Clone)]
pub struct StaticDevice(pub DeviceGeometry);

impl DeviceProvider for StaticDevice {
    fn geometry(&self) -> DeviceGeometry {
        self.0.clone()
    }
}
