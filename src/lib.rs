//! Core library for the rust_oct imaging pipeline.
//!
//! Takes interferogram buffers from an acquisition source (a live board or a
//! recorded capture), tracks the catheter angle from the encoder channel,
//! resamples and transforms every A-line, and reconstructs one sector image
//! per revolution on a GPU (or the host). Finished frames land in a
//! fixed-capacity pool read by renderers and recorders.
//!
//! The entry points are [`pipeline::PipelineContext`] and
//! [`pipeline::Pipeline`]; [`config::Settings`] carries every tunable.

pub mod acquisition;
pub mod angle;
pub mod config;
pub mod consumers;
pub mod data;
pub mod device;
pub mod dsp;
pub mod error;
pub mod error_recovery;
pub mod events;
pub mod limits;
pub mod logging;
pub mod pipeline;
pub mod reconstruction;

pub use error::{AppResult, OctError};
