//! Pool slot payloads.
//!
//! Both types are allocated once per slot when the pools are created and
//! overwritten in place on every reuse. `reset` clears metadata only; sample
//! and pixel buffers keep their contents until the next writer overwrites
//! them.

use chrono::{DateTime, Utc};
use std::time::Instant;

/// One DMA buffer: `lines` interferogram records plus their encoder records.
#[derive(Debug, Clone)]
pub struct RawBuffer {
    samples: Vec<u16>,
    encoder: Vec<u16>,
    record_len: usize,
    encoder_len: usize,
    lines: usize,
    /// Records actually filled this cycle (may be < `lines`).
    pub valid_lines: usize,
    /// Monotonic buffer number assigned by the source.
    pub sequence: u64,
    /// Set when the source filled the buffer.
    pub acquired_at: Option<Instant>,
}

impl RawBuffer {
    /// Zeroed buffer for `lines` records.
    #[must_use]
    pub fn with_shape(lines: usize, record_len: usize, encoder_len: usize) -> Self {
        Self {
            samples: vec![0; lines * record_len],
            encoder: vec![0; lines * encoder_len],
            record_len,
            encoder_len,
            lines,
            valid_lines: 0,
            sequence: 0,
            acquired_at: None,
        }
    }

    /// Clear metadata before a slot is reused. Sample storage is kept.
    pub fn reset(&mut self) {
        self.valid_lines = 0;
        self.sequence = 0;
        self.acquired_at = None;
    }

    /// Record capacity.
    #[must_use]
    pub fn lines(&self) -> usize {
        self.lines
    }

    /// Samples per record.
    #[must_use]
    pub fn record_len(&self) -> usize {
        self.record_len
    }

    /// Encoder samples per record.
    #[must_use]
    pub fn encoder_len(&self) -> usize {
        self.encoder_len
    }

    /// Interferogram of a filled line.
    #[must_use]
    pub fn record(&self, line: usize) -> Option<&[u16]> {
        (line < self.valid_lines)
            .then(|| &self.samples[line * self.record_len..(line + 1) * self.record_len])
    }

    /// Encoder record of a filled line.
    #[must_use]
    pub fn encoder_record(&self, line: usize) -> Option<&[u16]> {
        (line < self.valid_lines)
            .then(|| &self.encoder[line * self.encoder_len..(line + 1) * self.encoder_len])
    }

    /// Writable interferogram and encoder record of `line`.
    ///
    /// # Panics
    ///
    /// Panics if `line >= self.lines()`.
    pub fn line_mut(&mut self, line: usize) -> (&mut [u16], &mut [u16]) {
        let record = &mut self.samples[line * self.record_len..(line + 1) * self.record_len];
        let encoder = &mut self.encoder[line * self.encoder_len..(line + 1) * self.encoder_len];
        (record, encoder)
    }

    /// Whole sample and encoder planes, for bulk copies.
    pub fn planes_mut(&mut self) -> (&mut [u16], &mut [u16]) {
        (&mut self.samples, &mut self.encoder)
    }

    /// Sample and encoder planes, line-major.
    #[must_use]
    pub fn planes(&self) -> (&[u16], &[u16]) {
        (&self.samples, &self.encoder)
    }
}

/// Dimensions shared by every frame slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameShape {
    /// Rows of the polar image (lines per revolution).
    pub lines: usize,
    /// Depth samples per row.
    pub depth: usize,
    /// Side of the square sector image.
    pub sector_size: usize,
}

impl FrameShape {
    /// Samples in one polar (lines x depth) plane.
    #[must_use]
    pub fn polar_len(&self) -> usize {
        self.lines * self.depth
    }

    /// Pixels in one square sector image.
    #[must_use]
    pub fn sector_len(&self) -> usize {
        self.sector_size * self.sector_size
    }
}

/// One revolution after reconstruction.
#[derive(Debug, Clone)]
pub struct ReconstructedFrame {
    /// Post-processed polar image, `lines x depth`, one byte per sample.
    pub raw_data: Vec<u8>,
    /// Scaled log magnitude before clamping, `lines x depth`.
    pub spectral_data: Vec<f32>,
    /// Smoothed encoder position of each polar row.
    pub encoder_data: Vec<f32>,
    /// Sector image for the renderer.
    pub display_bytes: Vec<u8>,
    /// Same warp as `display_bytes`, owned by the video path.
    pub video_bytes: Vec<u8>,
    /// Sequence number of successfully reconstructed frames.
    pub frame_count: u64,
    /// Wall-clock time the frame completed.
    pub timestamp: DateTime<Utc>,
    /// Milliseconds since the pipeline started.
    pub millis: u64,
    /// Encoder position of the last A-line in the revolution.
    pub encoder_position: f64,
    /// Display rotation the frame was warped with, degrees.
    pub display_angle_deg: f32,
    shape: FrameShape,
}

impl ReconstructedFrame {
    /// Zeroed frame for `shape`.
    #[must_use]
    pub fn with_shape(shape: FrameShape) -> Self {
        Self {
            raw_data: vec![0; shape.polar_len()],
            spectral_data: vec![0.0; shape.polar_len()],
            encoder_data: vec![0.0; shape.lines],
            display_bytes: vec![0; shape.sector_len()],
            video_bytes: vec![0; shape.sector_len()],
            frame_count: 0,
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            millis: 0,
            encoder_position: 0.0,
            display_angle_deg: 0.0,
            shape,
        }
    }

    /// Clear metadata before a slot is reused. Image storage is kept.
    pub fn reset(&mut self) {
        self.frame_count = 0;
        self.timestamp = DateTime::<Utc>::UNIX_EPOCH;
        self.millis = 0;
        self.encoder_position = 0.0;
        self.display_angle_deg = 0.0;
    }

    /// Buffer shape.
    #[must_use]
    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    /// Bytes one slot holds, for the allocation limit check.
    #[must_use]
    pub fn byte_size(shape: FrameShape) -> usize {
        shape.polar_len() * (1 + std::mem::size_of::<f32>())
            + shape.lines * std::mem::size_of::<f32>()
            + 2 * shape.sector_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_buffer_lines_are_disjoint() {
        let mut raw = RawBuffer::with_shape(3, 4, 2);
        for line in 0..3 {
            let (record, encoder) = raw.line_mut(line);
            record.fill(line as u16 + 1);
            encoder.fill(100 + line as u16);
        }
        raw.valid_lines = 2;
        assert_eq!(raw.record(1), Some(&[2u16, 2, 2, 2][..]));
        assert_eq!(raw.encoder_record(0), Some(&[100u16, 100][..]));
        assert_eq!(raw.record(2), None);
    }

    #[test]
    fn test_raw_reset_keeps_samples() {
        let mut raw = RawBuffer::with_shape(1, 2, 1);
        raw.line_mut(0).0.fill(7);
        raw.valid_lines = 1;
        raw.sequence = 9;
        raw.reset();
        assert_eq!(raw.valid_lines, 0);
        assert_eq!(raw.sequence, 0);
        assert_eq!(raw.planes().0, &[7, 7]);
    }

    #[test]
    fn test_frame_buffers_sized_from_shape() {
        let shape = FrameShape {
            lines: 8,
            depth: 16,
            sector_size: 32,
        };
        let mut frame = ReconstructedFrame::with_shape(shape);
        assert_eq!(frame.raw_data.len(), 128);
        assert_eq!(frame.spectral_data.len(), 128);
        assert_eq!(frame.encoder_data.len(), 8);
        assert_eq!(frame.display_bytes.len(), 1024);
        assert_eq!(frame.video_bytes.len(), 1024);

        frame.frame_count = 5;
        frame.display_bytes[0] = 200;
        frame.reset();
        assert_eq!(frame.frame_count, 0);
        assert_eq!(frame.display_bytes[0], 200);
        assert_eq!(ReconstructedFrame::byte_size(shape), 128 * 5 + 32 + 2048);
    }
}
