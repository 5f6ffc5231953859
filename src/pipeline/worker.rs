//! Reconstruction thread.
//!
//! Pops raw buffers in completion order, runs every A-line through angle
//! tracking, resampling and the spectral transform, and places it in the row
//! of the revolution batch its angle selects. After `lines_per_revolution`
//! A-lines the batch is reconstructed into a frame-pool slot.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::angle::{AngleSample, AngleTracker, Direction};
use crate::data::{RawBuffer, ReconstructedFrame};
use crate::dsp::{Resampler, SpectralTransform};
use crate::error::OctError;
use crate::events::EventBus;
use crate::reconstruction::{ReconstructionPipeline, SpectralBatch};
use oct_pool::SlotPool;

/// Counters shared between the reconstruction thread and the [`Pipeline`](super::Pipeline).
#[derive(Debug, Default)]
pub(crate) struct FrameCounters {
    pub completed: AtomicU64,
    pub dropped: AtomicU64,
    pub lines: AtomicU64,
    pub skipped_lines: AtomicU64,
}

/// Per-thread state that survives a restart.
pub(crate) struct ReconstructionWorker {
    pipeline: ReconstructionPipeline,
    tracker: AngleTracker,
    resampler: Arc<Resampler>,
    spectral: SpectralTransform,
    batch: SpectralBatch,
    resampled: Vec<f32>,
    lines_in_revolution: usize,
    last_sample: Option<AngleSample>,
    base_display_angle: f32,
    bidirectional: bool,
    frame_count: u64,
    started: Instant,
}

impl ReconstructionWorker {
    pub fn new(
        pipeline: ReconstructionPipeline,
        tracker: AngleTracker,
        resampler: Arc<Resampler>,
        bidirectional: bool,
    ) -> Self {
        let shape = pipeline.params().shape();
        let base_display_angle = pipeline.params().display_angle_deg;
        Self {
            spectral: SpectralTransform::new(resampler.output_len(), shape.depth),
            batch: SpectralBatch::new(shape.lines, shape.depth),
            resampled: vec![0.0; resampler.output_len()],
            pipeline,
            tracker,
            resampler,
            lines_in_revolution: 0,
            last_sample: None,
            base_display_angle,
            bidirectional,
            frame_count: 0,
            started: Instant::now(),
        }
    }

    pub fn tracker(&self) -> &AngleTracker {
        &self.tracker
    }

    pub fn backend_name(&self) -> &str {
        self.pipeline.backend_name()
    }

    /// Forget the partial revolution and averaging history.
    pub fn reset_revolution(&mut self) {
        self.lines_in_revolution = 0;
        self.last_sample = None;
        self.pipeline.reset_history();
    }

    fn process_buffer(
        &mut self,
        raw: &RawBuffer,
        frames: &SlotPool<ReconstructedFrame>,
        events: &EventBus,
        counters: &FrameCounters,
    ) -> Result<(), OctError> {
        let lines = raw.valid_lines.min(raw.lines());
        for line in 0..lines {
            let Some(encoder) = raw.encoder_record(line) else {
                continue;
            };
            let sample = self.tracker.update(encoder);
            counters.lines.fetch_add(1, Ordering::Relaxed);

            let written = self
                .resampler
                .resample_line(raw, line, &mut self.resampled);
            if written == 0 {
                counters.skipped_lines.fetch_add(1, Ordering::Relaxed);
                trace!(sequence = raw.sequence, line, "Resampler produced no data");
            } else {
                let row = sample.line_index.min(self.batch.lines.saturating_sub(1));
                let (real, imag) = self.batch.row_mut(row);
                self.spectral.transform(&self.resampled, real, imag);
                self.batch.positions[row] = sample.position as f32;
            }

            self.last_sample = Some(sample);
            self.lines_in_revolution += 1;
            if self.lines_in_revolution >= self.batch.lines {
                self.lines_in_revolution = 0;
                self.emit_frame(frames, events, counters)?;
            }
        }
        Ok(())
    }

    /// Reconstruct the current batch. Transient failures drop the frame;
    /// fatal ones are returned.
    fn emit_frame(
        &mut self,
        frames: &SlotPool<ReconstructedFrame>,
        events: &EventBus,
        counters: &FrameCounters,
    ) -> Result<(), OctError> {
        let (offset, reverse, position) = match self.last_sample {
            Some(sample) => (
                sample.correction_offset_deg as f32,
                self.bidirectional && sample.direction == Direction::CounterClockwise,
                sample.position,
            ),
            None => (0.0, false, 0.0),
        };
        self.pipeline
            .set_orientation(self.base_display_angle + offset, reverse);

        let Some(mut slot) = frames.begin_write() else {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(pool = frames.label(), "Every frame slot is being read, dropping frame");
            return Ok(());
        };

        match self.pipeline.reconstruct(&self.batch, &mut slot) {
            Ok(()) => {
                self.frame_count += 1;
                slot.frame_count = self.frame_count;
                slot.timestamp = Utc::now();
                slot.millis = self.started.elapsed().as_millis() as u64;
                slot.encoder_position = position;
                let index = slot.commit();
                counters.completed.fetch_add(1, Ordering::Relaxed);
                trace!(slot = index, frame = self.frame_count, "Frame committed");
                events.frame_ready(index, self.frame_count);
                Ok(())
            }
            Err(err) => {
                // The uncommitted slot is released unmarked.
                drop(slot);
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                events.fault("reconstruction", &err);
                if err.is_fatal() {
                    return Err(err);
                }
                warn!(error = %err, "Frame dropped");
                Ok(())
            }
        }
    }
}

/// What the reconstruction thread hands back.
pub(crate) struct WorkerExit {
    pub worker: ReconstructionWorker,
    pub error: Option<OctError>,
}

pub(crate) fn run(
    mut worker: ReconstructionWorker,
    raw: Arc<SlotPool<RawBuffer>>,
    frames: Arc<SlotPool<ReconstructedFrame>>,
    events: EventBus,
    counters: Arc<FrameCounters>,
    stop: Arc<AtomicBool>,
    wait_timeout: Duration,
) -> WorkerExit {
    info!(backend = worker.backend_name(), "Reconstruction started");
    let mut error = None;
    while !stop.load(Ordering::Acquire) {
        let Some(buffer) = raw.wait_ready(wait_timeout) else {
            continue;
        };
        debug!(sequence = buffer.sequence, slot = buffer.index(), "Processing raw buffer");
        if let Err(err) = worker.process_buffer(&buffer, &frames, &events, &counters) {
            error!(error = %err, "Reconstruction failed");
            error = Some(err);
            break;
        }
    }
    info!(
        frames = counters.completed.load(Ordering::Relaxed),
        dropped = counters.dropped.load(Ordering::Relaxed),
        "Reconstruction stopped"
    );
    WorkerExit { worker, error }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AngleConfig, ReconstructionConfig};
    use crate::device::DeviceGeometry;
    use crate::dsp::RescaleTable;
    use crate::events::{EventStreams, FrameReady};
    use crate::reconstruction::{CpuBackend, ReconstructionParams};
    use oct_pool::OverflowPolicy;

    const LINES: u32 = 8;

    fn worker() -> ReconstructionWorker {
        let geometry = DeviceGeometry {
            catheter_radius_px: 1,
            internal_imaging_mask_px: 0,
            aline_length_px: 8,
            lines_per_revolution: LINES,
            ..DeviceGeometry::default()
        };
        let config = ReconstructionConfig {
            sector_size: 16,
            ..ReconstructionConfig::default()
        };
        let params = ReconstructionParams::from_settings(&config, &geometry);
        let pipeline =
            ReconstructionPipeline::new(Box::new(CpuBackend::new(params.shape())), params);
        let tracker = AngleTracker::new(&AngleConfig::default(), LINES);
        let resampler = Arc::new(Resampler::new(RescaleTable::identity(16), 32_768.0));
        ReconstructionWorker::new(pipeline, tracker, resampler, false)
    }

    fn frames() -> SlotPool<ReconstructedFrame> {
        let shape = worker().pipeline.params().shape();
        SlotPool::new("frames", 2, OverflowPolicy::Lossy, || {
            ReconstructedFrame::with_shape(shape)
        })
        .unwrap()
    }

    fn buffer(lines: usize) -> RawBuffer {
        let mut raw = RawBuffer::with_shape(lines, 16, 3);
        for line in 0..lines {
            let (record, encoder) = raw.line_mut(line);
            record.fill(32_768);
            encoder.fill(10_000);
        }
        raw.valid_lines = lines;
        raw
    }

    #[test]
    fn test_frame_after_one_revolution_of_lines() {
        let mut worker = worker();
        let frames = frames();
        let (events, mut streams) = EventBus::new(8);
        let counters = FrameCounters::default();

        worker
            .process_buffer(&buffer(5), &frames, &events, &counters)
            .unwrap();
        assert_eq!(counters.completed.load(Ordering::Relaxed), 0);

        worker
            .process_buffer(&buffer(5), &frames, &events, &counters)
            .unwrap();
        assert_eq!(counters.completed.load(Ordering::Relaxed), 1);
        assert_eq!(counters.lines.load(Ordering::Relaxed), 10);

        let ready = EventStreams::drain(&mut streams.frame_ready);
        assert_eq!(ready.len(), 1);
        let FrameReady { index, frame_count } = ready[0];
        assert_eq!(frame_count, 1);
        let frame = frames.read(index).unwrap();
        assert_eq!(frame.frame_count, 1);
        assert!(frame.timestamp > chrono::DateTime::<Utc>::UNIX_EPOCH);
    }

    #[test]
    fn test_invalid_lines_are_ignored() {
        let mut worker = worker();
        let frames = frames();
        let (events, _streams) = EventBus::new(8);
        let counters = FrameCounters::default();
        let mut raw = buffer(LINES as usize);
        raw.valid_lines = 3;

        worker.process_buffer(&raw, &frames, &events, &counters).unwrap();
        assert_eq!(counters.lines.load(Ordering::Relaxed), 3);
        assert_eq!(counters.completed.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_short_records_are_skipped_but_counted() {
        let mut worker = worker();
        let frames = frames();
        let (events, _streams) = EventBus::new(8);
        let counters = FrameCounters::default();
        // The identity table reads 16 samples; a zero-length record yields none.
        let mut raw = RawBuffer::with_shape(LINES as usize, 0, 3);
        for line in 0..LINES as usize {
            raw.line_mut(line).1.fill(10_000);
        }
        raw.valid_lines = LINES as usize;

        worker.process_buffer(&raw, &frames, &events, &counters).unwrap();
        assert_eq!(counters.skipped_lines.load(Ordering::Relaxed), u64::from(LINES));
        assert_eq!(counters.completed.load(Ordering::Relaxed), 1);
    }
}
