//! Pipeline orchestration.
//!
//! [`PipelineContext`] is built once at startup and owns everything the
//! stages share: settings, device geometry, both slot pools, the resampler
//! and the event bus. [`Pipeline`] runs two threads over it:
//!
//! ```text
//! DataSource ──Producer──▶ raw pool ──reconstruction──▶ frame pool ──▶ consumers
//!                (acquisition thread)     (angle, resample, FFT, backend)
//! ```
//!
//! Each thread owns its state while it runs and returns it when joined, so a
//! stall reset (stop, reconfigure, restart) keeps the source, the compute
//! backend and the angle tracker without rebuilding them.

mod worker;

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

use crate::acquisition::{
    AcquisitionParams, DataSource, Producer, ProducerConfig, ProducerOutcome,
};
use crate::angle::{AngleTracker, TelemetryHandle};
use crate::config::{ResampleConfig, Settings};
use crate::data::{FrameShape, RawBuffer, ReconstructedFrame};
use crate::device::{DeviceGeometry, DeviceProvider};
use crate::dsp::{CalibrationFile, RescaleTable, Resampler};
use crate::error::{AppResult, OctError};
use crate::error_recovery::{Restartable, Supervisor};
use crate::events::EventBus;
use crate::limits;
use crate::reconstruction::{ComputeBackend, ReconstructionParams, ReconstructionPipeline};
use oct_pool::{OverflowPolicy, SlotPool};
use worker::{FrameCounters, ReconstructionWorker, WorkerExit};

/// Shared state of one imaging session.
pub struct PipelineContext {
    settings: Settings,
    geometry: DeviceGeometry,
    acquisition: AcquisitionParams,
    params: ReconstructionParams,
    raw_pool: Arc<SlotPool<RawBuffer>>,
    frame_pool: Arc<SlotPool<ReconstructedFrame>>,
    resampler: Arc<Resampler>,
    events: EventBus,
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("geometry", &self.geometry)
            .field("acquisition", &self.acquisition)
            .field("raw_pool", &self.raw_pool)
            .field("frame_pool", &self.frame_pool)
            .finish_non_exhaustive()
    }
}

impl PipelineContext {
    /// Validate everything and allocate both pools.
    ///
    /// All fatal configuration problems surface here, before any thread
    /// starts. `raw_policy` should be the policy of the source that will
    /// feed the pipeline.
    pub fn new(
        settings: Settings,
        device: &dyn DeviceProvider,
        raw_policy: OverflowPolicy,
        events: EventBus,
    ) -> AppResult<Self> {
        settings.validate()?;
        let geometry = device.geometry();
        validate_geometry(&settings, &geometry)?;

        let acq = &settings.acquisition;
        limits::validate_raw_buffer(
            acq.lines_per_buffer,
            acq.record_length + acq.encoder_record_length,
        )?;
        let acquisition = AcquisitionParams::from_settings(&settings, &geometry);
        let params = ReconstructionParams::from_settings(&settings.reconstruction, &geometry);
        let shape = params.shape();
        let frame_bytes = ReconstructedFrame::byte_size(shape);
        if frame_bytes > limits::MAX_SLOT_BYTES {
            return Err(OctError::BufferAllocation(format!(
                "frame slot of {frame_bytes} bytes exceeds {} bytes",
                limits::MAX_SLOT_BYTES
            )));
        }

        let resampler = Arc::new(build_resampler(
            &settings.resample,
            acq.record_length,
            shape.depth,
        )?);

        let (lines, record_len, encoder_len) = (
            acq.lines_per_buffer,
            acq.record_length,
            acq.encoder_record_length,
        );
        let raw_pool = Arc::new(SlotPool::with_reset(
            "raw",
            acq.raw_pool_slots,
            raw_policy,
            move || RawBuffer::with_shape(lines, record_len, encoder_len),
            RawBuffer::reset,
        )?);
        let frame_pool = Arc::new(SlotPool::with_reset(
            "frames",
            settings.reconstruction.frame_pool_slots,
            OverflowPolicy::Lossy,
            move || ReconstructedFrame::with_shape(shape),
            ReconstructedFrame::reset,
        )?);

        info!(
            device = %geometry.name,
            raw_slots = raw_pool.capacity(),
            frame_slots = frame_pool.capacity(),
            raw_policy = ?raw_policy,
            lines_per_revolution = geometry.lines_per_revolution,
            sector = shape.sector_size,
            "Pipeline context ready"
        );

        Ok(Self {
            settings,
            geometry,
            acquisition,
            params,
            raw_pool,
            frame_pool,
            resampler,
            events,
        })
    }

    /// Settings the pipeline was built from.
    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Geometry of the selected device.
    #[must_use]
    pub fn geometry(&self) -> &DeviceGeometry {
        &self.geometry
    }

    /// Resolved acquisition shape.
    #[must_use]
    pub fn acquisition(&self) -> &AcquisitionParams {
        &self.acquisition
    }

    /// Stage parameters.
    #[must_use]
    pub fn reconstruction_params(&self) -> &ReconstructionParams {
        &self.params
    }

    /// Shape of reconstructed frames.
    #[must_use]
    pub fn frame_shape(&self) -> FrameShape {
        self.params.shape()
    }

    /// Pool of raw buffers.
    #[must_use]
    pub fn raw_pool(&self) -> &Arc<SlotPool<RawBuffer>> {
        &self.raw_pool
    }

    /// Pool of reconstructed frames.
    #[must_use]
    pub fn frame_pool(&self) -> &Arc<SlotPool<ReconstructedFrame>> {
        &self.frame_pool
    }

    /// Shared resampler built from the calibration.
    #[must_use]
    pub fn resampler(&self) -> &Resampler {
        &self.resampler
    }

    /// Event bus.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }
}

fn validate_geometry(settings: &Settings, geometry: &DeviceGeometry) -> AppResult<()> {
    let record_length = settings.acquisition.record_length;
    if geometry.lines_per_revolution == 0 {
        return Err(OctError::Configuration(format!(
            "device {} reports zero lines per revolution",
            geometry.name
        )));
    }
    if geometry.aline_length_px == 0 || geometry.aline_length_px as usize > record_length / 2 {
        return Err(OctError::Configuration(format!(
            "device {} A-line length {} must be in 1..={}",
            geometry.name,
            geometry.aline_length_px,
            record_length / 2
        )));
    }
    Ok(())
}

fn build_resampler(
    config: &ResampleConfig,
    record_length: usize,
    depth: usize,
) -> AppResult<Resampler> {
    let table = match &config.calibration_file {
        Some(path) => {
            let file = CalibrationFile::load(path)?;
            if file.is_service_overdue(Utc::now().date_naive()) {
                warn!(
                    device = %file.device,
                    due = ?file.service_due,
                    "Laser service is overdue"
                );
            }
            RescaleTable::from_parts(file.whole, file.fractional)?
        }
        None => RescaleTable::identity(record_length),
    };

    if table.len() / 2 < depth {
        return Err(OctError::Calibration(format!(
            "rescale table of {} entries cannot produce {depth} depth samples",
            table.len()
        )));
    }
    if let Some(max) = table.max_input_index() {
        if max >= record_length {
            warn!(
                max_input_index = max,
                record_length, "Rescale table reads past the record, lines will be cut short"
            );
        }
    }
    Ok(Resampler::new(table, config.dc_offset))
}

/// Result of one [`Pipeline::supervise`] poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStatus {
    /// Both threads are running.
    Running,
    /// A stalled source was reset.
    Recovered {
        /// Reset cycles spent so far.
        resets: u32,
    },
    /// The source has no more data. Reconstruction keeps draining the raw pool.
    Finished,
    /// The pipeline was stopped.
    Stopped,
}

/// The running acquisition and reconstruction threads.
pub struct Pipeline {
    ctx: PipelineContext,
    source: Option<Box<dyn DataSource>>,
    worker: Option<ReconstructionWorker>,
    producer: Option<Producer>,
    reconstruction: Option<JoinHandle<WorkerExit>>,
    worker_stop: Arc<AtomicBool>,
    counters: Arc<FrameCounters>,
    telemetry: TelemetryHandle,
    failure: Option<OctError>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("running", &self.is_running())
            .field("frames_completed", &self.frames_completed())
            .field("frames_dropped", &self.frames_dropped())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Configure `source` and start both threads.
    pub fn start(
        ctx: PipelineContext,
        mut source: Box<dyn DataSource>,
        backend: Box<dyn ComputeBackend>,
    ) -> AppResult<Self> {
        if source.policy() != ctx.raw_pool.policy() {
            return Err(OctError::Configuration(format!(
                "source '{}' needs a {:?} raw pool, context has {:?}",
                source.name(),
                source.policy(),
                ctx.raw_pool.policy()
            )));
        }
        source.configure(&ctx.acquisition)?;

        let tracker = AngleTracker::new(&ctx.settings.angle, ctx.geometry.lines_per_revolution)
            .with_events(ctx.events.clone());
        let telemetry = tracker.telemetry();
        let pipeline = ReconstructionPipeline::new(backend, ctx.params.clone());
        let worker = ReconstructionWorker::new(
            pipeline,
            tracker,
            Arc::clone(&ctx.resampler),
            ctx.geometry.bidirectional,
        );

        let mut this = Self {
            ctx,
            source: Some(source),
            worker: Some(worker),
            producer: None,
            reconstruction: None,
            worker_stop: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(FrameCounters::default()),
            telemetry,
            failure: None,
        };
        this.spawn_threads()?;
        Ok(this)
    }

    fn spawn_threads(&mut self) -> AppResult<()> {
        let (Some(source), Some(worker)) = (self.source.take(), self.worker.take()) else {
            return Err(OctError::Configuration(
                "pipeline state was lost by a panicked thread".into(),
            ));
        };
        info!(
            source = source.name(),
            backend = worker.backend_name(),
            "Starting pipeline threads"
        );

        self.worker_stop = Arc::new(AtomicBool::new(false));
        let raw = Arc::clone(&self.ctx.raw_pool);
        let frames = Arc::clone(&self.ctx.frame_pool);
        let events = self.ctx.events.clone();
        let counters = Arc::clone(&self.counters);
        let stop = Arc::clone(&self.worker_stop);
        let timeout = self.ctx.settings.acquisition.wait_timeout;
        self.reconstruction = Some(
            thread::Builder::new()
                .name("oct-reconstruction".into())
                .spawn(move || worker::run(worker, raw, frames, events, counters, stop, timeout))?,
        );

        let config = ProducerConfig {
            wait_timeout: self.ctx.settings.acquisition.wait_timeout,
            stall_threshold: self.ctx.settings.acquisition.stall_threshold,
        };
        self.producer = Some(Producer::spawn(
            source,
            Arc::clone(&self.ctx.raw_pool),
            self.ctx.events.clone(),
            config,
        )?);
        Ok(())
    }

    /// Stop both threads and take back their state.
    pub fn stop(&mut self) -> AppResult<()> {
        let mut errors = Vec::new();

        if let Some(producer) = self.producer.take() {
            match producer.join() {
                Ok(exit) => {
                    info!(buffers = exit.buffers, outcome = ?exit.outcome, "Acquisition thread joined");
                    self.source = Some(exit.source);
                }
                Err(err) => errors.push(err),
            }
        }

        self.worker_stop.store(true, Ordering::Release);
        if let Some(handle) = self.reconstruction.take() {
            match handle.join() {
                Ok(exit) => {
                    if let Some(err) = exit.error {
                        self.failure.get_or_insert(err);
                    }
                    self.worker = Some(exit.worker);
                }
                Err(_) => errors.push(OctError::ThreadPanicked("oct-reconstruction".into())),
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(OctError::ShutdownFailed(errors))
        }
    }

    /// Stop, then release the source for good.
    pub fn shutdown(mut self) -> AppResult<()> {
        let stopped = self.stop();
        let released = match self.source.take() {
            Some(mut source) => source.shutdown(),
            None => Ok(()),
        };
        stopped?;
        released
    }

    /// Check both threads without blocking; reset a stalled source through
    /// `supervisor`.
    ///
    /// Fatal failures on either thread come back as `Err`.
    pub fn supervise(&mut self, supervisor: &mut Supervisor) -> AppResult<PipelineStatus> {
        if let Some(err) = self.failure.take() {
            return Err(err);
        }

        if self
            .reconstruction
            .as_ref()
            .is_some_and(JoinHandle::is_finished)
        {
            self.stop()?;
            return match self.failure.take() {
                Some(err) => Err(err),
                None => Ok(PipelineStatus::Stopped),
            };
        }

        let producer_done = self.producer.as_ref().is_some_and(|p| !p.is_running());
        if !producer_done {
            return Ok(if self.is_running() {
                PipelineStatus::Running
            } else {
                PipelineStatus::Stopped
            });
        }

        let Some(producer) = self.producer.take() else {
            return Ok(PipelineStatus::Stopped);
        };
        let exit = producer.join()?;
        self.source = Some(exit.source);
        match exit.outcome {
            ProducerOutcome::Stalled { timeouts } => {
                warn!(timeouts, "Acquisition stalled, resetting pipeline");
                supervisor.recover(self)?;
                Ok(PipelineStatus::Recovered {
                    resets: supervisor.resets(),
                })
            }
            ProducerOutcome::Finished => Ok(PipelineStatus::Finished),
            ProducerOutcome::Stopped => Ok(PipelineStatus::Stopped),
            ProducerOutcome::Failed(err) => {
                error!(error = %err, "Acquisition failed, stopping pipeline");
                self.stop()?;
                Err(err)
            }
        }
    }

    /// Either thread is still alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.producer.as_ref().is_some_and(Producer::is_running)
            || self
                .reconstruction
                .as_ref()
                .is_some_and(|h| !h.is_finished())
    }

    /// Frames committed to the frame pool.
    #[must_use]
    pub fn frames_completed(&self) -> u64 {
        self.counters.completed.load(Ordering::Relaxed)
    }

    /// Frames lost to failed dispatch/readback or a fully-read frame pool.
    #[must_use]
    pub fn frames_dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    /// A-lines handed to the worker.
    #[must_use]
    pub fn lines_processed(&self) -> u64 {
        self.counters.lines.load(Ordering::Relaxed)
    }

    /// A-lines the resampler produced nothing for.
    #[must_use]
    pub fn lines_skipped(&self) -> u64 {
        self.counters.skipped_lines.load(Ordering::Relaxed)
    }

    /// Live angle telemetry.
    #[must_use]
    pub fn telemetry(&self) -> TelemetryHandle {
        self.telemetry.clone()
    }

    /// Context the pipeline runs in.
    #[must_use]
    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    /// Pool of reconstructed frames.
    #[must_use]
    pub fn frame_pool(&self) -> &Arc<SlotPool<ReconstructedFrame>> {
        &self.ctx.frame_pool
    }
}

impl Restartable for Pipeline {
    /// Stop, drop stale raw data, reconfigure the source and start again.
    fn restart(&mut self) -> AppResult<()> {
        self.stop()?;
        self.ctx.raw_pool.clear();

        let Some(source) = self.source.as_mut() else {
            return Err(OctError::Configuration(
                "no acquisition source to restart".into(),
            ));
        };
        source.configure(&self.ctx.acquisition)?;
        if let Some(worker) = self.worker.as_mut() {
            worker.reset_revolution();
            info!(
                revolutions = worker.tracker().revolutions(),
                "Reconstruction state kept across reset"
            );
        }

        self.spawn_threads()?;
        self.ctx.events.attenuate_source(false);
        info!("Pipeline restarted");
        Ok(())
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            error!(error = %err, "Pipeline did not stop cleanly");
        }
        if let Some(mut source) = self.source.take() {
            if let Err(err) = source.shutdown() {
                error!(error = %err, "Source shutdown failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::StaticDevice;

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.acquisition.record_length = 64;
        settings.acquisition.encoder_record_length = 3;
        settings.acquisition.lines_per_buffer = 8;
        settings.acquisition.raw_pool_slots = 4;
        settings.device.aline_length_px = 16;
        settings.device.lines_per_revolution = 16;
        settings.reconstruction.sector_size = 32;
        settings.reconstruction.frame_pool_slots = 4;
        settings
    }

    #[test]
    fn test_context_allocates_pools() {
        let settings = settings();
        let device = StaticDevice(settings.device.clone());
        let (events, _streams) = EventBus::new(8);
        let ctx = PipelineContext::new(settings, &device, OverflowPolicy::Lossy, events).unwrap();

        assert_eq!(ctx.raw_pool().capacity(), 4);
        assert_eq!(ctx.frame_pool().capacity(), 4);
        assert_eq!(ctx.frame_pool().policy(), OverflowPolicy::Lossy);
        assert_eq!(
            ctx.frame_shape(),
            FrameShape {
                lines: 16,
                depth: 16,
                sector_size: 32
            }
        );
        assert_eq!(ctx.resampler().output_len(), 64);
    }

    #[test]
    fn test_context_rejects_device_geometry() {
        let settings = settings();
        let device = StaticDevice(DeviceGeometry {
            aline_length_px: 64,
            ..settings.device.clone()
        });
        let (events, _streams) = EventBus::new(8);
        let err = PipelineContext::new(settings, &device, OverflowPolicy::Lossy, events).unwrap_err();
        assert!(matches!(err, OctError::Configuration(_)));
    }

    #[test]
    fn test_short_calibration_table_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cal.json");
        CalibrationFile {
            device: "short".into(),
            service_due: None,
            whole: (0..8).collect(),
            fractional: vec![0.0; 8],
        }
        .save(&path)
        .unwrap();

        let mut settings = settings();
        settings.resample.calibration_file = Some(path);
        let device = StaticDevice(settings.device.clone());
        let (events, _streams) = EventBus::new(8);
        let err = PipelineContext::new(settings, &device, OverflowPolicy::Lossy, events).unwrap_err();
        assert!(matches!(err, OctError::Calibration(_)));
    }
}
