//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::time::{Duration, Instant};

use rust_oct::acquisition::DataSource;
use rust_oct::config::{BackendChoice, Settings};
use rust_oct::device::StaticDevice;
use rust_oct::events::{EventBus, EventStreams};
use rust_oct::pipeline::{Pipeline, PipelineContext};
use rust_oct::reconstruction::create_backend;

pub const RECORD: usize = 256;
pub const LINES_PER_BUFFER: usize = 16;
pub const LINES_PER_REVOLUTION: u32 = 64;

/// Small shapes so a revolution takes four raw buffers.
pub fn small_settings() -> Settings {
    let mut settings = Settings::default();
    let acq = &mut settings.acquisition;
    acq.record_length = RECORD;
    acq.encoder_record_length = 12;
    acq.lines_per_buffer = LINES_PER_BUFFER;
    acq.raw_pool_slots = 8;
    acq.wait_timeout = Duration::from_millis(10);
    acq.stall_threshold = 3;
    acq.max_resets = 2;
    acq.line_rate_hz = 6_400.0;
    acq.rotation_hz = 100.0;

    settings.device.aline_length_px = 64;
    settings.device.lines_per_revolution = LINES_PER_REVOLUTION;
    settings.device.catheter_radius_px = 4;
    settings.device.internal_imaging_mask_px = 2;

    let rec = &mut settings.reconstruction;
    rec.sector_size = 64;
    rec.frame_pool_slots = 8;
    rec.backend = BackendChoice::Cpu;

    settings.playback.base_period = Duration::ZERO;
    settings
}

/// Build a context for `source` and start the pipeline on the CPU backend.
pub fn start(settings: Settings, source: Box<dyn DataSource>) -> (Pipeline, EventStreams) {
    let (events, streams) = EventBus::new(1024);
    let device = StaticDevice(settings.device.clone());
    let ctx = PipelineContext::new(settings.clone(), &device, source.policy(), events)
        .expect("context");
    let backend = create_backend(&settings.reconstruction, ctx.frame_shape()).expect("backend");
    let pipeline = Pipeline::start(ctx, source, backend).expect("start");
    (pipeline, streams)
}

/// Poll `condition` every millisecond for up to `limit`.
pub fn wait_for(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}
