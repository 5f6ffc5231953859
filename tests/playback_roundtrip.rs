//! Record raw buffers from a live run, then replay them without loss.

mod common;

use std::time::Duration;

use common::{small_settings, start, wait_for, LINES_PER_BUFFER, LINES_PER_REVOLUTION, RECORD};
use rust_oct::acquisition::{CaptureReader, PlaybackManager, RecordingSource, SimulatedDaq};
use rust_oct::error_recovery::{RetryPolicy, Supervisor};
use rust_oct::pipeline::PipelineStatus;
use oct_pool::OverflowPolicy;

#[test]
fn test_capture_then_replay_every_buffer() {
    let dir = tempfile::tempdir().unwrap();
    let capture = dir.path().join("session.capture");
    let settings = small_settings();

    // Live run with raw recording.
    let source = RecordingSource::new(Box::new(SimulatedDaq::new(21).unpaced()), &capture);
    let (live, _streams) = start(settings.clone(), Box::new(source));
    assert!(wait_for(Duration::from_secs(10), || live.frames_completed() >= 3));
    live.shutdown().unwrap();

    let reader = CaptureReader::open(&capture).unwrap();
    let buffers = reader.len();
    assert!(buffers >= 12, "only {buffers} buffers captured");
    assert_eq!(reader.header().record_len as usize, RECORD);
    assert_eq!(reader.header().lines_per_buffer as usize, LINES_PER_BUFFER);
    drop(reader);

    // Replay: backpressured, so every captured line is reconstructed.
    let manager = PlaybackManager::open(&capture, &settings.playback).unwrap();
    let handle = manager.handle();
    let (mut replay, _streams) = start(settings.clone(), Box::new(manager));
    assert_eq!(replay.context().raw_pool().policy(), OverflowPolicy::Backpressure);

    let mut supervisor = Supervisor::new(RetryPolicy::default(), 0);
    let mut finished = false;
    assert!(wait_for(Duration::from_secs(20), || {
        if !finished {
            finished = replay.supervise(&mut supervisor).unwrap() == PipelineStatus::Finished;
        }
        finished && replay.lines_processed() == (buffers * LINES_PER_BUFFER) as u64
    }));

    assert!(handle.is_finished());
    assert_eq!(handle.position(), buffers);
    let expected_frames = (buffers * LINES_PER_BUFFER) as u64 / u64::from(LINES_PER_REVOLUTION);
    assert_eq!(replay.frames_completed() + replay.frames_dropped(), expected_frames);
    replay.shutdown().unwrap();
}

#[test]
fn test_playback_rejects_mismatched_settings() {
    let dir = tempfile::tempdir().unwrap();
    let capture = dir.path().join("short.capture");
    let settings = small_settings();

    let source = RecordingSource::new(Box::new(SimulatedDaq::new(22).unpaced()), &capture);
    let (live, _streams) = start(settings.clone(), Box::new(source));
    assert!(wait_for(Duration::from_secs(10), || live.frames_completed() >= 1));
    live.shutdown().unwrap();

    let mut other = settings.clone();
    other.acquisition.lines_per_buffer = 32;
    let manager = PlaybackManager::open(&capture, &other.playback).unwrap();
    let (events, _streams) = rust_oct::events::EventBus::new(8);
    let device = rust_oct::device::StaticDevice(other.device.clone());
    let ctx = rust_oct::pipeline::PipelineContext::new(
        other.clone(),
        &device,
        OverflowPolicy::Backpressure,
        events,
    )
    .unwrap();
    let backend =
        rust_oct::reconstruction::create_backend(&other.reconstruction, ctx.frame_shape()).unwrap();
    let err = rust_oct::pipeline::Pipeline::start(ctx, Box::new(manager), backend).unwrap_err();
    assert!(matches!(err, rust_oct::OctError::Playback(_)));
}
