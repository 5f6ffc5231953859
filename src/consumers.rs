//! Frame consumers.
//!
//! Renderers, recorders and monitors read the newest completed frame from the
//! frame pool on their own thread. They only ever borrow a frame for the
//! length of one [`FrameConsumer::consume`] call and never hold it across the
//! next completion, so the lossy frame pool can keep overwriting older slots.

use parking_lot::Mutex;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::data::ReconstructedFrame;
use crate::error::{AppResult, OctError};
use oct_pool::SlotPool;

/// Something that wants every completed frame it can get.
pub trait FrameConsumer: Send {
    /// Name used in logs and reports.
    fn name(&self) -> &str;

    /// Called with each new frame. Transient errors skip the frame; fatal
    /// ones stop the consumer.
    fn consume(&mut self, frame: &ReconstructedFrame) -> AppResult<()>;

    /// Flush and close. Called once when the consumer thread exits.
    fn finish(&mut self) -> AppResult<()> {
        Ok(())
    }
}

/// Summary of one consumer thread's run.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerReport {
    /// Consumer name from [`FrameConsumer::name`].
    pub name: String,
    /// Frames handed to the consumer.
    pub frames: u64,
    /// Frames that completed between two reads and were never seen.
    pub missed: u64,
    /// Frames whose `consume` call failed.
    pub errors: u64,
    /// Wall time the consumer thread ran.
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}

impl ConsumerReport {
    /// Frames consumed per second over the whole run.
    #[must_use]
    pub fn mean_fps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.frames as f64 / secs
        } else {
            0.0
        }
    }
}

/// Running consumer thread.
pub struct ConsumerHandle {
    name: String,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<AppResult<ConsumerReport>>,
}

impl std::fmt::Debug for ConsumerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerHandle")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

impl ConsumerHandle {
    /// False once the thread has exited.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stop the thread and collect its report.
    pub fn join(self) -> AppResult<ConsumerReport> {
        self.stop.store(true, Ordering::Release);
        self.handle
            .join()
            .map_err(|_| OctError::ThreadPanicked(self.name))?
    }
}

/// Run `consumer` on its own thread, polling `pool` for the newest frame
/// every `poll`.
pub fn spawn_consumer<C>(
    mut consumer: C,
    pool: Arc<SlotPool<ReconstructedFrame>>,
    poll: Duration,
) -> AppResult<ConsumerHandle>
where
    C: FrameConsumer + 'static,
{
    let name = consumer.name().to_string();
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = Arc::clone(&stop);
    let thread_name = name.clone();
    let handle = thread::Builder::new()
        .name(format!("oct-consumer-{name}"))
        .spawn(move || {
            let started = Instant::now();
            let mut report = ConsumerReport {
                name: thread_name,
                frames: 0,
                missed: 0,
                errors: 0,
                elapsed: Duration::ZERO,
            };
            let mut last_seen = 0u64;
            let mut failure = None;

            while !thread_stop.load(Ordering::Acquire) {
                if let Some(frame) = pool.latest() {
                    let count = frame.frame_count;
                    if count > last_seen {
                        if last_seen > 0 {
                            report.missed += count - last_seen - 1;
                        }
                        last_seen = count;
                        match consumer.consume(&frame) {
                            Ok(()) => report.frames += 1,
                            Err(err) if err.is_fatal() => {
                                failure = Some(err);
                                break;
                            }
                            Err(err) => {
                                report.errors += 1;
                                warn!(consumer = %report.name, error = %err, "Frame skipped");
                            }
                        }
                        continue;
                    }
                }
                thread::sleep(poll);
            }

            let finished = consumer.finish();
            report.elapsed = started.elapsed();
            info!(
                consumer = %report.name,
                frames = report.frames,
                missed = report.missed,
                fps = report.mean_fps(),
                "Consumer stopped"
            );
            if let Some(err) = failure {
                return Err(err);
            }
            finished.map(|()| report)
        })?;
    Ok(ConsumerHandle { name, stop, handle })
}

/// Logs the frame rate at a fixed interval.
#[derive(Debug)]
pub struct FrameRateMonitor {
    interval: Duration,
    window_start: Option<Instant>,
    window_frames: u64,
    last_fps: Arc<Mutex<Option<f64>>>,
}

impl FrameRateMonitor {
    /// Log the frame rate once per `interval`.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            window_start: None,
            window_frames: 0,
            last_fps: Arc::new(Mutex::new(None)),
        }
    }

    /// Rate measured over the last full interval, readable from any thread.
    #[must_use]
    pub fn fps_handle(&self) -> Arc<Mutex<Option<f64>>> {
        Arc::clone(&self.last_fps)
    }
}

impl FrameConsumer for FrameRateMonitor {
    fn name(&self) -> &str {
        "fps"
    }

    fn consume(&mut self, frame: &ReconstructedFrame) -> AppResult<()> {
        let now = Instant::now();
        let start = *self.window_start.get_or_insert(now);
        self.window_frames += 1;
        let elapsed = now - start;
        if elapsed >= self.interval && !elapsed.is_zero() {
            let fps = self.window_frames as f64 / elapsed.as_secs_f64();
            info!(
                fps,
                frame = frame.frame_count,
                encoder_position = frame.encoder_position,
                "Frame rate"
            );
            *self.last_fps.lock() = Some(fps);
            self.window_start = Some(now);
            self.window_frames = 0;
        }
        Ok(())
    }
}

/// One line of the recorder's metadata file.
#[derive(Debug, Serialize)]
struct FrameRecord {
    frame_count: u64,
    timestamp: chrono::DateTime<chrono::Utc>,
    millis: u64,
    encoder_position: f64,
    display_angle_deg: f32,
    lines: usize,
    depth: usize,
    sector_size: usize,
}

/// Writes each frame's polar bytes and video bytes to flat files plus a
/// JSON-lines metadata index, for muxing by an external video tool.
pub struct CaptureRecorder {
    dir: PathBuf,
    polar: BufWriter<File>,
    video: BufWriter<File>,
    index: BufWriter<File>,
    frames: u64,
}

impl std::fmt::Debug for CaptureRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureRecorder")
            .field("dir", &self.dir)
            .field("frames", &self.frames)
            .finish()
    }
}

impl CaptureRecorder {
    /// Polar (pre-warp) frame data, one frame after another.
    pub const POLAR_FILE: &'static str = "polar.raw";
    /// Video bytes, one frame after another.
    pub const VIDEO_FILE: &'static str = "video.raw";
    /// One JSON line of frame metadata per recorded frame.
    pub const INDEX_FILE: &'static str = "frames.jsonl";

    /// Create `dir` if needed and open the three output files.
    pub fn create(dir: &Path) -> AppResult<Self> {
        std::fs::create_dir_all(dir)?;
        let open = |name: &str| -> AppResult<BufWriter<File>> {
            Ok(BufWriter::new(File::create(dir.join(name))?))
        };
        info!(dir = %dir.display(), "Frame recorder initialized");
        Ok(Self {
            dir: dir.to_path_buf(),
            polar: open(Self::POLAR_FILE)?,
            video: open(Self::VIDEO_FILE)?,
            index: open(Self::INDEX_FILE)?,
            frames: 0,
        })
    }

    /// Frames written so far.
    #[must_use]
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Output directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl FrameConsumer for CaptureRecorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn consume(&mut self, frame: &ReconstructedFrame) -> AppResult<()> {
        let shape = frame.shape();
        self.polar.write_all(&frame.raw_data)?;
        self.video.write_all(&frame.video_bytes)?;
        let record = FrameRecord {
            frame_count: frame.frame_count,
            timestamp: frame.timestamp,
            millis: frame.millis,
            encoder_position: frame.encoder_position,
            display_angle_deg: frame.display_angle_deg,
            lines: shape.lines,
            depth: shape.depth,
            sector_size: shape.sector_size,
        };
        serde_json::to_writer(&mut self.index, &record)
            .map_err(|e| OctError::Io(std::io::Error::other(e)))?;
        self.index.write_all(b"\n")?;
        self.frames += 1;
        debug!(frame = frame.frame_count, "Frame recorded");
        Ok(())
    }

    fn finish(&mut self) -> AppResult<()> {
        self.polar.flush()?;
        self.video.flush()?;
        self.index.flush()?;
        info!(dir = %self.dir.display(), frames = self.frames, "Frame recorder closed");
        Ok(())
    }
}
