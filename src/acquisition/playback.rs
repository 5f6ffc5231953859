//! Replay of a raw capture through the live pipeline.
//!
//! The manager is owned by the producer thread; a [`PlaybackHandle`] lets any
//! other thread pause, resume, seek, loop or change speed. Speed maps to the
//! interval between buffers (`base_period / speed`); a speed of zero pauses.
//! Playback never drops buffers: it asks for a backpressured raw pool and
//! simply waits when reconstruction falls behind.

use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::capture::{CaptureHeader, CaptureReader};
use super::{Acquired, AcquisitionParams, DataSource};
use crate::config::PlaybackConfig;
use crate::data::RawBuffer;
use crate::error::{AppResult, OctError};
use oct_pool::OverflowPolicy;

/// Longest sleep while paused, so control changes apply promptly.
const PAUSE_POLL: Duration = Duration::from_millis(5);

#[derive(Debug)]
struct PlaybackShared {
    paused: AtomicBool,
    looped: AtomicBool,
    finished: AtomicBool,
    position: AtomicUsize,
    seek: Mutex<Option<usize>>,
    speed: Mutex<f64>,
    len: usize,
}

/// Remote control for a [`PlaybackManager`].
#[derive(Debug, Clone)]
pub struct PlaybackHandle(Arc<PlaybackShared>);

impl PlaybackHandle {
    /// Resume delivery.
    pub fn play(&self) {
        self.0.paused.store(false, Ordering::Release);
    }

    /// Hold delivery; the source reports `Empty`.
    pub fn pause(&self) {
        self.0.paused.store(true, Ordering::Release);
    }

    /// Whether delivery is held.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.0.paused.load(Ordering::Acquire)
    }

    /// Jump to buffer `index` (clamped to the capture). Also clears the
    /// finished state.
    pub fn seek(&self, index: usize) {
        *self.0.seek.lock() = Some(index.min(self.0.len.saturating_sub(1)));
        self.0.finished.store(false, Ordering::Release);
    }

    /// Playback speed multiplier; 0 pauses.
    pub fn set_speed(&self, speed: f64) {
        *self.0.speed.lock() = speed.max(0.0);
    }

    /// Current speed multiplier.
    #[must_use]
    pub fn speed(&self) -> f64 {
        *self.0.speed.lock()
    }

    /// Restart from the beginning at the end of the capture.
    pub fn set_looped(&self, looped: bool) {
        self.0.looped.store(looped, Ordering::Release);
    }

    /// Next buffer to be delivered.
    #[must_use]
    pub fn position(&self) -> usize {
        self.0.position.load(Ordering::Acquire)
    }

    /// Buffers in the capture.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len
    }

    /// True when empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.len == 0
    }

    /// True once the last buffer was delivered and looping is off.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.0.finished.load(Ordering::Acquire)
    }
}

/// Replays a capture file as a [`DataSource`].
pub struct PlaybackManager {
    reader: CaptureReader,
    shared: Arc<PlaybackShared>,
    base_period: Duration,
    last_delivery: Option<Instant>,
    delivered: u64,
}

impl std::fmt::Debug for PlaybackManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackManager")
            .field("reader", &self.reader)
            .field("position", &self.shared.position.load(Ordering::Relaxed))
            .field("delivered", &self.delivered)
            .finish()
    }
}

impl PlaybackManager {
    /// Open a capture for playback.
    pub fn open(path: &Path, config: &PlaybackConfig) -> AppResult<Self> {
        let reader = CaptureReader::open(path)?;
        if reader.is_empty() {
            return Err(OctError::Playback(format!(
                "{} holds no complete buffers",
                path.display()
            )));
        }
        info!(
            path = %path.display(),
            buffers = reader.len(),
            speed = config.speed,
            looped = config.looped,
            "Playback opened"
        );
        let shared = Arc::new(PlaybackShared {
            paused: AtomicBool::new(false),
            looped: AtomicBool::new(config.looped),
            finished: AtomicBool::new(false),
            position: AtomicUsize::new(0),
            seek: Mutex::new(None),
            speed: Mutex::new(config.speed.max(0.0)),
            len: reader.len(),
        });
        Ok(Self {
            reader,
            shared,
            base_period: config.base_period,
            last_delivery: None,
            delivered: 0,
        })
    }

    /// Control handle shared with the UI side.
    #[must_use]
    pub fn handle(&self) -> PlaybackHandle {
        PlaybackHandle(Arc::clone(&self.shared))
    }

    /// Capture header.
    #[must_use]
    pub fn header(&self) -> CaptureHeader {
        self.reader.header()
    }

    /// Buffers delivered so far.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Interval between buffers at the current speed, `None` when paused.
    fn interval(&self) -> Option<Duration> {
        let speed = *self.shared.speed.lock();
        if speed <= 0.0 || self.shared.paused.load(Ordering::Acquire) {
            return None;
        }
        Some(self.base_period.div_f64(speed))
    }

    /// Resolve a pending seek and end-of-capture. `None` when finished.
    fn next_position(&mut self) -> Option<usize> {
        if let Some(target) = self.shared.seek.lock().take() {
            debug!(from = self.shared.position.load(Ordering::Relaxed), to = target, "Playback seek");
            self.shared.position.store(target, Ordering::Release);
            self.last_delivery = None;
        }
        let position = self.shared.position.load(Ordering::Acquire);
        if position < self.reader.len() {
            return Some(position);
        }
        if self.shared.looped.load(Ordering::Acquire) {
            debug!(buffers = self.reader.len(), "Playback looping");
            self.shared.position.store(0, Ordering::Release);
            return Some(0);
        }
        if !self.shared.finished.swap(true, Ordering::AcqRel) {
            info!(delivered = self.delivered, "Playback reached end of capture");
        }
        None
    }
}

impl DataSource for PlaybackManager {
    fn name(&self) -> &str {
        "playback"
    }

    fn configure(&mut self, params: &AcquisitionParams) -> AppResult<()> {
        let expected = CaptureHeader::from_params(params);
        if expected != self.reader.header() {
            return Err(OctError::Playback(format!(
                "capture {:?} does not match acquisition settings {:?}",
                self.reader.header(),
                expected
            )));
        }
        self.last_delivery = None;
        Ok(())
    }

    fn acquire_next(&mut self, buffer: &mut RawBuffer, timeout: Duration) -> AppResult<Acquired> {
        let Some(interval) = self.interval() else {
            thread::sleep(timeout.min(PAUSE_POLL));
            return Ok(Acquired::Empty);
        };
        let Some(position) = self.next_position() else {
            thread::sleep(timeout.min(PAUSE_POLL));
            return Ok(Acquired::Empty);
        };

        if let Some(last) = self.last_delivery {
            let due = last + interval;
            let now = Instant::now();
            if due > now {
                let wait = due - now;
                if wait > timeout {
                    thread::sleep(timeout);
                    return Ok(Acquired::Empty);
                }
                thread::sleep(wait);
            }
        }

        self.reader.read_into(position, buffer)?;
        buffer.acquired_at = Some(Instant::now());
        self.last_delivery = buffer.acquired_at;
        self.shared.position.store(position + 1, Ordering::Release);
        self.delivered += 1;
        Ok(Acquired::Filled)
    }

    fn policy(&self) -> OverflowPolicy {
        OverflowPolicy::Backpressure
    }

    fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::capture::CaptureWriter;

    fn header() -> CaptureHeader {
        CaptureHeader {
            record_len: 4,
            encoder_len: 3,
            lines_per_buffer: 2,
        }
    }

    fn params() -> AcquisitionParams {
        AcquisitionParams {
            record_length: 4,
            encoder_record_length: 3,
            lines_per_buffer: 2,
            lines_per_revolution: 8,
            line_rate_hz: 1_000.0,
            rotation_hz: 10.0,
        }
    }

    fn capture(dir: &Path, buffers: u64) -> std::path::PathBuf {
        let path = dir.join("replay.capture");
        let mut writer = CaptureWriter::create(&path, header()).unwrap();
        let mut raw = RawBuffer::with_shape(2, 4, 3);
        raw.valid_lines = 2;
        for seq in 0..buffers {
            raw.sequence = seq;
            writer.write_buffer(&raw).unwrap();
        }
        writer.finish().unwrap();
        path
    }

    fn fast() -> PlaybackConfig {
        PlaybackConfig {
            speed: 1.0,
            looped: false,
            base_period: Duration::ZERO,
        }
    }

    fn drain(manager: &mut PlaybackManager, max: usize) -> Vec<u64> {
        let mut raw = RawBuffer::with_shape(2, 4, 3);
        let mut seen = Vec::new();
        for _ in 0..max {
            if manager.acquire_next(&mut raw, Duration::from_millis(20)).unwrap() == Acquired::Filled {
                seen.push(raw.sequence);
            }
        }
        seen
    }

    #[test]
    fn test_plays_every_buffer_then_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = PlaybackManager::open(&capture(dir.path(), 4), &fast()).unwrap();
        manager.configure(&params()).unwrap();

        assert_eq!(drain(&mut manager, 6), vec![0, 1, 2, 3]);
        assert!(manager.is_finished());
        assert_eq!(manager.delivered(), 4);
    }

    #[test]
    fn test_loop_and_seek() {
        let dir = tempfile::tempdir().unwrap();
        let config = PlaybackConfig {
            looped: true,
            ..fast()
        };
        let mut manager = PlaybackManager::open(&capture(dir.path(), 3), &config).unwrap();
        manager.configure(&params()).unwrap();
        assert_eq!(drain(&mut manager, 5), vec![0, 1, 2, 0, 1]);

        let handle = manager.handle();
        handle.seek(99);
        assert_eq!(drain(&mut manager, 2), vec![2, 0]);
        assert!(!manager.is_finished());
    }

    #[test]
    fn test_pause_and_zero_speed_deliver_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = PlaybackManager::open(&capture(dir.path(), 2), &fast()).unwrap();
        manager.configure(&params()).unwrap();
        let handle = manager.handle();

        handle.pause();
        assert!(drain(&mut manager, 3).is_empty());
        handle.play();
        handle.set_speed(0.0);
        assert!(drain(&mut manager, 3).is_empty());
        handle.set_speed(2.0);
        assert_eq!(drain(&mut manager, 1), vec![0]);
        assert_eq!(handle.position(), 1);
    }

    #[test]
    fn test_speed_sets_interval() {
        let dir = tempfile::tempdir().unwrap();
        let config = PlaybackConfig {
            base_period: Duration::from_millis(40),
            ..fast()
        };
        let mut manager = PlaybackManager::open(&capture(dir.path(), 2), &config).unwrap();
        manager.configure(&params()).unwrap();
        let handle = manager.handle();
        let mut raw = RawBuffer::with_shape(2, 4, 3);

        // First buffer is immediate; the second is due 40 ms later, which a
        // 5 ms wait does not reach.
        let short = Duration::from_millis(5);
        assert_eq!(manager.acquire_next(&mut raw, short).unwrap(), Acquired::Filled);
        assert_eq!(manager.acquire_next(&mut raw, short).unwrap(), Acquired::Empty);

        handle.set_speed(100.0);
        assert_eq!(manager.acquire_next(&mut raw, short).unwrap(), Acquired::Filled);
    }

    #[test]
    fn test_configure_rejects_other_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = PlaybackManager::open(&capture(dir.path(), 1), &fast()).unwrap();
        let mut other = params();
        other.record_length = 8;
        assert!(matches!(manager.configure(&other), Err(OctError::Playback(_))));
        assert_eq!(manager.policy(), OverflowPolicy::Backpressure);
    }
}
