//! Typed pipeline events.
//!
//! One bounded channel per event kind, so a consumer that only watches
//! frames never has to wade through direction updates. Senders never block:
//! if a receiver falls behind, the event is dropped and counted, the same
//! policy the ring buffer taps use for slow visualisation consumers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::angle::Direction;
use crate::error::{OctError, Severity};

/// Default channel capacity per event kind.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// A reconstructed frame was committed to the frame pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameReady {
    /// Frame pool slot holding the frame.
    pub index: usize,
    /// Frame sequence number.
    pub frame_count: u64,
}

/// Requests the pipeline sends upstream to the acquisition side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// The source looks hung; stop, reconfigure and restart it.
    AcquisitionResetRequired,
    /// Ask the light source to attenuate (true) or restore (false).
    AttenuateSource(bool),
}

/// A fault raised on a pipeline thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineFault {
    /// Pipeline stage that reported the fault.
    pub stage: &'static str,
    /// How the pipeline treats the fault.
    pub severity: Severity,
    /// Rendered error message.
    pub message: String,
}

impl PipelineFault {
    /// Capture an error's message and severity.
    #[must_use]
    pub fn from_error(stage: &'static str, err: &OctError) -> Self {
        Self {
            stage,
            severity: err.severity(),
            message: err.to_string(),
        }
    }
}

/// Sending half. Cheap to clone; one clone per pipeline thread.
#[derive(Debug, Clone)]
pub struct EventBus {
    frame_ready: mpsc::Sender<FrameReady>,
    raw_available: mpsc::Sender<usize>,
    direction: mpsc::Sender<Direction>,
    rotation: mpsc::Sender<u64>,
    control: mpsc::Sender<ControlEvent>,
    faults: mpsc::Sender<PipelineFault>,
    dropped: Arc<AtomicU64>,
}

/// Receiving half, one receiver per event kind.
#[derive(Debug)]
pub struct EventStreams {
    /// Slot and count of each completed frame.
    pub frame_ready: mpsc::Receiver<FrameReady>,
    /// Raw buffers waiting in the raw pool after each commit.
    pub raw_available: mpsc::Receiver<usize>,
    /// Rotation direction changes.
    pub direction: mpsc::Receiver<Direction>,
    /// Running count of completed catheter revolutions.
    pub rotation: mpsc::Receiver<u64>,
    /// Requests to the acquisition side.
    pub control: mpsc::Receiver<ControlEvent>,
    /// Errors reported by any stage.
    pub faults: mpsc::Receiver<PipelineFault>,
}

impl EventBus {
    /// Create a bus whose channels each buffer `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, EventStreams) {
        let capacity = capacity.max(1);
        let (frame_tx, frame_rx) = mpsc::channel(capacity);
        let (raw_tx, raw_rx) = mpsc::channel(capacity);
        let (dir_tx, dir_rx) = mpsc::channel(capacity);
        let (rot_tx, rot_rx) = mpsc::channel(capacity);
        let (ctl_tx, ctl_rx) = mpsc::channel(capacity);
        let (fault_tx, fault_rx) = mpsc::channel(capacity);

        (
            Self {
                frame_ready: frame_tx,
                raw_available: raw_tx,
                direction: dir_tx,
                rotation: rot_tx,
                control: ctl_tx,
                faults: fault_tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            EventStreams {
                frame_ready: frame_rx,
                raw_available: raw_rx,
                direction: dir_rx,
                rotation: rot_rx,
                control: ctl_rx,
                faults: fault_rx,
            },
        )
    }

    /// A frame was committed to the frame pool.
    pub fn frame_ready(&self, index: usize, frame_count: u64) {
        self.emit(&self.frame_ready, FrameReady { index, frame_count });
    }

    /// A raw buffer was committed; `count` buffers are now waiting.
    pub fn raw_buffer_available(&self, count: usize) {
        self.emit(&self.raw_available, count);
    }

    /// The catheter changed rotation direction.
    pub fn direction_changed(&self, direction: Direction) {
        self.emit(&self.direction, direction);
    }

    /// One more revolution completed.
    pub fn full_rotation_completed(&self, revolutions: u64) {
        self.emit(&self.rotation, revolutions);
    }

    /// Ask the acquisition side to reset the board.
    pub fn acquisition_reset_required(&self) {
        self.emit(&self.control, ControlEvent::AcquisitionResetRequired);
    }

    /// Ask the acquisition side to attenuate (or restore) the light source.
    pub fn attenuate_source(&self, attenuate: bool) {
        self.emit(&self.control, ControlEvent::AttenuateSource(attenuate));
    }

    /// Report a fault from `stage`.
    pub fn fault(&self, stage: &'static str, err: &OctError) {
        self.emit(&self.faults, PipelineFault::from_error(stage, err));
    }

    /// Events discarded because a receiver was full or gone.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn emit<T>(&self, tx: &mpsc::Sender<T>, value: T) {
        if tx.try_send(value).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl EventStreams {
    /// Everything currently queued on `rx`, without waiting.
    pub fn drain<T>(rx: &mut mpsc::Receiver<T>) -> Vec<T> {
        let mut out = Vec::new();
        while let Ok(value) = rx.try_recv() {
            out.push(value);
        }
        out
    }
}
